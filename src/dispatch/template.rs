//! Template rendering: `{{name}}` placeholders substituted from per-recipient
//! variables.

use serde::{Deserialize, Serialize};

/// A message template submitted with a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub body: String,
}

impl MessageTemplate {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Substitute `{{key}}` placeholders with the recipient's variables.
    ///
    /// Unknown placeholders are left verbatim; non-string values render via
    /// their JSON form without quotes.
    pub fn render(&self, variables: &serde_json::Value) -> String {
        render(&self.body, variables)
    }
}

/// Render a template body against a JSON object of variables.
pub fn render(body: &str, variables: &serde_json::Value) -> String {
    let Some(map) = variables.as_object() else {
        return body.to_string();
    };

    let mut rendered = body.to_string();
    for (key, value) in map {
        let placeholder = format!("{{{{{key}}}}}");
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}
