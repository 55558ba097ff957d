//! End-to-end engine tests against the in-memory store and a scripted
//! provider, driven under paused tokio time so retry backoffs and completion
//! delays run instantly.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_test::assert_ok;

use dispatch_core::config::DispatchConfig;
use dispatch_core::dispatch::{
    AuthContext, BatchCoordinator, CreateBatch, MessageProvider, Priority, ProviderError,
    ProviderResponse, RateLimitInfo, Recipient,
};
use dispatch_core::state_machine::{BatchStatus, MessageStatus};
use dispatch_core::storage::MemoryStore;

/// One scripted provider behavior for a single call.
#[derive(Clone, Copy)]
enum Step {
    Ok,
    Http(u16),
    Hang,
    Conn,
    Panic,
}

/// Provider with a per-phone script; unscripted phones (or exhausted scripts)
/// succeed.
#[derive(Default)]
struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn script(&self, phone: &str, steps: Vec<Step>) {
        self.scripts.lock().insert(phone.to_string(), steps.into());
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProvider for ScriptedProvider {
    async fn send(
        &self,
        phone: &str,
        _text: &str,
        _auth: &AuthContext,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .scripts
            .lock()
            .get_mut(phone)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok);

        match step {
            Step::Ok => Ok(ProviderResponse {
                provider_message_id: format!("SM-{phone}"),
                accepted_at: chrono::Utc::now(),
            }),
            Step::Http(status) => Err(ProviderError::Http {
                status,
                body: None,
                rate_limit: (status == 429).then(|| RateLimitInfo {
                    limit: Some("10".to_string()),
                    remaining: Some("0".to_string()),
                    reset: Some("60".to_string()),
                }),
            }),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(7 * 24 * 3600)).await;
                Err(ProviderError::Connection("hung".to_string()))
            }
            Step::Conn => Err(ProviderError::Connection("refused".to_string())),
            Step::Panic => panic!("provider exploded"),
        }
    }
}

/// Provider that blocks each call on a semaphore permit.
struct GatedProvider {
    gate: Arc<Semaphore>,
    calls: AtomicU32,
}

impl GatedProvider {
    fn new() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Arc::new(Self {
                gate: gate.clone(),
                calls: AtomicU32::new(0),
            }),
            gate,
        )
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProvider for GatedProvider {
    async fn send(
        &self,
        phone: &str,
        _text: &str,
        _auth: &AuthContext,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ProviderError::Connection("gate closed".to_string()))?;
        permit.forget();
        Ok(ProviderResponse {
            provider_message_id: format!("SM-{phone}"),
            accepted_at: chrono::Utc::now(),
        })
    }
}

fn coordinator_with(provider: Arc<dyn MessageProvider>) -> BatchCoordinator {
    BatchCoordinator::new(provider, Arc::new(MemoryStore::new()), DispatchConfig::default())
}

fn phone(n: u32) -> String {
    format!("1555000{n:04}")
}

fn request(phones: &[String], priority: Priority) -> CreateBatch {
    CreateBatch {
        template: "Hi {{name}}".to_string(),
        recipients: phones
            .iter()
            .map(|p| Recipient {
                phone: p.clone(),
                variables: serde_json::json!({"name": p}),
            })
            .collect(),
        priority,
        auth: Some(AuthContext::new("acct", "token")),
        scheduled_at: None,
        auto_start: false,
    }
}

/// Poll the coordinator until the batch reaches a terminal status.
async fn wait_terminal(coordinator: &BatchCoordinator, batch_id: uuid::Uuid) -> dispatch_core::Batch {
    for _ in 0..100_000 {
        let state = coordinator.get_state(batch_id).await.unwrap();
        if state.status.is_terminal() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch never finalized");
}

/// Poll until `check` returns true.
async fn wait_until<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..100_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never met: {what}");
}

#[tokio::test(start_paused = true)]
async fn test_mixed_batch_final_breakdown() {
    let provider = Arc::new(ScriptedProvider::default());
    let phones: Vec<String> = (0..10).map(phone).collect();
    // Two recipients are rejected with a permanent HTTP 400
    provider.script(&phones[3], vec![Step::Http(400)]);
    provider.script(&phones[7], vec![Step::Http(400)]);

    let coordinator = coordinator_with(provider.clone());
    let mut events = coordinator.subscribe();

    let batch = coordinator
        .create_batch(request(&phones, Priority::Normal))
        .await
        .unwrap();
    assert_ok!(coordinator.start(batch.batch_id, None).await);

    let state = wait_terminal(&coordinator, batch.batch_id).await;
    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.completed, 8);
    assert_eq!(state.failed, 2);
    assert_eq!(state.pending, 0);
    assert_eq!(state.processing, 0);
    assert!(state.counters_consistent());
    assert_eq!(state.error_count("invalid_request"), 2);
    assert_eq!(state.credits_used, 8);
    assert!((state.success_rate - 80.0).abs() < 1e-9);

    // Permanent errors are not retried: exactly one call per recipient
    assert_eq!(provider.call_count(), 10);

    // A completion event was broadcast
    let mut saw_complete = false;
    while let Ok(event) = events.try_recv() {
        if event.kind == dispatch_core::EventKind::Complete {
            assert_eq!(event.batch_id, batch.batch_id);
            saw_complete = true;
        }
    }
    assert!(saw_complete);

    // Per-message audit rows
    let failed_rows = coordinator
        .get_results(batch.batch_id, Some(MessageStatus::Failed), 100, 0)
        .await
        .unwrap();
    assert_eq!(failed_rows.len(), 2);
    assert!(failed_rows
        .iter()
        .all(|m| m.error_category.as_deref() == Some("invalid_request")));
}

#[tokio::test(start_paused = true)]
async fn test_all_timeouts_finalize_batch_failed() {
    let provider = Arc::new(ScriptedProvider::default());
    let target = phone(1);
    provider.script(&target, vec![Step::Hang, Step::Hang, Step::Hang]);

    let coordinator = coordinator_with(provider.clone());
    let batch = coordinator
        .create_batch(request(&[target.clone()], Priority::Normal))
        .await
        .unwrap();
    coordinator.start(batch.batch_id, None).await.unwrap();

    let state = wait_terminal(&coordinator, batch.batch_id).await;
    assert_eq!(state.status, BatchStatus::Failed);
    assert_eq!(state.failed, 1);
    assert_eq!(state.completed, 0);
    assert_eq!(state.error_count("max_retries"), 1);
    assert_eq!(provider.call_count(), 3);

    let rows = coordinator
        .get_results(batch.batch_id, Some(MessageStatus::Failed), 10, 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].error_category.as_deref(), Some("max_retries"));
    assert_eq!(rows[0].attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_send_settles_message_and_finalizes() {
    let provider = Arc::new(ScriptedProvider::default());
    let target = phone(6);
    provider.script(&target, vec![Step::Panic]);

    let coordinator = coordinator_with(provider.clone());
    let batch = coordinator
        .create_batch(request(&[target.clone()], Priority::Normal))
        .await
        .unwrap();
    coordinator.start(batch.batch_id, None).await.unwrap();

    // The crashed send must not leave the message stuck in processing
    let state = wait_terminal(&coordinator, batch.batch_id).await;
    assert_eq!(state.status, BatchStatus::Failed);
    assert_eq!(state.failed, 1);
    assert_eq!(state.completed, 0);
    assert_eq!(state.processing, 0);
    assert!(state.counters_consistent());
    assert_eq!(state.error_count("system"), 1);

    let rows = coordinator
        .get_results(batch.batch_id, Some(MessageStatus::Failed), 10, 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].error_category.as_deref(), Some("system"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers_with_attempt_count() {
    let provider = Arc::new(ScriptedProvider::default());
    let target = phone(2);
    provider.script(&target, vec![Step::Conn, Step::Ok]);

    let coordinator = coordinator_with(provider.clone());
    let batch = coordinator
        .create_batch(request(&[target.clone()], Priority::High))
        .await
        .unwrap();
    coordinator.start(batch.batch_id, None).await.unwrap();

    let state = wait_terminal(&coordinator, batch.batch_id).await;
    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.completed, 1);

    let rows = coordinator
        .get_results(batch.batch_id, Some(MessageStatus::Completed), 10, 0)
        .await
        .unwrap();
    assert_eq!(rows[0].attempts, 2);
    assert_eq!(rows[0].provider_message_id.as_deref(), Some("SM-15550000002"));
    assert!(rows[0].sent_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_suppression_across_batches() {
    let provider = Arc::new(ScriptedProvider::default());
    let coordinator = coordinator_with(provider.clone());
    let target = phone(3);

    let first = coordinator
        .create_batch(request(&[target.clone()], Priority::Normal))
        .await
        .unwrap();
    coordinator.start(first.batch_id, None).await.unwrap();
    let state = wait_terminal(&coordinator, first.batch_id).await;
    assert_eq!(state.credits_used, 1);
    assert_eq!(provider.call_count(), 1);

    // Identical content to the same number inside the retention window is
    // suppressed without a provider call; the message still counts completed.
    let second = coordinator
        .create_batch(request(&[target.clone()], Priority::Normal))
        .await
        .unwrap();
    coordinator.start(second.batch_id, None).await.unwrap();
    let state = wait_terminal(&coordinator, second.batch_id).await;
    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.completed, 1);
    assert_eq!(state.error_count("duplicate_skip"), 1);
    assert_eq!(state.credits_used, 0);
    assert_eq!(provider.call_count(), 1);

    // Numbers on the bypass allow-list always send
    coordinator.set_bypass_list(vec![target.clone()]);
    let third = coordinator
        .create_batch(request(&[target.clone()], Priority::Normal))
        .await
        .unwrap();
    coordinator.start(third.batch_id, None).await.unwrap();
    let state = wait_terminal(&coordinator, third.batch_id).await;
    assert_eq!(state.credits_used, 1);
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_low_priority_pacing_floor() {
    let provider = Arc::new(ScriptedProvider::default());
    let coordinator = coordinator_with(provider.clone());
    let phones: Vec<String> = (10..14).map(phone).collect();

    let batch = coordinator
        .create_batch(request(&phones, Priority::Low))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    coordinator.start(batch.batch_id, None).await.unwrap();
    wait_until(|| provider.call_count() == 4, "all sends dispatched").await;

    // Three pacing gaps of 500ms separate the four dispatch starts
    assert!(started.elapsed() >= Duration::from_millis(3 * 500));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_message_is_deferred_once_then_delivered() {
    let provider = Arc::new(ScriptedProvider::default());
    let target = phone(4);
    // Exhausts its retries on 429, gets deferred, then succeeds
    provider.script(
        &target,
        vec![Step::Http(429), Step::Http(429), Step::Http(429), Step::Ok],
    );

    let coordinator = coordinator_with(provider.clone());
    let batch = coordinator
        .create_batch(request(&[target.clone()], Priority::Normal))
        .await
        .unwrap();
    coordinator.start(batch.batch_id, None).await.unwrap();

    let state = wait_terminal(&coordinator, batch.batch_id).await;
    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.completed, 1);
    assert_eq!(state.failed, 0);
    assert!(state.counters_consistent());
    assert_eq!(provider.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_pause_resume_without_resending() {
    let (provider, gate) = GatedProvider::new();
    let coordinator = coordinator_with(provider.clone());
    let phones: Vec<String> = (20..30).map(phone).collect();

    let batch = coordinator
        .create_batch(request(&phones, Priority::Normal))
        .await
        .unwrap();
    coordinator.start(batch.batch_id, None).await.unwrap();

    // First chunk of 5 is in flight, blocked on the gate
    wait_until(|| provider.call_count() == 5, "first chunk in flight").await;

    let paused = coordinator.pause(batch.batch_id).await.unwrap();
    assert_eq!(paused.status, BatchStatus::Paused);

    // In-flight sends finish after the pause; queued messages stay queued
    gate.add_permits(5);
    let mut settled = false;
    for _ in 0..10_000 {
        let state = coordinator.get_state(batch.batch_id).await.unwrap();
        if state.completed == 5 && state.processing == 0 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "in-flight sends never settled");

    let state = coordinator.get_state(batch.batch_id).await.unwrap();
    assert_eq!(state.status, BatchStatus::Paused);
    assert_eq!(state.completed, 5);
    assert_eq!(state.pending, 5);
    assert!(state.counters_consistent());
    assert_eq!(provider.call_count(), 5);

    // Resume drains the remaining five without re-sending the first five
    gate.add_permits(100);
    coordinator.resume(batch.batch_id, None).await.unwrap();

    let state = wait_terminal(&coordinator, batch.batch_id).await;
    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.completed, 10);
    assert_eq!(provider.call_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_queued_messages() {
    let (provider, gate) = GatedProvider::new();
    let coordinator = coordinator_with(provider.clone());
    let phones: Vec<String> = (40..50).map(phone).collect();

    let batch = coordinator
        .create_batch(request(&phones, Priority::Normal))
        .await
        .unwrap();
    coordinator.start(batch.batch_id, None).await.unwrap();
    wait_until(|| provider.call_count() == 5, "first chunk in flight").await;

    let cancelled = coordinator.cancel(batch.batch_id).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    gate.add_permits(100);

    // The queued half never reaches the provider
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(provider.call_count(), 5);

    let rows = coordinator
        .get_results(batch.batch_id, Some(MessageStatus::Cancelled), 100, 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_start_fires_at_schedule_time() {
    let provider = Arc::new(ScriptedProvider::default());
    let coordinator = coordinator_with(provider.clone());

    let mut req = request(&[phone(5)], Priority::Normal);
    req.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::seconds(300));
    let batch = coordinator.create_batch(req).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(provider.call_count(), 0);
    let state = coordinator.get_state(batch.batch_id).await.unwrap();
    assert_eq!(state.status, BatchStatus::Pending);

    let state = wait_terminal(&coordinator, batch.batch_id).await;
    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(provider.call_count(), 1);
}
