use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::AppState;
use crate::message::{build_killmail_message, MessageContext};
use crate::models::Killmail;
use crate::store::QueueKind;
use crate::tracker::{EvalContext, Tracker};
use crate::webhook::SendOutcome;
use crate::zkb::UpstreamError;

#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The run ended on one of its termination conditions.
    Completed { received: u32 },
    /// Another worker holds the ingest lock; nothing was done.
    LockBusy,
}

fn spawn_task(
    name: String,
    timeout: Duration,
    task: impl Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::time::timeout(timeout, task).await.is_err() {
            warn!("Task {} timed out", name);
        }
    })
}

/// One ingest run: pulls killmails from the upstream long-poll under the
/// fleet-wide ingest lock and fans each one out to every enabled tracker.
/// Any upstream anomaly ends the run cleanly.
pub async fn run_ingest(state: &Arc<AppState>) -> IngestOutcome {
    let lock_ttl = chrono::Duration::seconds(
        (state.config.max_duration_per_run + state.config.tasks_timeout) as i64,
    );
    let Some(_lock) = state.storage.try_lock("ingest", lock_ttl).await else {
        info!("Ingest already running elsewhere, skipping this run");
        return IngestOutcome::LockBusy;
    };

    let task_timeout = Duration::from_secs(state.config.tasks_timeout);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Give messages that failed transiently one more try, and pick up any
    // queue left non-empty by a previous run or restart.
    match state.storage.webhooks().await {
        Ok(webhooks) => {
            for webhook in webhooks.iter().filter(|w| w.is_enabled) {
                match state.storage.reset_failed_messages(webhook.id).await {
                    Ok(moved) if moved > 0 => {
                        info!("Webhook {}: retrying {} failed messages", webhook.id, moved)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Webhook {}: failed message reset failed: {}", webhook.id, e),
                }
                let pending = state
                    .storage
                    .queue_size(webhook.id, QueueKind::Main)
                    .await
                    .unwrap_or(0);
                if pending > 0 {
                    let state = state.clone();
                    let webhook_id = webhook.id;
                    tasks.push(spawn_task(
                        format!("send_webhook:{}", webhook_id),
                        task_timeout,
                        async move { drive_send(&state, webhook_id).await },
                    ));
                }
            }
        }
        Err(e) => warn!("Failed to load webhooks: {}", e),
    }

    let deadline = Instant::now() + Duration::from_secs(state.config.max_duration_per_run);
    let mut received = 0u32;
    loop {
        if received >= state.config.max_killmails_per_run {
            info!("Ingest run hit the killmail limit");
            break;
        }
        if Instant::now() >= deadline {
            info!("Ingest run hit the duration limit");
            break;
        }
        match state.zkb.listen().await {
            Ok(Some(killmail)) => {
                received += 1;
                info!("[Kill: {}] Received", killmail.id);
                tasks.extend(dispatch_killmail(state, &killmail, task_timeout).await);
            }
            Ok(None) => {
                info!("Upstream killmail queue is empty");
                break;
            }
            Err(UpstreamError::Codec(e)) => {
                debug!("Malformed upstream package, ending run: {}", e);
                break;
            }
            Err(e) => {
                warn!("Upstream anomaly, ending run: {}", e);
                break;
            }
        }
    }

    info!("Ingest run complete: {} killmails received", received);
    futures::future::join_all(tasks).await;
    IngestOutcome::Completed { received }
}

async fn dispatch_killmail(
    state: &Arc<AppState>,
    killmail: &Killmail,
    task_timeout: Duration,
) -> Vec<JoinHandle<()>> {
    let killmail_json = killmail.to_json();
    let mut tasks = Vec::new();

    let trackers = match state.storage.trackers().await {
        Ok(trackers) => trackers,
        Err(e) => {
            error!("Failed to load trackers: {}", e);
            Vec::new()
        }
    };
    for tracker in trackers.into_iter().filter(|t| t.is_enabled) {
        let state = state.clone();
        let json = killmail_json.clone();
        let tracker_id = tracker.id;
        tasks.push(spawn_task(
            format!("run_tracker:{}", tracker_id),
            task_timeout,
            async move { run_tracker(&state, tracker_id, &json).await },
        ));
    }

    if state.config.storing_killmails_enabled {
        let state = state.clone();
        let json = killmail_json.clone();
        tasks.push(spawn_task(
            format!("store_killmail:{}", killmail.id),
            task_timeout,
            async move { store_killmail(&state, &json).await },
        ));
    }

    tasks
}

/// Evaluates one tracker against one killmail and, on a match, renders and
/// enqueues the outbound message and kicks the webhook's sender.
pub async fn run_tracker(state: &Arc<AppState>, tracker_id: u64, killmail_json: &str) {
    let killmail = match Killmail::from_json(killmail_json) {
        Ok(killmail) => killmail,
        Err(e) => {
            error!("Tracker {}: undecodable killmail: {}", tracker_id, e);
            return;
        }
    };
    let tracker = match state.storage.tracker(tracker_id).await {
        Ok(Some(tracker)) if tracker.is_enabled => tracker,
        Ok(_) => {
            debug!("Tracker {} is gone or disabled", tracker_id);
            return;
        }
        Err(e) => {
            error!("Failed to load tracker {}: {}", tracker_id, e);
            return;
        }
    };

    let user_states = state.user_state_lookup().await;
    let ctx = EvalContext {
        universe: &state.universe,
        user_states: &user_states,
        killmail_max_age: state.killmail_max_age(),
        fleet_threshold: state.config.fleet_threshold,
    };
    let Some(matched) = tracker.process_killmail(&killmail, &ctx, false).await else {
        debug!("[Kill: {}] No match for tracker {}", killmail.id, tracker_id);
        return;
    };
    info!("[Kill: {}] Matched tracker '{}'", matched.id, tracker.name);

    enqueue_and_send(state, &tracker, &matched, None).await;
}

/// Renders the message, puts it on the webhook's main queue and drives the
/// sender. Used by the tracker pipeline and the operator test flow.
pub async fn enqueue_and_send(
    state: &Arc<AppState>,
    tracker: &Tracker,
    killmail: &Killmail,
    intro_text: Option<&str>,
) {
    let group_roles = state.storage.group_roles().await.unwrap_or_default();
    let ctx = MessageContext {
        universe: &state.universe,
        entities: &state.entities,
        group_roles: &group_roles,
        set_avatar: state.config.webhook_set_avatar,
    };
    let message = build_killmail_message(tracker, killmail, &ctx, intro_text).await;
    let payload = match serde_json::to_string(&message) {
        Ok(payload) => payload,
        Err(e) => {
            error!("[Kill: {}] Failed to serialize message: {}", killmail.id, e);
            return;
        }
    };
    if let Err(e) = state
        .storage
        .enqueue(tracker.webhook_id, QueueKind::Main, payload)
        .await
    {
        error!(
            "[Kill: {}] Failed to enqueue for webhook {}: {}",
            killmail.id, tracker.webhook_id, e
        );
        return;
    }
    drive_send(state, tracker.webhook_id).await;
}

/// Follows the sender's rescheduling decisions until the webhook's queue is
/// drained: sleeps through rate-limit blocks and transient backoff, backs
/// off briefly when another sender task holds the lock.
pub async fn drive_send(state: &Arc<AppState>, webhook_id: u64) {
    loop {
        match state.sender.send_queued(&state.storage, webhook_id).await {
            SendOutcome::Idle => break,
            SendOutcome::AlreadyRunning => {
                sleep(Duration::from_millis(500)).await;
                let pending = state
                    .storage
                    .queue_size(webhook_id, QueueKind::Main)
                    .await
                    .unwrap_or(0);
                if pending == 0 {
                    break;
                }
            }
            SendOutcome::Blocked(until) => {
                let wait = (until - Utc::now()).to_std().unwrap_or_default();
                debug!("Webhook {}: blocked for {:?}", webhook_id, wait);
                sleep(wait).await;
            }
            SendOutcome::RetryAfter(delay) => {
                debug!("Webhook {}: retrying in {:?}", webhook_id, delay);
                sleep(delay).await;
            }
        }
    }
}

pub async fn store_killmail(state: &Arc<AppState>, killmail_json: &str) {
    let killmail = match Killmail::from_json(killmail_json) {
        Ok(killmail) => killmail,
        Err(e) => {
            error!("Cannot archive undecodable killmail: {}", e);
            return;
        }
    };
    match state.storage.archive_killmail(&killmail).await {
        Ok(true) => debug!("[Kill: {}] Archived", killmail.id),
        Ok(false) => {}
        Err(e) => error!("[Kill: {}] Archiving failed: {}", killmail.id, e),
    }
}

/// Deletes archived killmails past the configured retention. A retention of
/// zero disables purging.
pub async fn purge_stale(state: &Arc<AppState>) -> usize {
    if state.config.purge_killmails_after_days == 0 {
        return 0;
    }
    let cutoff = Utc::now() - chrono::Duration::days(state.config.purge_killmails_after_days as i64);
    match state.storage.purge_killmails_older_than(cutoff).await {
        Ok(purged) => {
            if purged > 0 {
                info!("Purged {} stale killmails", purged);
            }
            purged
        }
        Err(e) => {
            error!("Purge failed: {}", e);
            0
        }
    }
}

/// Operator test flow: sends a synthetic notice, or a historical killmail
/// fetched by id, to the given webhook and drains the queue once.
pub async fn send_test(
    state: &Arc<AppState>,
    webhook_id: u64,
    killmail_id: Option<i64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let webhook = state
        .storage
        .webhook(webhook_id)
        .await?
        .ok_or_else(|| format!("webhook {} does not exist", webhook_id))?;

    match killmail_id {
        Some(killmail_id) => {
            let killmail = state.zkb.fetch_killmail(killmail_id).await?;
            let tracker: Tracker = serde_json::from_value(serde_json::json!({
                "id": 0,
                "name": "Test",
                "webhook_id": webhook.id,
            }))?;
            let user_states = state.user_state_lookup().await;
            let ctx = EvalContext {
                universe: &state.universe,
                user_states: &user_states,
                killmail_max_age: state.killmail_max_age(),
                fleet_threshold: state.config.fleet_threshold,
            };
            // A clause-free tracker matches everything; the age gate is
            // bypassed so historical killmails work.
            let annotated = tracker
                .process_killmail(&killmail, &ctx, true)
                .await
                .unwrap_or(killmail);
            enqueue_and_send(state, &tracker, &annotated, Some("Test:")).await;
        }
        None => {
            let message = serde_json::json!({
                "content": format!("Test message for webhook **{}**", webhook.name),
                "embeds": [],
            });
            state
                .storage
                .enqueue(webhook.id, QueueKind::Main, message.to_string())
                .await?;
            drive_send(state, webhook.id).await;
        }
    }
    Ok(())
}

/// Daemon mode: drives ingest runs on a fixed interval and purges stale
/// killmails after each run. The ingest lock keeps overlapping instances
/// from double-polling.
pub async fn run_scheduler(state: Arc<AppState>) {
    info!(
        "Scheduler started, ingesting every {}s",
        state.config.ingest_interval
    );
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.ingest_interval));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        run_ingest(&state).await;
        purge_stale(&state).await;
    }
}
