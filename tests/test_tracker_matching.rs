//! Tracker fan-out scenarios: killmails run through `run_tracker` end up on
//! the right webhook queues with the right payloads.
//!
//! Webhooks are disabled in most tests so enqueued messages stay inspectable
//! instead of being drained by the sender.

mod common;

use common::*;
use killtracker::message::DiscordMessage;
use killtracker::store::QueueKind;
use killtracker::tasks;

async fn queued_payloads(
    state: &killtracker::config::AppState,
    webhook_id: u64,
) -> Vec<DiscordMessage> {
    let mut payloads = Vec::new();
    while let Some(raw) = state.storage.dequeue(webhook_id, QueueKind::Main).await.unwrap() {
        payloads.push(serde_json::from_str(&raw).unwrap());
    }
    payloads
}

#[test_log::test(tokio::test)]
async fn sec_class_excludes_route_matches_in_ingest_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let state = test_app_state(&dir, transport.clone()).await;

    state.storage.save_webhook(&test_webhook(1, false)).await.unwrap();
    let mut tracker = test_tracker(1, 1);
    tracker.exclude_null_sec = true;
    tracker.exclude_w_space = true;
    state.storage.save_tracker(&tracker).await.unwrap();

    for killmail in [
        killmail(10000001, SISEIDE),
        killmail(10000002, JITA),
        killmail(10000003, AC5TC),
    ] {
        tasks::run_tracker(&state, 1, &killmail.to_json()).await;
    }

    assert_eq!(state.storage.queue_size(1, QueueKind::Main).await.unwrap(), 2);
    let payloads = queued_payloads(&state, 1).await;
    assert!(payloads[0].embeds[0].url.ends_with("/10000001/"));
    assert!(payloads[1].embeds[0].url.ends_with("/10000002/"));
    assert!(transport.posts.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn tracked_ship_types_show_up_in_the_payload() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state = test_app_state(&dir, ScriptedTransport::new()).await;

    state.storage.save_webhook(&test_webhook(1, false)).await.unwrap();
    let mut tracker = test_tracker(1, 1);
    tracker.require_attackers_ship_types = [SVIPUL].into();
    state.storage.save_tracker(&tracker).await.unwrap();

    // Svipul + 2x Gnosis: matches, annotated with the Svipul only.
    let mut with_svipul = killmail(10000101, SISEIDE);
    let mut extra = with_svipul.attackers[1].clone();
    extra.character_id = Some(1013);
    with_svipul.attackers.push(extra);
    tasks::run_tracker(&state, 1, &with_svipul.to_json()).await;

    // Frigates only: no match.
    let mut frigates_only = killmail(10000201, SISEIDE);
    for attacker in &mut frigates_only.attackers {
        attacker.ship_type_id = Some(RIFTER);
    }
    tasks::run_tracker(&state, 1, &frigates_only.to_json()).await;

    let payloads = queued_payloads(&state, 1).await;
    assert_eq!(payloads.len(), 1);
    assert!(payloads[0].embeds[0].url.ends_with("/10000101/"));
    assert!(payloads[0].embeds[0]
        .description
        .contains("Tracked ship types: Svipul"));
}

#[test_log::test(tokio::test)]
async fn stale_killmails_are_dropped() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state = test_app_state(&dir, ScriptedTransport::new()).await;

    state.storage.save_webhook(&test_webhook(1, false)).await.unwrap();
    state.storage.save_tracker(&test_tracker(1, 1)).await.unwrap();

    let mut stale = killmail(10000002, JITA);
    stale.time = (chrono::Utc::now() - chrono::Duration::hours(1) - chrono::Duration::seconds(1))
        .fixed_offset();
    tasks::run_tracker(&state, 1, &stale.to_json()).await;

    assert_eq!(state.storage.queue_size(1, QueueKind::Main).await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn victim_alliance_requirement_matches_exactly_one() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state = test_app_state(&dir, ScriptedTransport::new()).await;

    state.storage.save_webhook(&test_webhook(1, false)).await.unwrap();
    let mut tracker = test_tracker(1, 1);
    tracker.require_victim_alliances = [3001].into();
    state.storage.save_tracker(&tracker).await.unwrap();

    for id in [10000001, 10000002, 10000003, 10000004] {
        tasks::run_tracker(&state, 1, &killmail(id, JITA).to_json()).await;
    }
    let mut wayne_loss = killmail(10000005, JITA);
    wayne_loss.victim.alliance_id = Some(3001);
    tasks::run_tracker(&state, 1, &wayne_loss.to_json()).await;

    let payloads = queued_payloads(&state, 1).await;
    assert_eq!(payloads.len(), 1);
    assert!(payloads[0].embeds[0].url.ends_with("/10000005/"));
}

#[test_log::test(tokio::test)]
async fn disabled_trackers_never_match() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state = test_app_state(&dir, ScriptedTransport::new()).await;

    state.storage.save_webhook(&test_webhook(1, false)).await.unwrap();
    let mut tracker = test_tracker(1, 1);
    tracker.is_enabled = false;
    state.storage.save_tracker(&tracker).await.unwrap();

    tasks::run_tracker(&state, 1, &killmail(10000001, JITA).to_json()).await;
    assert_eq!(state.storage.queue_size(1, QueueKind::Main).await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn matched_killmail_is_delivered_to_the_webhook_url() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let state = test_app_state(&dir, transport.clone()).await;

    state.storage.save_webhook(&test_webhook(1, true)).await.unwrap();
    state.storage.save_tracker(&test_tracker(1, 1)).await.unwrap();

    tasks::run_tracker(&state, 1, &killmail(10000001, SISEIDE).to_json()).await;

    let posts = transport.posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, TEST_WEBHOOK_URL);
    assert!(posts[0].1.contains("zkillboard.com/kill/10000001/"));
    assert!(posts[0].1.contains("Tracker **tracker-1**:"));
    assert_eq!(state.storage.queue_size(1, QueueKind::Main).await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn two_trackers_on_one_webhook_both_enqueue() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state = test_app_state(&dir, ScriptedTransport::new()).await;

    state.storage.save_webhook(&test_webhook(1, false)).await.unwrap();
    state.storage.save_tracker(&test_tracker(1, 1)).await.unwrap();
    let mut second = test_tracker(2, 1);
    second.require_min_value = Some(50);
    state.storage.save_tracker(&second).await.unwrap();

    let json = killmail(10000001, SISEIDE).to_json();
    tasks::run_tracker(&state, 1, &json).await;
    tasks::run_tracker(&state, 2, &json).await;

    let payloads = queued_payloads(&state, 1).await;
    assert_eq!(payloads.len(), 2);
    assert!(payloads[0].content.contains("tracker-1"));
    assert!(payloads[1].content.contains("tracker-2"));
}

#[test_log::test(tokio::test)]
async fn purge_stale_respects_retention() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state = test_app_state(&dir, ScriptedTransport::new()).await;

    let mut old = killmail(10000001, JITA);
    old.time = (chrono::Utc::now() - chrono::Duration::days(40)).fixed_offset();
    state.storage.archive_killmail(&old).await.unwrap();
    state
        .storage
        .archive_killmail(&killmail(10000002, JITA))
        .await
        .unwrap();

    assert_eq!(tasks::purge_stale(&state).await, 1);
    assert!(state.storage.archived_killmail(10000001).await.unwrap().is_none());
    assert!(state.storage.archived_killmail(10000002).await.unwrap().is_some());
}
