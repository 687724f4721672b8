//! Shared test helpers for integration tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use killtracker::config::{AppConfig, AppState};
use killtracker::models::{Attacker, EntityCategory, Killmail, Victim, ZkbMeta};
use killtracker::tracker::Tracker;
use killtracker::universe::{ResolvedEntity, ShipType, SolarSystem};
use killtracker::webhook::{TransportResponse, Webhook, WebhookTransport, WebhookType};

pub const JITA: u32 = 30000142; // high sec
pub const SISEIDE: u32 = 30002539; // low sec
pub const AC5TC: u32 = 30000706; // null sec
pub const THERA: u32 = 31000005; // w-space

pub const SVIPUL: u32 = 34562;
pub const GNOSIS: u32 = 3756;
pub const RIFTER: u32 = 587;

pub const TEST_WEBHOOK_URL: &str = "https://discord.test/api/webhooks/1/token";

/// A canned HTTP response or failure for the scripted transport.
pub enum Scripted {
    Response(TransportResponse),
    NetworkError(String),
}

impl Scripted {
    pub fn status(status: u16) -> Self {
        Scripted::Response(TransportResponse {
            status,
            ..Default::default()
        })
    }

    pub fn rate_limited(retry_after_ms: u64, reset_after_secs: f64) -> Self {
        Scripted::Response(TransportResponse {
            status: 429,
            retry_after_ms: Some(retry_after_ms),
            rate_limit_reset_after: Some(reset_after_secs),
            ..Default::default()
        })
    }
}

/// Scripted stand-in for the Discord webhook endpoint. Plays back queued
/// responses (default: 204) and records every POST plus the maximum number
/// of concurrent in-flight requests.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    pub posts: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(0))
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            script: Mutex::new(VecDeque::new()),
            posts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn push(&self, scripted: Scripted) {
        self.script.lock().unwrap().push_back(scripted);
    }

    pub fn post_bodies(&self) -> Vec<String> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn post(
        &self,
        url: &str,
        body: &str,
    ) -> Result<TransportResponse, Box<dyn std::error::Error + Send + Sync>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), body.to_string()));
        let scripted = self.script.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match scripted {
            None => Ok(TransportResponse {
                status: 204,
                ..Default::default()
            }),
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::NetworkError(message)) => Err(message.into()),
        }
    }
}

pub fn test_config(data_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        killmail_max_age_for_tracker: 1,
        max_killmails_per_run: 250,
        max_duration_per_run: 50,
        storing_killmails_enabled: false,
        purge_killmails_after_days: 30,
        tasks_timeout: 600,
        webhook_set_avatar: true,
        fleet_threshold: 10,
        data_dir: data_dir.to_string_lossy().into_owned(),
        // Dead ports: a resolver miss must fail fast, not hit the network.
        upstream_url: "http://127.0.0.1:1/listen.php".to_string(),
        zkb_api_url: "http://127.0.0.1:1/api/".to_string(),
        esi_url: "http://127.0.0.1:1/esi/".to_string(),
        upstream_request_timeout: 1,
        ingest_interval: 60,
    }
}

/// Builds an AppState on a temp directory with primed resolvers and the
/// scripted transport wired in.
pub async fn test_app_state(
    dir: &tempfile::TempDir,
    transport: Arc<ScriptedTransport>,
) -> Arc<AppState> {
    let state = AppState::with_transport(test_config(dir.path()), transport).unwrap();

    for (id, name, security_status, region_id) in [
        (JITA, "Jita", 0.9, 10000002),
        (SISEIDE, "Siseide", 0.3, 10000030),
        (AC5TC, "A-C5TC", -0.5, 10000009),
        (THERA, "Thera", -0.99, 11000031),
    ] {
        state
            .universe
            .prime_system(SolarSystem {
                id,
                name: name.to_string(),
                security_status,
                constellation_id: id + 100,
                region_id,
                region_name: "Region".to_string(),
                x: 0.0,
                y: 0.0,
                z: 0.0,
            })
            .await;
    }

    for (id, name, group_id, group_name) in [
        (SVIPUL, "Svipul", 1305, "Tactical Destroyer"),
        (GNOSIS, "Gnosis", 419, "Combat Battlecruiser"),
        (RIFTER, "Rifter", 25, "Frigate"),
    ] {
        state
            .universe
            .prime_ship_type(ShipType {
                id,
                name: name.to_string(),
                group_id,
                group_name: group_name.to_string(),
                category_id: 6,
                published: true,
            })
            .await;
    }

    for (id, name, category) in [
        (1001u64, "Bruce Wayne", EntityCategory::Character),
        (1011, "Lex Luthor", EntityCategory::Character),
        (2001, "Wayne Tech", EntityCategory::Corporation),
        (2011, "LexCorp", EntityCategory::Corporation),
        (3001, "Wayne Enterprises", EntityCategory::Alliance),
        (3011, "Legion of Doom", EntityCategory::Alliance),
    ] {
        state
            .entities
            .prime(ResolvedEntity {
                id,
                name: name.to_string(),
                category,
            })
            .await;
    }

    Arc::new(state)
}

pub fn test_webhook(id: u64, is_enabled: bool) -> Webhook {
    Webhook {
        id,
        name: format!("webhook-{}", id),
        url: TEST_WEBHOOK_URL.to_string(),
        is_enabled,
        webhook_type: WebhookType::DiscordCompatible,
        notes: String::new(),
    }
}

/// A tracker with no clauses; individual tests switch on what they need.
pub fn test_tracker(id: u64, webhook_id: u64) -> Tracker {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("tracker-{}", id),
        "webhook_id": webhook_id,
    }))
    .unwrap()
}

/// Killmail fixture: victim in the given system, two attackers from the same
/// organization flying a Svipul (final blow) and a Gnosis.
pub fn killmail(id: i64, solar_system_id: u32) -> Killmail {
    Killmail {
        id,
        time: Utc::now().fixed_offset(),
        solar_system_id: Some(solar_system_id),
        victim: Victim {
            character_id: Some(1001),
            corporation_id: Some(2001),
            alliance_id: Some(3999),
            faction_id: None,
            ship_type_id: Some(RIFTER),
            damage_taken: 1000,
        },
        attackers: vec![
            Attacker {
                character_id: Some(1011),
                corporation_id: Some(2011),
                alliance_id: Some(3011),
                ship_type_id: Some(SVIPUL),
                weapon_type_id: Some(2977),
                damage_done: 1000,
                security_status: -1.9,
                is_final_blow: true,
                ..Default::default()
            },
            Attacker {
                character_id: Some(1012),
                corporation_id: Some(2011),
                alliance_id: Some(3011),
                ship_type_id: Some(GNOSIS),
                weapon_type_id: Some(2977),
                damage_done: 500,
                security_status: 0.1,
                is_final_blow: false,
                ..Default::default()
            },
        ],
        position: None,
        zkb: ZkbMeta {
            location_id: Some(40161548),
            hash: "d00ad190e832f0ca2965c9946b15527c415a70e7".to_string(),
            fitted_value: Some(60_000_000.0),
            total_value: Some(80_000_000.0),
            points: Some(1),
            is_npc: false,
            is_solo: false,
            is_awox: false,
        },
        tracker_info: None,
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}
