use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::esi::{EsiClient, DEFAULT_ESI_URL};
use crate::store::{Storage, StoreError};
use crate::universe::{EntityResolver, UniverseResolver, UserStateLookup};
use crate::webhook::{HttpTransport, WebhookSender, WebhookTransport};
use crate::zkb::{self, ZkbClient, DEFAULT_REDISQ_URL, DEFAULT_ZKB_API_URL};

/// Runtime configuration. Every key can be set through the environment
/// (e.g. `MAX_KILLMAILS_PER_RUN=100`) and has a default.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Killmails older than this many hours are ignored by trackers.
    pub killmail_max_age_for_tracker: u64,
    pub max_killmails_per_run: u32,
    /// Wall-clock bound for one ingest run, in seconds.
    pub max_duration_per_run: u64,
    pub storing_killmails_enabled: bool,
    /// 0 disables the retention purge.
    pub purge_killmails_after_days: u32,
    /// Hard per-task timeout, in seconds.
    pub tasks_timeout: u64,
    pub webhook_set_avatar: bool,
    /// Attacker count at which a kill counts as a fleet kill.
    pub fleet_threshold: u32,
    pub data_dir: String,
    pub upstream_url: String,
    pub zkb_api_url: String,
    pub esi_url: String,
    /// Timeout for one upstream long-poll request, in seconds.
    pub upstream_request_timeout: u64,
    /// Seconds between ingest runs in daemon mode.
    pub ingest_interval: u64,
}

pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    Config::builder()
        .set_default("killmail_max_age_for_tracker", 1_i64)?
        .set_default("max_killmails_per_run", 250_i64)?
        .set_default("max_duration_per_run", 50_i64)?
        .set_default("storing_killmails_enabled", false)?
        .set_default("purge_killmails_after_days", 30_i64)?
        .set_default("tasks_timeout", 600_i64)?
        .set_default("webhook_set_avatar", true)?
        .set_default("fleet_threshold", 10_i64)?
        .set_default("data_dir", "data")?
        .set_default("upstream_url", DEFAULT_REDISQ_URL)?
        .set_default("zkb_api_url", DEFAULT_ZKB_API_URL)?
        .set_default("esi_url", DEFAULT_ESI_URL)?
        .set_default("upstream_request_timeout", 30_i64)?
        .set_default("ingest_interval", 60_i64)?
        .add_source(Environment::default())
        .build()?
        .try_deserialize()
}

/// Shared context for all orchestrator tasks.
pub struct AppState {
    pub config: AppConfig,
    pub storage: Storage,
    pub universe: UniverseResolver,
    pub entities: EntityResolver,
    pub zkb: ZkbClient,
    pub sender: WebhookSender<dyn WebhookTransport>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, StoreError> {
        Self::with_transport(config, Arc::new(HttpTransport::default()))
    }

    /// Test seam: the webhook transport is injectable so the outbound
    /// pipeline can run against a scripted double.
    pub fn with_transport(
        config: AppConfig,
        transport: Arc<dyn WebhookTransport>,
    ) -> Result<Self, StoreError> {
        let esi = EsiClient::new(&config.esi_url);
        let storage = Storage::open(&config.data_dir)?;
        let zkb = ZkbClient::new(
            &config.upstream_url,
            &config.zkb_api_url,
            esi.clone(),
            &zkb::generate_queue_id(),
            Duration::from_secs(config.upstream_request_timeout),
        );
        Ok(AppState {
            config,
            storage,
            universe: UniverseResolver::new(esi.clone()),
            entities: EntityResolver::new(esi),
            zkb,
            sender: WebhookSender::new(transport),
        })
    }

    pub fn killmail_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.config.killmail_max_age_for_tracker as i64)
    }

    pub async fn user_state_lookup(&self) -> UserStateLookup {
        match self.storage.user_states().await {
            Ok(states) => UserStateLookup::from_map(states),
            Err(e) => {
                tracing::warn!("Failed to load user states: {}", e);
                UserStateLookup::default()
            }
        }
    }
}
