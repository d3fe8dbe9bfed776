//! Wiring of store, backend and caches for one CLI invocation.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, ValueEnum};
use miette::Result;
use tracing::{debug, info};

use murmur_cache::{
    Caches, CollectionKey, DeletePolicy, EventBus, LoadOutcome, NetworkClass, Reconciler,
    SyncConfig,
};
use murmur_remote::{RemoteBackend, RestBackend};
use murmur_store::{DurableStore, FileBackend};

/// Flags shared by every subcommand.
#[derive(Args)]
pub struct GlobalArgs {
    /// Directory holding the local store
    #[arg(long, global = true, env = "MURMUR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Backend project URL; omit to run local-only
    #[arg(long, global = true, env = "MURMUR_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Backend API key
    #[arg(long, global = true, env = "MURMUR_API_KEY")]
    pub api_key: Option<String>,

    /// Access token of the signed-in user
    #[arg(long, global = true, env = "MURMUR_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Network class (desktop, mobile), picks timeouts
    #[arg(long, global = true, env = "MURMUR_NETWORK", default_value = "desktop")]
    pub network: NetworkClass,

    /// Byte quota for the local store
    #[arg(long, global = true, env = "MURMUR_QUOTA_BYTES")]
    pub quota_bytes: Option<usize>,

    /// Ignore the backend even when configured.
    /// Accepts "1", "true", "yes", or "on".
    #[arg(long, global = true, env = "MURMUR_OFFLINE", action = ArgAction::Set, value_parser = crate::parse_bool_env, default_value = "false")]
    pub offline: bool,

    /// What deleting a post does to its comments
    #[arg(long, global = true, value_enum, default_value = "cascade")]
    pub delete_policy: PolicyArg,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    Cascade,
    Orphan,
    Reject,
}

impl From<PolicyArg> for DeletePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Cascade => DeletePolicy::Cascade,
            PolicyArg::Orphan => DeletePolicy::Orphan,
            PolicyArg::Reject => DeletePolicy::Reject,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CollectionArg {
    Posts,
    Comments,
    Chat,
    Support,
}

impl From<CollectionArg> for CollectionKey {
    fn from(arg: CollectionArg) -> Self {
        match arg {
            CollectionArg::Posts => CollectionKey::Posts,
            CollectionArg::Comments => CollectionKey::Comments,
            CollectionArg::Chat => CollectionKey::CommunityMessages,
            CollectionArg::Support => CollectionKey::SupportMessages,
        }
    }
}

/// Everything a command needs.
pub struct App {
    pub caches: Caches,
    pub reconciler: Reconciler,
    pub rest: Option<Arc<RestBackend>>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("murmur")
}

impl App {
    /// Open the store, connect the backend if configured and hydrate every
    /// cache from disk.
    pub async fn open(args: &GlobalArgs) -> Result<Self> {
        let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
        let mut file = FileBackend::open(&data_dir).map_err(|e| {
            miette::miette!("failed to open data directory {}: {}", data_dir.display(), e)
        })?;
        if let Some(quota) = args.quota_bytes {
            file = file.with_quota(quota);
        }
        let store = Arc::new(DurableStore::new(Arc::new(file)));

        let config = SyncConfig::for_network(args.network).with_delete_policy(args.delete_policy.into());
        let rest = match (&args.backend_url, &args.api_key) {
            (Some(url), Some(key)) if !args.offline => {
                let rest = RestBackend::with_timeout(url, key, config.fetch_timeout)
                    .map_err(|e| miette::miette!("failed to configure backend: {}", e))?;
                rest.set_access_token(args.access_token.clone()).await;
                info!(url = %rest.base_url(), "backend configured");
                Some(Arc::new(rest))
            }
            _ => {
                info!("no backend configured, running local-only");
                None
            }
        };

        let bus = EventBus::new();
        let caches = Caches::new(store, bus.clone(), config.clone());
        let backend = rest.clone().map(|r| r as Arc<dyn RemoteBackend>);
        let reconciler = Reconciler::new(backend, bus, config);
        caches.register_with(&reconciler);

        let hydrated = caches.load_all();
        debug!(records = hydrated, dir = %data_dir.display(), "caches hydrated");

        Ok(Self {
            caches,
            reconciler,
            rest,
        })
    }

    /// Bring a collection up to date. Remote failures are reported and the
    /// local snapshot is used.
    pub async fn load(&self, key: CollectionKey) -> LoadOutcome {
        let outcome = self.reconciler.initial_load(key).await;
        if let LoadOutcome::Failed { error, .. } = &outcome {
            eprintln!("warning: showing local {} only ({})", key, error);
        }
        outcome
    }

    /// Push queued writes and persist every cache.
    pub async fn finish(&self) {
        let processed = self.reconciler.flush_outbox().await;
        if processed > 0 {
            debug!(processed, "outbox drained");
        }
        self.caches.flush();
    }
}
