//! Service construction: explicit registry population, executor wiring,
//! watcher and refresh-loop startup. No init-time side effects; every
//! collaborator is built and connected here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use modelgate_auth::{Auth, AuthRefresher, Conductor, FileAuthStore};
use modelgate_common::GatewayConfig;
use modelgate_executor::providers::{
    AntigravityExecutor, ClaudeExecutor, CodexExecutor, CopilotExecutor, GeminiExecutor,
    OpenAiCompatExecutor,
};
use modelgate_executor::{
    ExecutorContext, LogUsageSink, ModelRegistry, ProviderExecutor, UpstreamTransport,
    WreqTransport, WreqTransportConfig,
};
use modelgate_protocol::StatusError;
use modelgate_translate::{Pipeline, Registry, RegistryError, register_builtin};
use modelgate_watcher::{AuthChange, DispatchQueue, Watcher};

use crate::engine::GatewayEngine;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The assembled service.
pub struct Gateway {
    pub engine: Arc<GatewayEngine>,
    pub conductor: Arc<Conductor>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
}

/// Bridges a provider executor into the conductor's refresh loop.
struct ExecutorRefresher {
    executor: Arc<dyn ProviderExecutor>,
    lead: Duration,
}

#[async_trait]
impl AuthRefresher for ExecutorRefresher {
    async fn refresh(&self, auth: Auth) -> Result<Auth, StatusError> {
        self.executor.refresh(auth).await
    }

    fn refresh_lead(&self) -> Duration {
        self.lead
    }
}

const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

/// Builds the whole gateway: registry, executors, conductor, watcher.
///
/// `config_path` enables hot reload; `None` keeps the initial config for
/// the process lifetime.
pub async fn bootstrap(
    initial_config: GatewayConfig,
    config_path: Option<PathBuf>,
) -> Result<Gateway, BootstrapError> {
    let mut registry = Registry::new();
    register_builtin(&mut registry)?;
    let registry = Arc::new(registry);

    let models = Arc::new(ModelRegistry::with_builtin_models());
    let config = Arc::new(ArcSwap::from_pointee(initial_config.clone()));

    let transport: Arc<dyn UpstreamTransport> = Arc::new(WreqTransport::new(WreqTransportConfig {
        default_proxy: initial_config.proxy.clone(),
        ..WreqTransportConfig::default()
    }));

    let ctx = ExecutorContext {
        transport,
        registry: registry.clone(),
        models: models.clone(),
        usage: Arc::new(LogUsageSink),
        config: config.clone(),
    };

    let mut executors: HashMap<&'static str, Arc<dyn ProviderExecutor>> = HashMap::new();
    executors.insert(
        "antigravity",
        Arc::new(AntigravityExecutor::new(ctx.clone())),
    );
    executors.insert("github-copilot", Arc::new(CopilotExecutor::new(ctx.clone())));
    executors.insert("gemini", Arc::new(GeminiExecutor::new(ctx.clone())));
    executors.insert("claude", Arc::new(ClaudeExecutor::new(ctx.clone())));
    executors.insert("codex", Arc::new(CodexExecutor::new(ctx.clone())));
    executors.insert(
        "openai-compat",
        Arc::new(OpenAiCompatExecutor::new(ctx.clone())),
    );

    let auth_dir = initial_config.auth_dir.clone().map(PathBuf::from);
    let store = auth_dir
        .as_ref()
        .map(|dir| Arc::new(FileAuthStore::new(dir.clone())) as Arc<dyn modelgate_auth::AuthStore>);

    let conductor = Arc::new(
        Conductor::new(initial_config.routing, store)
            .with_switch_project(initial_config.quota_exceeded.switch_project),
    );
    for (provider, executor) in &executors {
        let lead = if *provider == "antigravity" {
            modelgate_executor::providers::antigravity::REFRESH_LEAD
        } else {
            DEFAULT_REFRESH_LEAD
        };
        conductor
            .register_refresher(
                *provider,
                Arc::new(ExecutorRefresher {
                    executor: executor.clone(),
                    lead,
                }),
            )
            .await;
    }
    conductor.clone().spawn_refresh_loop();

    // Watcher feeds auth deltas into the conductor.
    let queue = Arc::new(DispatchQueue::new());
    let config_handle = config.clone();
    let vendor_dirs = initial_config
        .vendor_auth_dirs
        .iter()
        .map(PathBuf::from)
        .collect();
    let watcher = Arc::new(
        Watcher::new(
            config_path,
            auth_dir,
            queue.clone(),
            Some(Arc::new(move |updated: GatewayConfig| {
                config_handle.store(Arc::new(updated));
            })),
        )
        .with_vendor_dirs(vendor_dirs),
    );
    watcher.scan_once(time::OffsetDateTime::now_utc()).await;
    watcher.spawn();

    let consumer_conductor = conductor.clone();
    let consumer_queue = queue.clone();
    tokio::spawn(async move {
        loop {
            match consumer_queue.recv().await {
                AuthChange::Add(auth) | AuthChange::Modify(auth) => {
                    tracing::debug!(id = %auth.id, provider = %auth.provider, "credential upserted");
                    consumer_conductor.upsert(auth).await;
                }
                AuthChange::Delete { id, .. } => {
                    tracing::debug!(%id, "credential removed");
                    consumer_conductor.remove(&id).await;
                }
            }
        }
    });

    let pipeline = Arc::new(Pipeline::new(registry.as_ref().clone()));
    let engine = Arc::new(GatewayEngine::new(
        conductor.clone(),
        executors,
        models,
        pipeline,
    ));
    Ok(Gateway {
        engine,
        conductor,
        config,
    })
}
