use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::broadcast::hub::{run_hub_client, try_host_hub};
use crate::broadcast::{event, ConnectionManager};
use crate::config::ServerConfig;
use crate::context::ContextBuilder;
use crate::database::ChatDatabase;
use crate::http_client::build_http_client;
use crate::image_gen::{ComfyImageBackend, ImageBackend};
use crate::llm_client::{ModelProvider, OpenAiCompatibleProvider};
use crate::orchestrator::{TurnOrchestrator, TurnServices};
use crate::rag::{DatastoreBackend, HttpDatastoreBackend};
use crate::sessions::SessionCache;
use crate::storage::DataPaths;
use crate::tasks::{TaskManager, TaskRecord};
use crate::tools::ToolRegistry;
use crate::web_search::{GoogleSearchProvider, HttpPageReader, WebSearchAgent};

/// Everything one worker process serves requests with.
pub struct BackendRuntime {
    pub config: Arc<ServerConfig>,
    pub db: Arc<ChatDatabase>,
    pub paths: DataPaths,
    pub models: Arc<dyn ModelProvider>,
    pub connections: Arc<ConnectionManager>,
    pub tasks: Arc<TaskManager>,
    pub orchestrator: Arc<TurnOrchestrator>,
}

impl BackendRuntime {
    /// Wires the worker together. Must run inside a tokio runtime since it may host
    /// or join the communication hub.
    pub async fn bootstrap(config: ServerConfig) -> Result<Self> {
        let config = Arc::new(config);
        let db = Arc::new(
            ChatDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database {}", config.database_path))?,
        );
        let paths = DataPaths::new(&config.data_dir);
        let http = build_http_client().context("Failed to build HTTP client")?;

        let provider: Arc<dyn ModelProvider> =
            Arc::new(OpenAiCompatibleProvider::new(&config, http.clone()));
        let sessions = Arc::new(SessionCache::new(
            provider,
            Duration::from_secs(config.session_teardown_secs),
        ));
        let models: Arc<dyn ModelProvider> = sessions.clone();

        let tools = Arc::new(ToolRegistry::with_builtins(http.clone()).await);
        let rag: Option<Arc<dyn DatastoreBackend>> = match config.rag_service_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                tracing::info!("RAG service: {}", url);
                Some(Arc::new(HttpDatastoreBackend::new(url, http.clone())))
            }
            _ => None,
        };
        let images: Option<Arc<dyn ImageBackend>> = if config.comfyui.api_url.trim().is_empty() {
            None
        } else {
            tracing::info!("Image backend: {}", config.comfyui.api_url);
            Some(Arc::new(ComfyImageBackend::new(
                config.comfyui.clone(),
                http.clone(),
            )))
        };
        let search = WebSearchAgent::new(
            Arc::new(GoogleSearchProvider::new(http.clone())),
            Some(Arc::new(HttpPageReader::new(http.clone()))),
        );

        let hub_outbound = if config.workers > 1 {
            let (tx, rx) = flume::unbounded();
            Some((tx, rx))
        } else {
            None
        };
        let connections = Arc::new(ConnectionManager::new(
            std::process::id(),
            db.clone(),
            sessions,
            hub_outbound.as_ref().map(|(tx, _)| tx.clone()),
        ));
        if let Some((_, outbound)) = hub_outbound {
            if try_host_hub(config.hub_port).await?.is_none() {
                tracing::info!("Another worker hosts the hub on port {}", config.hub_port);
            }
            let addr = SocketAddr::from(([127, 0, 0, 1], config.hub_port));
            tokio::spawn(run_hub_client(addr, connections.clone(), outbound));
        }

        let tasks = Arc::new(TaskManager::new(config.task_workers));
        let observer_connections = connections.clone();
        tasks.set_observer(Arc::new(move |record: &TaskRecord| {
            let data = serde_json::to_value(record).unwrap_or_default();
            observer_connections.send_personal(record.owner_user_id, event("task_update", data));
        }));

        let services = TurnServices {
            db: db.clone(),
            paths: paths.clone(),
            config: config.clone(),
            models: models.clone(),
            context: ContextBuilder::new(db.clone(), tools, rag, images.is_some()),
            search: Some(search),
            images,
            tasks: tasks.clone(),
            connections: connections.clone(),
        };
        let orchestrator = Arc::new(TurnOrchestrator::new(services));

        tracing::info!(
            "Worker {} ready (workers: {}, task workers: {})",
            std::process::id(),
            config.workers,
            config.task_workers
        );
        Ok(Self {
            config,
            db,
            paths,
            models,
            connections,
            tasks,
            orchestrator,
        })
    }
}
