use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::code_execution::command_runner::CommandRunner;
use crate::configuration::config::Config;
use crate::data_capture::activity_capture::CaptureSettings;
use crate::error_handling::types::ControllerError;
use crate::notification::completion_queue::{CompletionQueue, CompletionWorker, RetryPolicy};
use crate::notification::evaluation_sink::{
    EvaluationSink, HttpEvaluationSink, LogEvaluationSink,
};
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::provisioner::SandboxProvisioner;
use crate::sandbox::remote_provider::RemoteSandboxProvider;
use crate::session_management::finalizer::SessionFinalizer;
use crate::session_management::project_files::ProjectFiles;
use crate::session_management::session_manager::SessionManager;
use crate::session_management::session_registry::SessionRegistry;
use crate::storage::database_storage::DatabaseStorage;
use crate::storage::storage_trait::Storage;
use crate::terminal_relay::broadcast_hub::BroadcastHub;
use crate::terminal_relay::relay::{TerminalRelay, TerminalSize};
use crate::web_interface::routes::ApiState;
use crate::web_interface::web_server::WebServer;

/// How long pending evaluation notices may drain after the server stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Wires the components together and runs the service until interrupted.
pub struct Controller {
    pub config: Config,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config
            .listen_addr()
            .map_err(ControllerError::ConfigurationError)?;
        Ok(Self { config })
    }

    pub async fn run(&mut self) -> Result<(), ControllerError> {
        let config = &self.config;
        let project_root = config.sandbox.project_root.clone();

        let storage: Arc<dyn Storage> = Arc::new(
            DatabaseStorage::open(&config.storage.database_path)
                .await
                .map_err(ControllerError::StorageError)?,
        );
        info!(
            "Storage ready at {}",
            config.storage.database_path.display()
        );

        let api_key = config.provider_api_key();
        if api_key.is_none() {
            warn!(
                "{} is not set, talking to the sandbox provider without a key",
                config.sandbox.api_key_env
            );
        }
        let provider: Arc<dyn SandboxProvider> = Arc::new(
            RemoteSandboxProvider::new(&config.sandbox.provider_url, api_key)
                .map_err(|e| ControllerError::InitializationFailed(e.to_string()))?,
        );

        let hub = Arc::new(BroadcastHub::with_capacity(config.relay.broadcast_capacity));
        let registry = Arc::new(SessionRegistry::new(
            storage.clone(),
            provider.clone(),
            hub.clone(),
            CaptureSettings {
                project_root: project_root.clone(),
                cols: config.capture.pty_cols,
                rows: config.capture.pty_rows,
                debounce: config.debounce_window(),
            },
        ));
        let provisioner = Arc::new(SandboxProvisioner::new(
            provider.clone(),
            config.sandbox.clone(),
            config.timeouts.clone(),
            config.assistant_api_key(),
        ));
        let finalizer = Arc::new(SessionFinalizer::new(
            registry.clone(),
            provider,
            storage.clone(),
        ));

        let (completions, notices) = CompletionQueue::new();
        let sink: Arc<dyn EvaluationSink> = match &config.evaluation.notify_url {
            Some(url) => {
                info!("Completed sessions will be sent to {}", url);
                Arc::new(HttpEvaluationSink::new(url))
            }
            None => Arc::new(LogEvaluationSink),
        };
        let policy = RetryPolicy {
            max_attempts: config.evaluation.max_attempts,
            initial_backoff: Duration::from_millis(config.evaluation.initial_backoff_ms),
        };
        let worker = CompletionWorker::new(notices, finalizer.clone(), sink, policy).spawn();

        let state = ApiState {
            sessions: Arc::new(SessionManager::new(
                storage.clone(),
                registry.clone(),
                provisioner,
                finalizer,
                completions.clone(),
            )),
            files: Arc::new(ProjectFiles::new(
                registry.clone(),
                storage.clone(),
                project_root.clone(),
                config.timeouts.list_files(),
            )),
            relay: Arc::new(TerminalRelay::new(
                registry.clone(),
                hub,
                config.resize_settle_delay(),
            )),
            runner: Arc::new(CommandRunner::new(
                storage,
                registry,
                project_root,
                config.timeouts.clone(),
                completions,
            )),
            default_size: TerminalSize {
                cols: config.capture.pty_cols,
                rows: config.capture.pty_rows,
            },
        };

        let addr = config
            .listen_addr()
            .map_err(ControllerError::ConfigurationError)?;
        let server = WebServer::new(state);
        server.start(addr, shutdown_signal()).await;
        drop(server);

        // The queue closes once every producer is gone; let queued notices go out.
        match tokio::time::timeout(DRAIN_TIMEOUT, worker).await {
            Ok(Ok(())) => info!("Completion queue drained"),
            Ok(Err(e)) => error!("Completion worker panicked: {}", e),
            Err(_) => warn!("Gave up draining completion queue after {:?}", DRAIN_TIMEOUT),
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
