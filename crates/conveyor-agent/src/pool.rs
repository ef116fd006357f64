use std::sync::Arc;

use conveyor_api::HttpClient;
use conveyor_types::{AgentConfig, AgentError, EndpointState, ErrorKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::bootstrap::{Bootstrap, ShellBootstrap};
use crate::idle::IdleMonitor;
use crate::signals::{self, StopKind};
use crate::worker::Worker;

/// N identical workers sharing one idle monitor and one signal watcher.
pub struct WorkerPool {
    config: Arc<AgentConfig>,
}

impl WorkerPool {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn run(self) -> Result<(), AgentError> {
        let stop_rx = signals::watch_signals().map_err(|err| {
            AgentError::new(ErrorKind::Fatal, "could not install signal handlers")
                .with_detail(err.to_string())
        })?;
        self.run_with(Arc::new(ShellBootstrap), stop_rx).await
    }

    pub async fn run_with(
        self,
        bootstrap: Arc<dyn Bootstrap>,
        stop_rx: watch::Receiver<Option<StopKind>>,
    ) -> Result<(), AgentError> {
        let spawn = self.config.spawn.max(1);
        let idle = Arc::new(IdleMonitor::new(spawn));
        let cancel = CancellationToken::new();

        let mut workers = JoinSet::new();
        for index in 0..spawn {
            let mut config = (*self.config).clone();
            config.name = worker_name(&self.config.name, index, spawn);
            let config = Arc::new(config);

            let endpoint = Arc::new(EndpointState::new(config.endpoint.clone()));
            if !config.request_headers.is_empty() {
                endpoint.apply(None, Some(config.request_headers.clone()));
            }
            let api = HttpClient::builder()
                .endpoint(endpoint.clone())
                .token(config.token.clone())
                .build()
                .map_err(|err| {
                    AgentError::new(ErrorKind::Fatal, "could not build the HTTP client")
                        .with_detail(err.to_string())
                })?;

            workers.spawn(
                Worker {
                    index,
                    api: Arc::new(api),
                    bootstrap: bootstrap.clone(),
                    config,
                    endpoint,
                    idle: idle.clone(),
                    stop_rx: stop_rx.clone(),
                    cancel: cancel.child_token(),
                }
                .run(),
            );
        }
        drop(stop_rx);

        let mut first_err = None;
        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => {
                    AgentError::new(ErrorKind::Fatal, "worker task failed")
                        .with_detail(err.to_string())
                }
            };
            error!(%failure, "worker failed");
            if first_err.is_none() {
                first_err = Some(failure);
                // One fatal worker takes the pool down.
                cancel.cancel();
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn worker_name(base: &str, index: usize, spawn: usize) -> String {
    if spawn > 1 {
        format!("{base}-{}", index + 1)
    } else {
        base.to_string()
    }
}
