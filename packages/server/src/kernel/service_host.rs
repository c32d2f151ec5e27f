//! Long-running background services sharing one shutdown token.

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A background loop owned by the [`ServiceHost`].
///
/// Implementations must return promptly once `shutdown` is cancelled,
/// after finishing the unit of work in flight.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Runs registered services until the shutdown token is cancelled.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn with_token(shutdown: CancellationToken) -> Self {
        Self {
            services: Vec::new(),
            shutdown,
        }
    }

    pub fn with_service<S: Service>(mut self, service: S) -> Self {
        self.services.push(Box::new(service));
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every service to completion. A service that errors is logged and
    /// does not bring the others down.
    pub async fn run(self) {
        let mut set = JoinSet::new();
        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            info!(service = name, "starting service");
            set.spawn(async move { (name, service.run(token).await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(service = name, "service stopped"),
                Ok((name, Err(e))) => error!(service = name, error = %e, "service exited with error"),
                Err(e) => error!(error = %e, "service task panicked"),
            }
        }
    }

    /// Cancel the token on SIGINT/SIGTERM, then run until every service exits.
    pub async fn run_until_shutdown(self) {
        spawn_signal_listener(self.shutdown.clone());
        self.run().await;
    }
}

/// Cancel `token` when the process receives SIGINT or SIGTERM.
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT, initiating graceful shutdown");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT, initiating graceful shutdown");
}
