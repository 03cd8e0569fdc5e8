//! Daemon core: startup, signal handling and orderly shutdown.

use crate::control::ControlServer;
use crate::error::{Error, Result};
use crate::manager::ServiceManager;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Runs a [`ServiceManager`] until a signal or shutdown request arrives.
pub struct Daemon {
    /// Service manager
    manager: ServiceManager,
    /// Control socket path, if the socket is enabled
    control_socket: Option<PathBuf>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Create a daemon around `manager`.
    pub fn new(manager: ServiceManager, control_socket: Option<PathBuf>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            manager,
            control_socket,
            shutdown_tx,
        }
    }

    /// Start all services and supervise them until shutdown.
    ///
    /// Signals that arrive while services are still starting cancel the
    /// startup pass before everything is stopped. Returns whether every
    /// required service came up.
    pub async fn run(&self, allow_partial_failure: bool) -> Result<bool> {
        info!("Concierge starting");

        let server = match self.control_socket {
            Some(ref path) => {
                let mut server = ControlServer::new(path);
                match server.start().await {
                    Ok(()) => Some(server),
                    Err(e) => {
                        warn!(error = %e, path = %path.display(), "Control socket unavailable");
                        None
                    }
                }
            }
            None => None,
        };

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut startup = tokio::spawn({
            let manager = self.manager.clone();
            async move { manager.start_all_services(allow_partial_failure).await }
        });

        let control = async {
            match server {
                Some(ref server) => server.serve(self.manager.clone(), self.shutdown_tx.clone()).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(control);

        let mut startup_done = false;
        let mut control_done = false;
        let mut all_required = false;

        loop {
            tokio::select! {
                result = &mut startup, if !startup_done => {
                    startup_done = true;
                    match result {
                        Ok(Ok(true)) => {
                            all_required = true;
                            info!("Concierge ready");
                        }
                        Ok(Ok(false)) if !allow_partial_failure => {
                            error!("Required services failed, shutting down");
                            break;
                        }
                        Ok(Ok(false)) => {
                            warn!("Concierge running with required services down");
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "Startup rejected");
                            return Err(e);
                        }
                        Err(e) => {
                            error!(error = %e, "Startup task failed");
                            break;
                        }
                    }
                }

                result = &mut control, if !control_done => {
                    control_done = true;
                    if let Err(e) = result {
                        warn!(error = %e, "Control socket stopped");
                    }
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    break;
                }

                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    break;
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        if !startup_done {
            self.manager.cancel_startup();
            match startup.await {
                Ok(Ok(ok)) => all_required = ok,
                Ok(Err(e)) => warn!(error = %e, "Startup ended with error"),
                Err(e) => warn!(error = %e, "Startup task failed"),
            }
        }

        self.manager.stop_all_services().await;
        info!("Concierge stopped");
        Ok(all_required)
    }

    /// Request a shutdown.
    pub fn request_shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .map_err(|_| Error::Control("Daemon is not running".to_string()))?;
        Ok(())
    }

    /// Get the service manager.
    pub fn manager(&self) -> ServiceManager {
        self.manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ServiceError;
    use crate::service::{
        HealthReportable, HealthStatus, ServiceDescriptor, ServiceState, StartOutcome, Startable,
        Status, Stoppable,
    };
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct Slow(Duration);

    #[async_trait]
    impl Startable for Slow {
        async fn start(&self) -> std::result::Result<StartOutcome, ServiceError> {
            tokio::time::sleep(self.0).await;
            Ok(StartOutcome::Ready)
        }
    }

    #[async_trait]
    impl Stoppable for Slow {
        async fn stop(&self) -> std::result::Result<(), ServiceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl HealthReportable for Slow {
        async fn get_status(&self) -> Status {
            Status::new("slow", HealthStatus::Healthy)
        }
    }

    async fn daemon(delay: Duration) -> Arc<Daemon> {
        let mut config = Config::default();
        config.manager.health_check_interval = Duration::ZERO;
        let manager = ServiceManager::new(config);
        manager
            .register_service(ServiceDescriptor::from_instance("first", Arc::new(Slow(delay))))
            .await
            .unwrap();
        manager
            .register_service(
                ServiceDescriptor::from_instance("second", Arc::new(Slow(delay))).depends_on(["first"]),
            )
            .await
            .unwrap();
        Arc::new(Daemon::new(manager, None))
    }

    #[tokio::test]
    async fn test_shutdown_after_startup() {
        let daemon = daemon(Duration::ZERO).await;
        let runner = tokio::spawn({
            let daemon = Arc::clone(&daemon);
            async move { daemon.run(true).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(daemon.manager().state("second").await, ServiceState::Running);

        daemon.request_shutdown().unwrap();
        assert!(runner.await.unwrap().unwrap());
        assert_eq!(daemon.manager().state("first").await, ServiceState::Stopped);
        assert_eq!(daemon.manager().state("second").await, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_during_startup_cancels() {
        let daemon = daemon(Duration::from_millis(300)).await;
        let runner = tokio::spawn({
            let daemon = Arc::clone(&daemon);
            async move { daemon.run(true).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        daemon.request_shutdown().unwrap();

        assert!(!runner.await.unwrap().unwrap());
        let manager = daemon.manager();
        assert_eq!(manager.state("first").await, ServiceState::Stopped);
        assert_eq!(manager.state("second").await, ServiceState::Stopped);
        assert!(!manager.is_started().await);
    }

    #[test]
    fn test_request_shutdown_without_run_fails() {
        let daemon = Daemon::new(ServiceManager::new(Config::default()), None);
        assert!(daemon.request_shutdown().is_err());
    }
}
