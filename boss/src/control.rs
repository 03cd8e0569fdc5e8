//! Control socket for talking to a running concierge daemon.
//!
//! Commands and responses are single lines of JSON over a Unix domain socket.

use crate::error::{Error, Result};
use crate::manager::ServiceManager;
use crate::service::{HealthStatus, ServiceSnapshot, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use crate::config::DEFAULT_CONTROL_SOCKET;

/// Commands that can be sent to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Start a service
    StartService { name: String },
    /// Stop a service and its dependents
    StopService { name: String },
    /// Restart a service and its dependents
    RestartService { name: String },
    /// Get status of a specific service
    GetServiceStatus { name: String },
    /// Get status of all services
    GetAllStatus,
    /// List all services
    ListServices,
    /// Current start order
    StartOrder,
    /// Stop all services and exit
    Shutdown,
    /// Ping to check if the daemon is responding
    Ping,
}

/// Response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command succeeded
    Success { message: String },
    /// Command failed
    Error { message: String },
    /// Status of one service
    Status { status: Status },
    /// Status of every service plus the worst of them
    StatusMap {
        overall: HealthStatus,
        services: BTreeMap<String, Status>,
    },
    /// Registered services
    ServiceList { services: Vec<ServiceSnapshot> },
    /// Start order
    Order { services: Vec<String> },
    /// Pong response
    Pong,
}

impl ControlResponse {
    fn error(message: impl ToString) -> Self {
        ControlResponse::Error {
            message: message.to_string(),
        }
    }

    fn success(message: impl Into<String>) -> Self {
        ControlResponse::Success {
            message: message.into(),
        }
    }
}

/// Run one command against the manager.
///
/// `Shutdown` is only acknowledged here; acting on it is up to the server.
pub async fn handle_command(manager: &ServiceManager, command: ControlCommand) -> ControlResponse {
    match command {
        ControlCommand::Ping => ControlResponse::Pong,
        ControlCommand::StartService { name } => match manager.start_service(&name).await {
            Ok(()) => ControlResponse::success(format!("Started {}", name)),
            Err(e) => ControlResponse::error(e),
        },
        ControlCommand::StopService { name } => match manager.stop_service(&name).await {
            Ok(()) => ControlResponse::success(format!("Stopped {}", name)),
            Err(e) => ControlResponse::error(e),
        },
        ControlCommand::RestartService { name } => match manager.restart_service(&name).await {
            Ok(true) => ControlResponse::success(format!("Restarted {}", name)),
            Ok(false) => ControlResponse::error(format!(
                "Restart of {} did not fully succeed; check service status",
                name
            )),
            Err(e) => ControlResponse::error(e),
        },
        ControlCommand::GetServiceStatus { name } => match manager.get_service_status(&name).await {
            Some(status) => ControlResponse::Status { status },
            None => ControlResponse::error(Error::ServiceNotFound(name)),
        },
        ControlCommand::GetAllStatus => {
            let services = manager.get_all_service_status().await;
            let overall = HealthStatus::worst_of(services.values().map(|s| s.status));
            ControlResponse::StatusMap { overall, services }
        }
        ControlCommand::ListServices => ControlResponse::ServiceList {
            services: manager.snapshots().await,
        },
        ControlCommand::StartOrder => match manager.start_order().await {
            Ok(services) => ControlResponse::Order { services },
            Err(e) => ControlResponse::error(e),
        },
        ControlCommand::Shutdown => ControlResponse::success("Shutdown requested"),
    }
}

/// Control socket server (runs in the daemon)
pub struct ControlServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Start listening for connections
    pub async fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // A stale socket from a previous run blocks bind.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "Control socket listening");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o660);
            std::fs::set_permissions(&self.socket_path, permissions)?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Accept a single connection
    pub async fn accept(&self) -> Result<UnixStream> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Control("Control server not started".to_string()))?;

        let (stream, _addr) = listener.accept().await?;
        debug!("Accepted control connection");
        Ok(stream)
    }

    /// Serve connections until the listener fails.
    ///
    /// A `Shutdown` command is acknowledged and forwarded on `shutdown_tx`.
    pub async fn serve(&self, manager: ServiceManager, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
        loop {
            let mut stream = self.accept().await?;
            let manager = manager.clone();
            let shutdown_tx = shutdown_tx.clone();

            tokio::spawn(async move {
                let command = match Self::read_command(&mut stream).await {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(error = %e, "Bad control command");
                        let _ = Self::write_response(&mut stream, &ControlResponse::error(e)).await;
                        return;
                    }
                };

                let is_shutdown = matches!(command, ControlCommand::Shutdown);
                let response = handle_command(&manager, command).await;
                if let Err(e) = Self::write_response(&mut stream, &response).await {
                    warn!(error = %e, "Failed to send control response");
                }
                if is_shutdown {
                    let _ = shutdown_tx.send(());
                }
            });
        }
    }

    /// Read a command from a stream
    pub async fn read_command(stream: &mut UnixStream) -> Result<ControlCommand> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let command: ControlCommand = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Failed to parse command: {}", e)))?;

        debug!(command = ?command, "Received control command");
        Ok(command)
    }

    /// Write a response to a stream
    pub async fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;

        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        debug!("Sent control response");
        Ok(())
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.listener.is_some() && self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// Control socket client (used by the CLI)
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Check if the control socket exists
    pub fn is_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Connect to the daemon
    pub async fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(Error::Control(format!(
                "Control socket not found at {}. Is the daemon running?",
                self.socket_path.display()
            )));
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "Failed to connect to control socket: {}. Is the daemon running?",
                e
            ))
        })?;

        debug!("Connected to control socket");
        Ok(stream)
    }

    /// Send a command and receive a response
    pub async fn send_command(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = self.connect().await?;

        let json = serde_json::to_string(&command)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Failed to parse response: {}", e)))?;

        Ok(response)
    }

    pub async fn start_service(&self, name: &str) -> Result<ControlResponse> {
        self.send_command(ControlCommand::StartService {
            name: name.to_string(),
        })
        .await
    }

    pub async fn stop_service(&self, name: &str) -> Result<ControlResponse> {
        self.send_command(ControlCommand::StopService {
            name: name.to_string(),
        })
        .await
    }

    pub async fn restart_service(&self, name: &str) -> Result<ControlResponse> {
        self.send_command(ControlCommand::RestartService {
            name: name.to_string(),
        })
        .await
    }

    pub async fn get_service_status(&self, name: &str) -> Result<ControlResponse> {
        self.send_command(ControlCommand::GetServiceStatus {
            name: name.to_string(),
        })
        .await
    }

    pub async fn get_all_status(&self) -> Result<ControlResponse> {
        self.send_command(ControlCommand::GetAllStatus).await
    }

    pub async fn list_services(&self) -> Result<ControlResponse> {
        self.send_command(ControlCommand::ListServices).await
    }

    pub async fn start_order(&self) -> Result<ControlResponse> {
        self.send_command(ControlCommand::StartOrder).await
    }

    pub async fn shutdown(&self) -> Result<ControlResponse> {
        self.send_command(ControlCommand::Shutdown).await
    }

    pub async fn ping(&self) -> Result<bool> {
        match self.send_command(ControlCommand::Ping).await {
            Ok(ControlResponse::Pong) => Ok(true),
            Ok(_) => Ok(false),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ServiceError;
    use crate::service::{
        HealthReportable, ServiceDescriptor, StartOutcome, Startable, Stoppable,
    };
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl Startable for Echo {
        async fn start(&self) -> std::result::Result<StartOutcome, ServiceError> {
            Ok(StartOutcome::Ready)
        }
    }

    #[async_trait]
    impl Stoppable for Echo {
        async fn stop(&self) -> std::result::Result<(), ServiceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl HealthReportable for Echo {
        async fn get_status(&self) -> Status {
            Status::new("echo", HealthStatus::Healthy)
        }
    }

    async fn manager() -> ServiceManager {
        let mut config = Config::default();
        config.manager.health_check_interval = std::time::Duration::ZERO;
        let manager = ServiceManager::new(config);
        manager
            .register_service(ServiceDescriptor::from_instance("echo", Arc::new(Echo)).with_priority(5))
            .await
            .unwrap();
        manager
    }

    #[test]
    fn test_command_serialization() {
        let cmd = ControlCommand::RestartService {
            name: "database".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: ControlCommand = serde_json::from_str(&json).unwrap();

        match parsed {
            ControlCommand::RestartService { name } => assert_eq!(name, "database"),
            _ => panic!("Wrong command type"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let resp = ControlResponse::Order {
            services: vec!["database".to_string(), "security".to_string()],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: ControlResponse = serde_json::from_str(&json).unwrap();

        match parsed {
            ControlResponse::Order { services } => assert_eq!(services, vec!["database", "security"]),
            _ => panic!("Wrong response type"),
        }
    }

    #[tokio::test]
    async fn test_handle_unknown_service() {
        let manager = manager().await;
        let resp = handle_command(&manager, ControlCommand::GetServiceStatus { name: "tts".into() }).await;
        match resp {
            ControlResponse::Error { message } => assert!(message.contains("tts")),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_all_status_reports_overall() {
        let manager = manager().await;
        manager.start_all_services(true).await.unwrap();

        match handle_command(&manager, ControlCommand::GetAllStatus).await {
            ControlResponse::StatusMap { overall, services } => {
                assert_eq!(overall, HealthStatus::Healthy);
                assert!(services.contains_key("echo"));
            }
            other => panic!("unexpected response {:?}", other),
        }
        manager.stop_all_services().await;
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("control.sock");

        let mut server = ControlServer::new(&socket);
        server.start().await.unwrap();

        let manager = manager().await;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let serve = tokio::spawn(async move { server.serve(manager, shutdown_tx).await });

        let client = ControlClient::new(&socket);
        assert!(client.ping().await.unwrap());

        match client.start_order().await.unwrap() {
            ControlResponse::Order { services } => assert_eq!(services, vec!["echo"]),
            other => panic!("unexpected response {:?}", other),
        }

        match client.shutdown().await.unwrap() {
            ControlResponse::Success { .. } => {}
            other => panic!("unexpected response {:?}", other),
        }
        shutdown_rx.recv().await.unwrap();

        serve.abort();
    }
}
