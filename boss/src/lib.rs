//! Concierge service manager.
//!
//! Brings an assistant's subsystems up and down in dependency order and
//! keeps an eye on them while they run:
//!
//! - Registration of services with dependencies, priority and a required flag
//! - Topological start order with priority tie-break and cycle detection
//! - Partial-failure startup: optional services may fail without aborting
//! - Reverse-order shutdown that never stops on a single failure
//! - Health aggregation, periodic health checks and automatic restarts
//! - Restart cascades through transitive dependents
//!
//! # Architecture
//!
//! - **ServiceManager**: registry and lifecycle engine
//! - **DependencyGraph**: start/stop ordering
//! - **FactoryRegistry**: builds services from the TOML manifest
//! - **ProcessService** / **EndpointService**: built-in service kinds
//! - **Daemon**: signal handling and the control socket
//!
//! # Example
//!
//! ```no_run
//! use concierge_boss::{Config, Daemon, FactoryRegistry, ServiceManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("/etc/concierge/concierge.toml".as_ref())?;
//!     let descriptors = FactoryRegistry::new().descriptors(&config)?;
//!     let allow_partial = config.manager.allow_partial_failure;
//!     let socket = config.manager.control_socket.clone();
//!
//!     let manager = ServiceManager::new(config);
//!     for descriptor in descriptors {
//!         manager.register_service(descriptor).await?;
//!     }
//!
//!     Daemon::new(manager, Some(socket)).run(allow_partial).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod graph;
pub mod manager;
mod monitor;
pub mod process;
pub mod registry;
pub mod service;

// Re-export main types
pub use config::{Config, ManagerSettings, ServiceSettings, DEFAULT_CONFIG_PATH};
pub use control::{ControlClient, ControlCommand, ControlResponse, ControlServer};
pub use daemon::Daemon;
pub use endpoint::EndpointService;
pub use error::{Error, Result, ServiceError};
pub use graph::DependencyGraph;
pub use manager::ServiceManager;
pub use process::ProcessService;
pub use registry::{FactoryRegistry, ServiceBuilder};
pub use service::{
    HealthReportable, HealthStatus, Service, ServiceDescriptor, ServiceSnapshot, ServiceState,
    StartOutcome, Startable, Status, Stoppable, DEFAULT_PRIORITY,
};
