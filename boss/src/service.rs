//! Service capability traits, descriptors, states and runtime records.

use crate::config::Config;
use crate::error::{Error, Result, ServiceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Priority given to services that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// How a successful start went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Fully operational
    Ready,
    /// Running with reduced functionality
    Degraded(String),
}

/// Something the manager can start.
#[async_trait]
pub trait Startable: Send + Sync {
    /// Bring the service up. May perform network, file or subprocess setup.
    async fn start(&self) -> std::result::Result<StartOutcome, ServiceError>;
}

/// Something the manager can stop.
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Best-effort teardown.
    async fn stop(&self) -> std::result::Result<(), ServiceError>;
}

/// Something that can describe its own health.
#[async_trait]
pub trait HealthReportable: Send + Sync {
    /// Snapshot of the current health. Should be cheap and must not block for long.
    async fn get_status(&self) -> Status;
}

/// Full capability contract every registered service satisfies.
///
/// Implemented automatically for any type providing the three capabilities.
pub trait Service: Startable + Stoppable + HealthReportable {
    /// Upcast for downcasting to the concrete type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> Service for T
where
    T: Startable + Stoppable + HealthReportable + 'static,
{
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Constructor producing a service instance from the shared configuration.
pub type ServiceFactory =
    Arc<dyn Fn(&Config) -> std::result::Result<Arc<dyn Service>, ServiceError> + Send + Sync>;

/// Health of a single service, as reported by the service itself.
///
/// Variants are ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HealthStatus {
    /// Worst status among `statuses`; `Healthy` when there are none.
    pub fn worst_of<I>(statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses.into_iter().max().unwrap_or(HealthStatus::Healthy)
    }

    /// Whether the status should count as a failed health check.
    pub fn is_failing(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::Offline)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Status report for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Service name
    pub name: String,
    /// Health
    pub status: HealthStatus,
    /// Free-form details
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Error message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Version string, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// When the status was produced
    pub last_check: DateTime<Utc>,
}

impl Status {
    /// Create a status with no details.
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            details: BTreeMap::new(),
            error: None,
            version: None,
            last_check: Utc::now(),
        }
    }

    /// Attach a detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach a version string.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Lifecycle state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Unregistered,
    #[default]
    Registered,
    Starting,
    Running,
    Degraded,
    Failed,
    Stopping,
    Stopped,
}

impl ServiceState {
    /// Running or degraded: the instance is usable.
    pub fn is_active(&self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Degraded)
    }

    /// Mid start or stop.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }

    /// Health reported for a service that cannot be probed in this state.
    pub fn implied_health(&self) -> HealthStatus {
        match self {
            ServiceState::Running => HealthStatus::Healthy,
            ServiceState::Degraded => HealthStatus::Degraded,
            ServiceState::Failed => HealthStatus::Unhealthy,
            _ => HealthStatus::Offline,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Unregistered => write!(f, "unregistered"),
            ServiceState::Registered => write!(f, "registered"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Degraded => write!(f, "degraded"),
            ServiceState::Failed => write!(f, "failed"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Registration record for a service.
#[derive(Clone)]
pub struct ServiceDescriptor {
    /// Unique name
    pub name: String,
    /// Instance constructor
    pub factory: ServiceFactory,
    /// Services that must be running first
    pub dependencies: BTreeSet<String>,
    /// Tie-break among ready services, lower starts first
    pub priority: i32,
    /// Whether a start failure is fatal to the whole system
    pub required: bool,
    /// Overrides the manager's start timeout
    pub start_timeout: Option<Duration>,
    /// Overrides the manager's stop timeout
    pub stop_timeout: Option<Duration>,
}

impl ServiceDescriptor {
    /// Create a descriptor with no dependencies and the default priority.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Config) -> std::result::Result<Arc<dyn Service>, ServiceError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            dependencies: BTreeSet::new(),
            priority: DEFAULT_PRIORITY,
            required: false,
            start_timeout: None,
            stop_timeout: None,
        }
    }

    /// Create a descriptor whose factory hands out an already built instance.
    pub fn from_instance(name: impl Into<String>, instance: Arc<dyn Service>) -> Self {
        Self::new(name, move |_| Ok(Arc::clone(&instance)))
    }

    /// Add dependencies.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Set the startup priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the service required (or not).
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Set a per-service start timeout.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    /// Set a per-service stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Check what can be checked without the rest of the registry.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("service name must not be empty".to_string()));
        }
        for dep in &self.dependencies {
            if dep.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "service {} lists an empty dependency name",
                    self.name
                )));
            }
            if dep == &self.name {
                return Err(Error::Configuration(format!(
                    "service {} depends on itself",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("required", &self.required)
            .field("start_timeout", &self.start_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

/// Runtime record, one per registered descriptor.
pub struct ServiceRecord {
    /// Owning descriptor
    pub descriptor: ServiceDescriptor,
    /// Constructed instance, if any
    pub instance: Option<Arc<dyn Service>>,
    /// Current state
    pub state: ServiceState,
    /// Last failure message
    pub last_error: Option<String>,
    /// Most recent health probe
    pub last_status: Option<Status>,
    pub(crate) instance_id: Option<Uuid>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) stopped_at: Option<DateTime<Utc>>,
    pub(crate) restart_count: u32,
    pub(crate) health_failures: u32,
    pub(crate) last_polled: Option<Instant>,
    /// Reason the service itself reported for running degraded
    pub(crate) degraded_reason: Option<String>,
    /// Serializes start/stop of this service
    pub(crate) op_lock: Arc<Mutex<()>>,
}

impl ServiceRecord {
    /// Create a fresh record for a descriptor.
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            instance: None,
            state: ServiceState::Registered,
            last_error: None,
            last_status: None,
            instance_id: None,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            health_failures: 0,
            last_polled: None,
            degraded_reason: None,
            op_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the uptime of the service.
    pub fn uptime(&self) -> Option<Duration> {
        if !self.state.is_active() {
            return None;
        }
        self.started_at.map(|start| {
            let secs = Utc::now().signed_duration_since(start).num_seconds();
            Duration::from_secs(secs.max(0) as u64)
        })
    }

    /// Status reported without asking the service.
    pub fn synthesized_status(&self) -> Status {
        let mut status = Status::new(&self.descriptor.name, self.state.implied_health())
            .with_detail("state", self.state.to_string());
        if let Some(ref err) = self.last_error {
            status = status.with_error(err.clone());
        }
        status
    }

    /// Serializable view of the record.
    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            name: self.descriptor.name.clone(),
            state: self.state,
            required: self.descriptor.required,
            priority: self.descriptor.priority,
            dependencies: self.descriptor.dependencies.iter().cloned().collect(),
            instance_id: self.instance_id,
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            restart_count: self.restart_count,
            health_failures: self.health_failures,
        }
    }
}

/// Point-in-time view of a service record for display and the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub required: bool,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub instance_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub health_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Startable for Noop {
        async fn start(&self) -> std::result::Result<StartOutcome, ServiceError> {
            Ok(StartOutcome::Ready)
        }
    }

    #[async_trait]
    impl Stoppable for Noop {
        async fn stop(&self) -> std::result::Result<(), ServiceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl HealthReportable for Noop {
        async fn get_status(&self) -> Status {
            Status::new("noop", HealthStatus::Healthy)
        }
    }

    fn noop_descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::from_instance(name, Arc::new(Noop))
    }

    #[test]
    fn test_worst_of() {
        assert_eq!(
            HealthStatus::worst_of(Vec::<HealthStatus>::new()),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthStatus::worst_of([HealthStatus::Healthy, HealthStatus::Degraded]),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::worst_of([
                HealthStatus::Unhealthy,
                HealthStatus::Offline,
                HealthStatus::Healthy
            ]),
            HealthStatus::Offline
        );
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let err = noop_descriptor("  ").validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let err = noop_descriptor("llm")
            .depends_on(["database", "llm"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = noop_descriptor("security")
            .depends_on(["database"])
            .with_priority(20)
            .required(true)
            .with_start_timeout(Duration::from_secs(5));
        assert!(desc.validate().is_ok());
        assert_eq!(desc.priority, 20);
        assert!(desc.required);
        assert!(desc.dependencies.contains("database"));
        assert_eq!(desc.start_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_synthesized_status_carries_state_and_error() {
        let mut record = ServiceRecord::new(noop_descriptor("stt"));
        record.state = ServiceState::Failed;
        record.last_error = Some("dependency database unavailable".to_string());

        let status = record.synthesized_status();
        assert_eq!(status.status, HealthStatus::Unhealthy);
        assert_eq!(status.details["state"], "failed");
        assert_eq!(status.error.as_deref(), Some("dependency database unavailable"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let status = Status::new("tts", HealthStatus::Degraded).with_version("1.2.0");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["version"], "1.2.0");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_downcast_through_service() {
        let svc: Arc<dyn Service> = Arc::new(Noop);
        assert!(svc.into_any().downcast::<Noop>().is_ok());
    }
}
