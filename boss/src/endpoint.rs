//! Services that live elsewhere and are reached over TCP.
//!
//! The manager does not own the remote process; starting waits for the
//! endpoint to accept connections and health probes reconnect.

use crate::config::ServiceSettings;
use crate::error::ServiceError;
use crate::service::{HealthReportable, HealthStatus, StartOutcome, Startable, Status, Stoppable};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// How long start waits for the endpoint by default.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_INTERVAL: Duration = Duration::from_millis(200);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// An external network endpoint the system depends on.
pub struct EndpointService {
    name: String,
    address: String,
    connect_timeout: Duration,
    version: Option<String>,
    active: AtomicBool,
}

impl EndpointService {
    /// Create an endpoint service for `address` (host:port).
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            version: None,
            active: AtomicBool::new(false),
        }
    }

    /// Build from manifest settings.
    pub fn from_settings(name: &str, settings: &ServiceSettings) -> Result<Self, ServiceError> {
        let address = settings
            .address
            .as_deref()
            .ok_or_else(|| ServiceError::failed(format!("{}: no address configured", name)))?;

        let mut service = Self::new(name, address);
        if let Some(timeout) = settings.connect_timeout {
            service.connect_timeout = timeout;
        }
        service.version = settings.version.clone();
        Ok(service)
    }

    /// Set how long start waits for the endpoint.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the version reported in status.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Endpoint address.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn probe(&self) -> Result<Duration, String> {
        let started = Instant::now();
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", PROBE_TIMEOUT)),
        }
    }
}

#[async_trait]
impl Startable for EndpointService {
    async fn start(&self) -> Result<StartOutcome, ServiceError> {
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            match self.probe().await {
                Ok(latency) => {
                    info!(service = %self.name, address = %self.address, latency_ms = latency.as_millis() as u64, "Endpoint reachable");
                    self.active.store(true, Ordering::SeqCst);
                    return Ok(StartOutcome::Ready);
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(ServiceError::Unavailable(format!("{}: {}", self.address, e)));
                }
                Err(e) => {
                    debug!(service = %self.name, address = %self.address, error = %e, "Endpoint not ready, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }
}

#[async_trait]
impl Stoppable for EndpointService {
    async fn stop(&self) -> Result<(), ServiceError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl HealthReportable for EndpointService {
    async fn get_status(&self) -> Status {
        let mut status = if !self.active.load(Ordering::SeqCst) {
            Status::new(&self.name, HealthStatus::Offline).with_error("not started")
        } else {
            match self.probe().await {
                Ok(latency) => Status::new(&self.name, HealthStatus::Healthy)
                    .with_detail("latency_ms", latency.as_millis() as u64),
                Err(e) => Status::new(&self.name, HealthStatus::Unhealthy)
                    .with_error(format!("{} unreachable: {}", self.address, e)),
            }
        };

        status = status.with_detail("address", self.address.clone());
        if let Some(ref version) = self.version {
            status = status.with_version(version.clone());
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn free_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_reachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let svc = EndpointService::new("llm", address.clone()).with_version("0.3.1");
        assert_eq!(svc.start().await.unwrap(), StartOutcome::Ready);

        let status = svc.get_status().await;
        assert_eq!(status.status, HealthStatus::Healthy);
        assert_eq!(status.details["address"], address.as_str());
        assert_eq!(status.version.as_deref(), Some("0.3.1"));

        drop(listener);
        let status = svc.get_status().await;
        assert_eq!(status.status, HealthStatus::Unhealthy);
        assert!(status.error.is_some());

        svc.stop().await.unwrap();
        assert_eq!(svc.get_status().await.status, HealthStatus::Offline);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_start() {
        let svc = EndpointService::new("llm", free_address().await)
            .with_connect_timeout(Duration::from_millis(300));
        assert!(matches!(svc.start().await, Err(ServiceError::Unavailable(_))));
    }

    #[test]
    fn test_from_settings_requires_address() {
        let settings = ServiceSettings::process("/usr/bin/true");
        assert!(EndpointService::from_settings("llm", &settings).is_err());
    }
}
