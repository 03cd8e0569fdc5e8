//! Service manager for registering, ordering and supervising services.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::monitor::{self, MonitorHandle};
use crate::service::{
    HealthStatus, Service, ServiceDescriptor, ServiceRecord, ServiceSnapshot, ServiceState,
    StartOutcome, Status,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where the manager is in its start/stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing started; registration open
    Idle,
    /// start_all_services in progress
    Starting,
    /// Startup pass finished
    Started,
    /// stop_all_services in progress
    Stopping,
}

/// Service manager that orchestrates services.
///
/// Cloning is cheap and every clone drives the same registry.
#[derive(Clone)]
pub struct ServiceManager {
    /// Configuration handed to every factory
    config: Arc<Config>,
    /// Runtime records by name
    records: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    /// Start/stop cycle position
    phase: Arc<RwLock<Phase>>,
    /// Serializes start-all, stop-all and restarts
    lifecycle: Arc<Mutex<()>>,
    /// Set to abandon an in-progress startup pass
    cancel: Arc<AtomicBool>,
    /// Periodic health monitor, while started
    monitor: Arc<Mutex<Option<MonitorHandle>>>,
}

impl ServiceManager {
    /// Create a new service manager.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            records: Arc::new(RwLock::new(HashMap::new())),
            phase: Arc::new(RwLock::new(Phase::Idle)),
            lifecycle: Arc::new(Mutex::new(())),
            cancel: Arc::new(AtomicBool::new(false)),
            monitor: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared configuration.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Register a service definition.
    ///
    /// Re-registering a name replaces the previous descriptor unless that
    /// service is active or mid-transition. Dependencies are resolved at start
    /// time, so they may be registered in any order.
    pub async fn register_service(&self, descriptor: ServiceDescriptor) -> Result<()> {
        descriptor.validate()?;
        let name = descriptor.name.clone();

        let phase = self.phase.read().await;
        if *phase != Phase::Idle {
            return Err(Error::RegistrationClosed(name));
        }

        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&name) {
            if existing.state.is_active() || existing.state.is_transitional() {
                return Err(Error::Configuration(format!(
                    "cannot replace {} while it is {}",
                    name, existing.state
                )));
            }
        }
        let replaced = records
            .insert(name.clone(), ServiceRecord::new(descriptor))
            .is_some();

        if replaced {
            info!(service = %name, "Replaced service registration");
        } else {
            info!(service = %name, "Registered service");
        }
        Ok(())
    }

    /// Register an already constructed instance.
    pub async fn register_instance<I, S>(
        &self,
        name: &str,
        instance: Arc<dyn Service>,
        dependencies: I,
        priority: i32,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let descriptor = ServiceDescriptor::from_instance(name, instance)
            .depends_on(dependencies)
            .with_priority(priority);
        self.register_service(descriptor).await
    }

    /// Remove an inactive service that nothing depends on.
    pub async fn unregister_service(&self, name: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

        if record.state.is_active() || record.state.is_transitional() {
            return Err(Error::Configuration(format!(
                "cannot unregister {} while it is {}",
                name, record.state
            )));
        }

        if let Some(dependent) = records
            .values()
            .find(|r| r.descriptor.dependencies.contains(name))
        {
            return Err(Error::Configuration(format!(
                "cannot unregister {}: {} depends on it",
                name, dependent.descriptor.name
            )));
        }

        records.remove(name);
        info!(service = %name, "Unregistered service");
        Ok(())
    }

    /// Start every registered service in dependency order.
    ///
    /// Returns `Ok(true)` when every required service came up. Configuration
    /// and cycle errors are returned before anything starts. Calling this on a
    /// started manager fails with [`Error::AlreadyStarted`].
    pub async fn start_all_services(&self, allow_partial_failure: bool) -> Result<bool> {
        let _pass = self.lifecycle.lock().await;

        let order = {
            let mut phase = self.phase.write().await;
            if *phase != Phase::Idle {
                return Err(Error::AlreadyStarted);
            }
            let order = self.graph().await.start_order()?;
            *phase = Phase::Starting;
            order
        };
        self.cancel.store(false, Ordering::SeqCst);

        info!(services = order.len(), allow_partial_failure, "Starting all services");
        let pass_start = Instant::now();
        let mut required_ok = true;

        for name in &order {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Startup cancelled, stopping services already started");
                self.shutdown_locked().await;
                return Ok(false);
            }

            let required = self
                .records
                .read()
                .await
                .get(name)
                .map(|r| r.descriptor.required)
                .unwrap_or(false);

            if let Err(e) = self.start_one(name).await {
                if !required {
                    warn!(service = %name, error = %e, "Optional service unavailable");
                    continue;
                }

                required_ok = false;
                if !allow_partial_failure {
                    error!(service = %name, error = %e, "Required service failed, aborting startup");
                    self.set_phase(Phase::Started).await;
                    return Ok(false);
                }
                error!(service = %name, error = %e, "Required service failed, continuing");
            }
        }

        if self.cancel.load(Ordering::SeqCst) {
            warn!("Startup cancelled after the last start, stopping services");
            self.shutdown_locked().await;
            return Ok(false);
        }

        self.set_phase(Phase::Started).await;
        self.spawn_monitor().await;

        let duration_ms = pass_start.elapsed().as_millis() as u64;
        if required_ok {
            info!(duration_ms, "Service startup complete");
        } else {
            warn!(duration_ms, "Service startup complete with required services down");
        }
        Ok(required_ok)
    }

    /// Ask an in-progress startup pass to stop issuing starts and shut down
    /// what it already started.
    pub fn cancel_startup(&self) {
        info!("Startup cancellation requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stop every service in reverse start order.
    ///
    /// Stop failures are logged and never interrupt the pass. Afterwards every
    /// record is `Stopped`, every instance is released and the manager is
    /// idle again.
    pub async fn stop_all_services(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.stop_monitor().await;

        let _pass = self.lifecycle.lock().await;
        // A pass that finished while we waited may have spawned a monitor.
        // Holding the lifecycle lock, it cannot be mid-restart.
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        self.shutdown_locked().await;
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Start a single service whose dependencies are already available.
    pub async fn start_service(&self, name: &str) -> Result<()> {
        let _pass = self.lifecycle.lock().await;
        self.start_one(name).await
    }

    /// Stop a single service, stopping its active dependents first.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let _pass = self.lifecycle.lock().await;
        self.ensure_registered(name).await?;

        let dependents = self.active_dependents(name).await?;
        for dependent in dependents.iter().rev() {
            if let Err(e) = self.stop_one(dependent).await {
                error!(service = %dependent, error = %e, "Failed to stop dependent service");
            }
        }
        self.stop_one(name).await
    }

    /// Restart a service together with everything that depends on it.
    ///
    /// Returns `Ok(false)` when any stop or start in the cascade failed; the
    /// services that did come back stay running.
    pub async fn restart_service(&self, name: &str) -> Result<bool> {
        let _pass = self.lifecycle.lock().await;
        self.ensure_registered(name).await?;

        let dependents = self.active_dependents(name).await?;
        info!(service = %name, dependents = ?dependents, "Restarting service");

        let mut ok = true;
        for dependent in dependents.iter().rev() {
            if let Err(e) = self.stop_one(dependent).await {
                error!(service = %dependent, error = %e, "Failed to stop dependent service");
                ok = false;
            }
        }
        if let Err(e) = self.stop_one(name).await {
            error!(service = %name, error = %e, "Failed to stop service");
            ok = false;
        }

        for svc in std::iter::once(name).chain(dependents.iter().map(String::as_str)) {
            match self.start_one(svc).await {
                Ok(()) => {
                    self.update(svc, |r| r.restart_count += 1).await;
                }
                Err(e) => {
                    error!(service = %svc, error = %e, "Failed to restart service");
                    ok = false;
                }
            }
        }

        if ok {
            info!(service = %name, "Service restarted");
        }
        Ok(ok)
    }

    /// Live instance of a running or degraded service.
    pub async fn get_service(&self, name: &str) -> Option<Arc<dyn Service>> {
        let records = self.records.read().await;
        let record = records.get(name)?;
        if record.state.is_active() {
            record.instance.clone()
        } else {
            None
        }
    }

    /// Live instance downcast to its concrete type.
    pub async fn get_service_as<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Service + 'static,
    {
        self.get_service(name).await?.into_any().downcast::<T>().ok()
    }

    /// Status of every registered service.
    ///
    /// Active services are asked for their status unless a cached value is
    /// still fresh; everything else, including services mid start or stop,
    /// gets a status derived from its record.
    pub async fn get_all_service_status(&self) -> BTreeMap<String, Status> {
        self.poll(None, false).await
    }

    /// Status of one service.
    pub async fn get_service_status(&self, name: &str) -> Option<Status> {
        self.poll(Some(name), false).await.remove(name)
    }

    /// Probe every active service now and restart those that have failed
    /// too many consecutive checks. Returns the names restarted.
    pub async fn check_health(&self) -> Vec<String> {
        self.poll(None, true).await;

        if !self.config.manager.auto_restart {
            return Vec::new();
        }

        let threshold = self.config.manager.max_health_failures;
        let due: Vec<String> = {
            let mut records = self.records.write().await;
            records
                .values_mut()
                .filter(|r| r.state.is_active() && r.health_failures >= threshold)
                .map(|r| {
                    r.health_failures = 0;
                    r.descriptor.name.clone()
                })
                .collect()
        };

        let mut restarted = Vec::new();
        for name in due {
            warn!(service = %name, failures = threshold, "Service failed health checks, restarting");
            match self.restart_service(&name).await {
                Ok(true) => restarted.push(name),
                Ok(false) => error!(service = %name, "Health restart did not fully succeed"),
                Err(e) => error!(service = %name, error = %e, "Health restart failed"),
            }
        }
        restarted
    }

    /// Current start order of the registered services.
    pub async fn start_order(&self) -> Result<Vec<String>> {
        self.graph().await.start_order()
    }

    /// State of a service; `Unregistered` for unknown names.
    pub async fn state(&self, name: &str) -> ServiceState {
        self.records
            .read()
            .await
            .get(name)
            .map(|r| r.state)
            .unwrap_or(ServiceState::Unregistered)
    }

    /// Last captured failure of a service.
    pub async fn last_error(&self, name: &str) -> Option<String> {
        self.records
            .read()
            .await
            .get(name)
            .and_then(|r| r.last_error.clone())
    }

    /// Snapshot of one record.
    pub async fn snapshot(&self, name: &str) -> Option<ServiceSnapshot> {
        self.records.read().await.get(name).map(|r| r.snapshot())
    }

    /// Snapshots of all records, by name.
    pub async fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut snapshots: Vec<ServiceSnapshot> = self
            .records
            .read()
            .await
            .values()
            .map(|r| r.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// List all service names.
    pub async fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a startup pass has completed and services were not stopped since.
    pub async fn is_started(&self) -> bool {
        *self.phase.read().await == Phase::Started
    }

    /// Start one service: dependency check, construction, bounded `start()`.
    async fn start_one(&self, name: &str) -> Result<()> {
        let op_lock = self.op_lock(name).await?;
        let _op = op_lock.lock().await;

        let (descriptor, missing) = {
            let records = self.records.read().await;
            let record = records
                .get(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

            if record.state.is_active() {
                debug!(service = %name, "Service is already running");
                return Ok(());
            }

            let missing = record
                .descriptor
                .dependencies
                .iter()
                .find(|dep| !records.get(*dep).map(|r| r.state.is_active()).unwrap_or(false))
                .cloned();
            (record.descriptor.clone(), missing)
        };

        if let Some(dependency) = missing {
            self.update(name, |r| {
                r.state = ServiceState::Failed;
                r.instance = None;
                r.last_error = Some(format!("dependency {} unavailable", dependency));
            })
            .await;
            warn!(service = %name, dependency = %dependency, "Dependency unavailable, not starting");
            return Err(Error::DependencyUnavailable {
                service: name.to_string(),
                dependency,
            });
        }

        let instance = match (descriptor.factory)(self.config.as_ref()) {
            Ok(instance) => instance,
            Err(e) => {
                let reason = format!("construction failed: {}", e);
                self.mark_failed(name, &reason).await;
                error!(service = %name, error = %e, "Failed to construct service");
                return Err(Error::ServiceStartFailed {
                    name: name.to_string(),
                    reason,
                });
            }
        };

        self.update(name, |r| {
            r.state = ServiceState::Starting;
            r.instance = Some(Arc::clone(&instance));
            r.instance_id = Some(Uuid::new_v4());
            r.last_polled = None;
            r.last_status = None;
        })
        .await;

        info!(service = %name, "Starting service");
        let timeout = descriptor
            .start_timeout
            .unwrap_or(self.config.manager.start_timeout);
        let started = Instant::now();

        let svc = Arc::clone(&instance);
        let outcome = match guarded(timeout, async move { svc.start().await }).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return self.fail_start(name, e.to_string()).await,
            Err(reason) => return self.fail_start(name, reason).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let degraded = match outcome {
            StartOutcome::Ready => None,
            StartOutcome::Degraded(reason) => Some(reason),
        };

        match degraded {
            Some(ref reason) => {
                warn!(service = %name, reason = %reason, duration_ms, "Service started degraded")
            }
            None => info!(service = %name, duration_ms, "Service started"),
        }

        self.update(name, move |r| {
            r.state = if degraded.is_some() {
                ServiceState::Degraded
            } else {
                ServiceState::Running
            };
            r.degraded_reason = degraded;
            r.last_error = None;
            r.started_at = Some(Utc::now());
            r.stopped_at = None;
            r.health_failures = 0;
        })
        .await;

        Ok(())
    }

    async fn fail_start(&self, name: &str, reason: String) -> Result<()> {
        error!(service = %name, error = %reason, "Failed to start service");
        self.mark_failed(name, &reason).await;
        Err(Error::ServiceStartFailed {
            name: name.to_string(),
            reason,
        })
    }

    async fn mark_failed(&self, name: &str, reason: &str) {
        self.update(name, |r| {
            r.state = ServiceState::Failed;
            r.instance = None;
            r.last_error = Some(reason.to_string());
            r.degraded_reason = None;
        })
        .await;
    }

    /// Stop one service with a bounded, guarded `stop()`.
    ///
    /// The record ends `Stopped` with its instance released even when the
    /// stop itself fails.
    async fn stop_one(&self, name: &str) -> Result<()> {
        let op_lock = self.op_lock(name).await?;
        let _op = op_lock.lock().await;

        let (instance, timeout) = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

            let instance = record.instance.take();
            let instance = match instance {
                Some(instance) if record.state.is_active() => instance,
                _ => {
                    record.state = ServiceState::Stopped;
                    record.degraded_reason = None;
                    return Ok(());
                }
            };

            record.state = ServiceState::Stopping;
            let timeout = record
                .descriptor
                .stop_timeout
                .unwrap_or(self.config.manager.stop_timeout);
            (instance, timeout)
        };

        info!(service = %name, "Stopping service");
        let result = guarded(timeout, async move { instance.stop().await }).await;

        self.update(name, |r| {
            r.state = ServiceState::Stopped;
            r.stopped_at = Some(Utc::now());
            r.started_at = None;
            r.degraded_reason = None;
            r.health_failures = 0;
        })
        .await;

        let reason = match result {
            Ok(Ok(())) => {
                info!(service = %name, "Service stopped");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(reason) => reason,
        };

        Err(Error::ServiceStopFailed {
            name: name.to_string(),
            reason,
        })
    }

    /// Stop everything and return to idle. Caller holds the lifecycle lock.
    async fn shutdown_locked(&self) {
        self.set_phase(Phase::Stopping).await;
        info!("Stopping all services");

        let order = match self.graph().await.stop_order() {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "Cannot order shutdown, falling back to priority order");
                let records = self.records.read().await;
                let mut names: Vec<(i32, String)> = records
                    .values()
                    .map(|r| (r.descriptor.priority, r.descriptor.name.clone()))
                    .collect();
                names.sort();
                names.into_iter().rev().map(|(_, name)| name).collect()
            }
        };

        for name in &order {
            if let Err(e) = self.stop_one(name).await {
                error!(service = %name, error = %e, "Failed to stop service");
            }
        }

        {
            let mut records = self.records.write().await;
            for record in records.values_mut() {
                record.instance = None;
                record.state = ServiceState::Stopped;
            }
        }

        self.set_phase(Phase::Idle).await;
        info!("All services stopped");
    }

    /// Probe services and cache the results.
    ///
    /// `force` skips the cache and counts failing probes toward automatic
    /// restarts.
    async fn poll(&self, only: Option<&str>, force: bool) -> BTreeMap<String, Status> {
        struct Target {
            name: String,
            probe: Option<(Arc<dyn Service>, Uuid, Arc<Mutex<()>>)>,
            fallback: Status,
        }

        let poll_interval = self.config.manager.poll_interval();
        let mut statuses = BTreeMap::new();

        let targets: Vec<Target> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| only.map_or(true, |n| n == r.descriptor.name))
                .filter_map(|r| {
                    let name = r.descriptor.name.clone();
                    let fresh = match (poll_interval, r.last_polled, &r.last_status) {
                        (Some(interval), Some(at), Some(_)) => at.elapsed() < interval,
                        _ => false,
                    };
                    if fresh && !force && r.state.is_active() {
                        if let Some(ref cached) = r.last_status {
                            statuses.insert(name, cached.clone());
                            return None;
                        }
                    }

                    let probe = match (&r.instance, r.instance_id) {
                        (Some(instance), Some(id)) if r.state.is_active() => {
                            Some((Arc::clone(instance), id, Arc::clone(&r.op_lock)))
                        }
                        _ => None,
                    };
                    Some(Target {
                        name,
                        probe,
                        fallback: r.synthesized_status(),
                    })
                })
                .collect()
        };

        let status_timeout = self.config.manager.status_timeout;
        let mut probed: Vec<(String, Uuid, Status)> = Vec::new();

        for target in targets {
            let (instance, id, op_lock) = match target.probe {
                Some(probe) => probe,
                None => {
                    statuses.insert(target.name, target.fallback);
                    continue;
                }
            };

            // A held operation lock means the service is mid start or stop.
            if op_lock.try_lock().is_err() {
                statuses.insert(target.name, target.fallback);
                continue;
            }

            let name = target.name.clone();
            let mut status = match guarded(status_timeout, async move { instance.get_status().await }).await {
                Ok(status) => status,
                Err(reason) => {
                    warn!(service = %name, error = %reason, "Status check failed");
                    Status::new(&name, HealthStatus::Offline).with_error(reason)
                }
            };
            status.name = name.clone();
            probed.push((name, id, status));
        }

        if !probed.is_empty() {
            let mut records = self.records.write().await;
            for (name, id, status) in probed {
                if let Some(record) = records.get_mut(&name) {
                    if record.instance_id == Some(id) && record.state.is_active() {
                        record.last_polled = Some(Instant::now());
                        record.degraded_reason = match status.status {
                            HealthStatus::Healthy => None,
                            _ => Some(
                                status
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| format!("reported {}", status.status)),
                            ),
                        };
                        if force {
                            if status.status.is_failing() {
                                record.health_failures += 1;
                            } else {
                                record.health_failures = 0;
                            }
                        }
                        record.last_status = Some(status.clone());
                    }
                }
                statuses.insert(name, status);
            }
        }

        self.reconcile().await;

        let records = self.records.read().await;
        for (name, status) in statuses.iter_mut() {
            if let Some(record) = records.get(name) {
                status
                    .details
                    .insert("state".to_string(), record.state.to_string().into());
            }
        }
        drop(records);
        statuses
    }

    /// Enforce "running only if every dependency is running".
    async fn reconcile(&self) {
        let order = match self.graph().await.start_order() {
            Ok(order) => order,
            Err(_) => return,
        };

        let mut records = self.records.write().await;
        for name in &order {
            let (active, blocked_by) = match records.get(name) {
                Some(record) => (
                    record.state.is_active(),
                    record
                        .descriptor
                        .dependencies
                        .iter()
                        .find(|dep| {
                            records.get(*dep).map(|r| r.state) != Some(ServiceState::Running)
                        })
                        .cloned(),
                ),
                None => continue,
            };
            if !active {
                continue;
            }

            if let Some(record) = records.get_mut(name) {
                let next = if blocked_by.is_some() || record.degraded_reason.is_some() {
                    ServiceState::Degraded
                } else {
                    ServiceState::Running
                };
                if next != record.state {
                    match (&blocked_by, next) {
                        (Some(dep), ServiceState::Degraded) => {
                            warn!(service = %name, dependency = %dep, "Dependency not running, service degraded")
                        }
                        (None, ServiceState::Degraded) => warn!(service = %name, "Service degraded"),
                        _ => info!(service = %name, "Service recovered"),
                    }
                    record.state = next;
                }
            }
        }
    }

    /// Active transitive dependents of `name`, in start order.
    async fn active_dependents(&self, name: &str) -> Result<Vec<String>> {
        let graph = self.graph().await;
        let order = graph.start_order()?;
        let dependents = graph.dependents_of(name);

        let records = self.records.read().await;
        Ok(order
            .into_iter()
            .filter(|n| dependents.contains(n))
            .filter(|n| records.get(n).map(|r| r.state.is_active()).unwrap_or(false))
            .collect())
    }

    async fn graph(&self) -> DependencyGraph {
        let records = self.records.read().await;
        DependencyGraph::from_descriptors(records.values().map(|r| &r.descriptor))
    }

    async fn ensure_registered(&self, name: &str) -> Result<()> {
        if self.records.read().await.contains_key(name) {
            Ok(())
        } else {
            Err(Error::ServiceNotFound(name.to_string()))
        }
    }

    async fn op_lock(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        self.records
            .read()
            .await
            .get(name)
            .map(|r| Arc::clone(&r.op_lock))
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    async fn update<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut ServiceRecord),
    {
        if let Some(record) = self.records.write().await.get_mut(name) {
            f(record);
        }
    }

    async fn set_phase(&self, phase: Phase) {
        *self.phase.write().await = phase;
    }

    /// Caller holds the lifecycle lock.
    async fn spawn_monitor(&self) {
        let mut slot = self.monitor.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        if let Some(interval) = self.config.manager.monitor_interval() {
            *slot = Some(monitor::spawn(self.clone(), interval));
        }
    }

    async fn stop_monitor(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

/// Run a service call on its own task, bounded by `timeout`.
///
/// Panics and timeouts come back as an error message; a timed out task is
/// aborted.
async fn guarded<F, T>(timeout: Duration, fut: F) -> std::result::Result<T, String>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_panic() => Err(format!("panicked: {}", panic_message(e.into_panic()))),
        Ok(Err(e)) => Err(format!("task failed: {}", e)),
        Err(_) => {
            handle.abort();
            Err(format!("timed out after {:?}", timeout))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
