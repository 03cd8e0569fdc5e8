//! Services backed by a supervised child process.

use crate::config::ServiceSettings;
use crate::error::ServiceError;
use crate::service::{HealthReportable, HealthStatus, StartOutcome, Startable, Status, Stoppable};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long a process gets after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// How long a process must stay alive to count as started.
pub const DEFAULT_READY_DELAY: Duration = Duration::from_millis(200);

struct Running {
    child: Child,
    pid: u32,
    started: Instant,
}

/// A service that is a long-running child process.
pub struct ProcessService {
    name: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_directory: Option<PathBuf>,
    ready_delay: Duration,
    stop_grace: Duration,
    version: Option<String>,
    running: Mutex<Option<Running>>,
}

impl ProcessService {
    /// Create a process service running `exec`.
    ///
    /// `exec` is split on whitespace and the extra words come before `args`.
    /// An argument that itself contains spaces, such as a model path, must
    /// go in `args`, which are passed through untouched.
    pub fn new(name: impl Into<String>, exec: &str, args: Vec<String>) -> Result<Self, ServiceError> {
        let name = name.into();
        let mut parts = exec.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ServiceError::failed(format!("{}: empty exec command", name)))?
            .to_string();
        let args = parts.map(String::from).chain(args).collect();

        Ok(Self {
            name,
            program,
            args,
            env: BTreeMap::new(),
            working_directory: None,
            ready_delay: DEFAULT_READY_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
            version: None,
            running: Mutex::new(None),
        })
    }

    /// Build from manifest settings.
    pub fn from_settings(name: &str, settings: &ServiceSettings) -> Result<Self, ServiceError> {
        let exec = settings
            .exec
            .as_deref()
            .ok_or_else(|| ServiceError::failed(format!("{}: no exec configured", name)))?;

        let mut service = Self::new(name, exec, settings.args.clone())?;
        service.env = settings.env.clone();
        service.working_directory = settings.working_directory.clone();
        service.version = settings.version.clone();
        if let Some(delay) = settings.ready_delay {
            service.ready_delay = delay;
        }
        Ok(service)
    }

    /// Set the time the process must survive before it counts as started.
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    /// Set the SIGTERM grace period.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// PID of the running process.
    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().map(|r| r.pid)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Forward each line of a child's output stream to the log.
fn forward_output<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(service = %service, stream, "{}", line);
        }
    });
}

#[async_trait]
impl Startable for ProcessService {
    async fn start(&self) -> Result<StartOutcome, ServiceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(StartOutcome::Ready);
        }

        let mut child = self.command().spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ServiceError::Unavailable(format!("{}: {}", self.program, e))
            }
            _ => ServiceError::Io(e),
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ServiceError::failed("process exited before it could be tracked"))?;
        info!(service = %self.name, pid, program = %self.program, "Spawned process");

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.name.clone(), "stderr", stderr);
        }

        tokio::time::sleep(self.ready_delay).await;
        if let Some(status) = child.try_wait()? {
            return Err(ServiceError::failed(format!(
                "process exited during startup: {}",
                status
            )));
        }

        *running = Some(Running {
            child,
            pid,
            started: Instant::now(),
        });
        Ok(StartOutcome::Ready)
    }
}

#[async_trait]
impl Stoppable for ProcessService {
    async fn stop(&self) -> Result<(), ServiceError> {
        let Some(mut process) = self.running.lock().await.take() else {
            return Ok(());
        };

        if let Some(status) = process.child.try_wait()? {
            debug!(service = %self.name, %status, "Process already exited");
            return Ok(());
        }

        if let Err(e) = signal::kill(Pid::from_raw(process.pid as i32), Signal::SIGTERM) {
            warn!(service = %self.name, pid = process.pid, error = %e, "Failed to send SIGTERM");
        }

        match tokio::time::timeout(self.stop_grace, process.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(service = %self.name, pid = process.pid, %status, "Process exited");
            }
            Err(_) => {
                warn!(service = %self.name, pid = process.pid, "Process didn't exit in time, sending SIGKILL");
                process.child.kill().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HealthReportable for ProcessService {
    async fn get_status(&self) -> Status {
        let mut running = self.running.lock().await;

        let mut status = match running.as_mut() {
            None => Status::new(&self.name, HealthStatus::Offline).with_error("not running"),
            Some(process) => match process.child.try_wait() {
                Ok(None) => Status::new(&self.name, HealthStatus::Healthy)
                    .with_detail("pid", process.pid)
                    .with_detail("uptime_secs", process.started.elapsed().as_secs()),
                Ok(Some(exit)) => Status::new(&self.name, HealthStatus::Unhealthy)
                    .with_detail("pid", process.pid)
                    .with_error(format!("process exited: {}", exit)),
                Err(e) => Status::new(&self.name, HealthStatus::Unhealthy)
                    .with_error(format!("cannot query process: {}", e)),
            },
        };

        status = status.with_detail("program", self.program.clone());
        if let Some(ref version) = self.version {
            status = status.with_version(version.clone());
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> ProcessService {
        ProcessService::new("sleeper", "sleep 30", Vec::new())
            .unwrap()
            .with_ready_delay(Duration::from_millis(50))
            .with_stop_grace(Duration::from_secs(2))
    }

    #[test]
    fn test_exec_arguments_come_first() {
        let svc = ProcessService::new("stt", "whisper --model base", vec!["--port".into(), "9000".into()])
            .unwrap();
        assert_eq!(svc.program, "whisper");
        assert_eq!(svc.args, vec!["--model", "base", "--port", "9000"]);
    }

    #[test]
    fn test_args_keep_embedded_spaces() {
        let svc = ProcessService::new(
            "tts",
            "piper",
            vec!["--model".into(), "/srv/voices/en US/lessac.onnx".into()],
        )
        .unwrap();
        assert_eq!(svc.program, "piper");
        assert_eq!(svc.args, vec!["--model", "/srv/voices/en US/lessac.onnx"]);
    }

    #[test]
    fn test_empty_exec_rejected() {
        assert!(ProcessService::new("stt", "   ", Vec::new()).is_err());
    }

    #[test]
    fn test_from_settings_requires_exec() {
        let settings = ServiceSettings::endpoint("127.0.0.1:1");
        assert!(ProcessService::from_settings("llm", &settings).is_err());
    }

    #[tokio::test]
    async fn test_start_status_stop() {
        let svc = sleeper();
        assert_eq!(svc.start().await.unwrap(), StartOutcome::Ready);
        assert!(svc.pid().await.is_some());

        let status = svc.get_status().await;
        assert_eq!(status.status, HealthStatus::Healthy);
        assert!(status.details.contains_key("pid"));

        svc.stop().await.unwrap();
        assert!(svc.pid().await.is_none());
        assert_eq!(svc.get_status().await.status, HealthStatus::Offline);
    }

    #[tokio::test]
    async fn test_early_exit_fails_start() {
        let svc = ProcessService::new("flaky", "false", Vec::new())
            .unwrap()
            .with_ready_delay(Duration::from_millis(300));
        let err = svc.start().await.unwrap_err();
        assert!(err.to_string().contains("exited during startup"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let svc = ProcessService::new("ghost", "/nonexistent/concierge-ghost", Vec::new()).unwrap();
        assert!(matches!(svc.start().await, Err(ServiceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        sleeper().stop().await.unwrap();
    }
}
