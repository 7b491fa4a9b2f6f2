//! Process Supervisor
//!
//! Keeps every roster service running. Each service has one record behind
//! its own async mutex; start, stop, restart and the liveness check all
//! take that lock for their whole duration, so a restart always finishes
//! stopping the old process before the new one is spawned and two
//! instances of the same service never coexist.
//!
//! Background loops (one liveness loop per service, the preventive restart
//! loop, the refresh poll loop) stop at their next iteration once the
//! cancellation token fires. The services are then stopped in reverse
//! start order.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use plugshare_core::{SupervisorConfig, SupervisorError};

use crate::refresh::RefreshTrigger;
use crate::roster::{Roster, ServiceSpec, PREVENTIVE_TARGET, REFRESH_TARGETS};

/// Loop intervals and timeouts
#[derive(Clone, Debug)]
pub struct SupervisorTimings {
    pub liveness_interval: Duration,
    pub preventive_restart: Duration,
    pub refresh_poll: Duration,
    pub stop_timeout: Duration,
    pub restart_settle: Duration,
}

impl From<&SupervisorConfig> for SupervisorTimings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            liveness_interval: Duration::from_secs(config.liveness_interval_secs.max(1)),
            preventive_restart: Duration::from_secs(config.preventive_restart_secs.max(1)),
            refresh_poll: Duration::from_secs(config.refresh_poll_secs.max(1)),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            restart_settle: Duration::from_secs(config.restart_settle_secs),
        }
    }
}

/// Point-in-time view of one service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub last_exit: Option<i32>,
    pub restarts: u32,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }
}

#[derive(Default)]
struct ServiceRecord {
    child: Option<Child>,
    pid: Option<u32>,
    last_exit: Option<i32>,
    restarts: u32,
    /// Should be running; false after an intentional stop
    desired: bool,
}

struct ServiceSlot {
    spec: ServiceSpec,
    record: Mutex<ServiceRecord>,
}

pub struct Supervisor {
    slots: Vec<ServiceSlot>,
    timings: SupervisorTimings,
    refresh: Mutex<RefreshTrigger>,
}

impl Supervisor {
    pub fn new(roster: Roster, timings: SupervisorTimings, refresh: RefreshTrigger) -> Self {
        let slots = roster
            .services()
            .iter()
            .map(|spec| ServiceSlot {
                spec: spec.clone(),
                record: Mutex::new(ServiceRecord::default()),
            })
            .collect();
        Self {
            slots,
            timings,
            refresh: Mutex::new(refresh),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Result<Self, SupervisorError> {
        let roster = Roster::from_config(config)?;
        Ok(Self::new(
            roster,
            SupervisorTimings::from(config),
            RefreshTrigger::new(config.refresh_file.clone()),
        ))
    }

    fn slot(&self, name: &str) -> Result<&ServiceSlot, SupervisorError> {
        self.slots
            .iter()
            .find(|s| s.spec.name == name)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
    }

    /// Start a service. Returns the pid; already running is not an error.
    pub async fn start(&self, name: &str) -> Result<u32, SupervisorError> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        if let Some(pid) = running_pid(&slot.spec, &mut record) {
            debug!("{} already running (pid {})", name, pid);
            return Ok(pid);
        }
        spawn(&slot.spec, &mut record)
    }

    /// Stop a service and keep it stopped.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        record.desired = false;
        terminate(&slot.spec, &mut record, self.timings.stop_timeout).await;
        Ok(())
    }

    /// Stop, pause, start. The old instance is gone before the new one exists.
    pub async fn restart(&self, name: &str) -> Result<u32, SupervisorError> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        info!("Restarting {}", name);
        terminate(&slot.spec, &mut record, self.timings.stop_timeout).await;
        if !self.timings.restart_settle.is_zero() {
            tokio::time::sleep(self.timings.restart_settle).await;
        }
        record.restarts += 1;
        spawn(&slot.spec, &mut record)
    }

    /// One liveness pass: restart the service if it exited or never started.
    ///
    /// Returns true if a (re)start was attempted.
    pub async fn check(&self, name: &str) -> Result<bool, SupervisorError> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        if !record.desired || running_pid(&slot.spec, &mut record).is_some() {
            return Ok(false);
        }

        record.restarts += 1;
        if let Err(e) = spawn(&slot.spec, &mut record) {
            debug!("Liveness restart of {} failed: {}", name, e);
        }
        Ok(true)
    }

    /// Act on a pending refresh request. Returns true if one was consumed.
    pub async fn check_refresh(&self) -> bool {
        let requested = self.refresh.lock().await.poll();
        if requested.is_none() {
            return false;
        }
        for name in REFRESH_TARGETS {
            if let Err(e) = self.restart(name).await {
                error!("Refresh restart of {} failed: {}", name, e);
            }
        }
        true
    }

    pub async fn snapshot(&self) -> Vec<ServiceStatus> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let record = slot.record.lock().await;
            out.push(ServiceStatus {
                name: slot.spec.name.clone(),
                pid: record.child.as_ref().and(record.pid),
                last_exit: record.last_exit,
                restarts: record.restarts,
            });
        }
        out
    }

    /// Start every service in roster order; failures are left to the liveness loop.
    pub async fn start_all(&self) {
        for slot in &self.slots {
            if let Err(e) = self.start(&slot.spec.name).await {
                warn!("{} (liveness loop will retry)", e);
            }
        }
    }

    /// Stop every service in reverse roster order
    pub async fn shutdown(&self) {
        for slot in self.slots.iter().rev() {
            if let Err(e) = self.stop(&slot.spec.name).await {
                warn!("{}", e);
            }
        }
        info!("All services stopped");
    }

    /// Run until `cancel` fires, then stop everything.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.start_all().await;

        let mut tasks = Vec::new();
        for slot in &self.slots {
            tasks.push(tokio::spawn(liveness_loop(
                self.clone(),
                slot.spec.name.clone(),
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(preventive_loop(self.clone(), cancel.clone())));
        tasks.push(tokio::spawn(refresh_loop(self.clone(), cancel.clone())));
        info!("Supervising {} services", self.slots.len());

        cancel.cancelled().await;
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Supervisor loop panicked: {}", e);
            }
        }
        self.shutdown().await;
    }
}

async fn liveness_loop(supervisor: Arc<Supervisor>, name: String, cancel: CancellationToken) {
    let period = supervisor.timings.liveness_interval;
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if let Err(e) = supervisor.check(&name).await {
            error!("{}", e);
        }
    }
    debug!("Liveness loop for {} stopped", name);
}

async fn preventive_loop(supervisor: Arc<Supervisor>, cancel: CancellationToken) {
    let period = supervisor.timings.preventive_restart;
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        info!("Preventive restart of {}", PREVENTIVE_TARGET);
        if let Err(e) = supervisor.restart(PREVENTIVE_TARGET).await {
            error!("Preventive restart failed: {}", e);
        }
    }
}

async fn refresh_loop(supervisor: Arc<Supervisor>, cancel: CancellationToken) {
    let period = supervisor.timings.refresh_poll;
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        supervisor.check_refresh().await;
    }
}

/// Pid of the live child, reaping it (and recording its exit) if it ended.
fn running_pid(spec: &ServiceSpec, record: &mut ServiceRecord) -> Option<u32> {
    let child = record.child.as_mut()?;
    match child.try_wait() {
        Ok(None) => record.pid,
        Ok(Some(status)) => {
            warn!("{} (pid {:?}) exited: {}", spec.name, record.pid, describe(status));
            record.last_exit = status.code();
            record.child = None;
            record.pid = None;
            None
        }
        Err(e) => {
            warn!("Cannot poll {}: {}", spec.name, e);
            record.pid
        }
    }
}

fn spawn(spec: &ServiceSpec, record: &mut ServiceRecord) -> Result<u32, SupervisorError> {
    record.desired = true;
    let result = Command::new(&spec.command.program)
        .args(&spec.command.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    match result {
        Ok(child) => {
            let pid = child.id().unwrap_or_default();
            info!("Started {} (pid {})", spec.name, pid);
            record.child = Some(child);
            record.pid = Some(pid);
            Ok(pid)
        }
        Err(e) => {
            record.child = None;
            record.pid = None;
            let err = SupervisorError::ProcessStartFailed {
                name: spec.name.clone(),
                reason: format!("{:?}: {}", spec.command.program, e),
            };
            error!("{}", err);
            Err(err)
        }
    }
}

/// SIGTERM, bounded wait, then SIGKILL. Always clears the record's handle.
async fn terminate(spec: &ServiceSpec, record: &mut ServiceRecord, timeout: Duration) {
    let Some(mut child) = record.child.take() else {
        record.pid = None;
        return;
    };
    let pid = record.pid.take();

    if let Ok(Some(status)) = child.try_wait() {
        debug!("{} had already exited: {}", spec.name, describe(status));
        record.last_exit = status.code();
        return;
    }

    if let Some(raw) = child.id().and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", spec.name, e);
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!("Stopped {}: {}", spec.name, describe(status));
            record.last_exit = status.code();
        }
        Ok(Err(e)) => warn!("Waiting for {} failed: {}", spec.name, e),
        Err(_) => {
            let err = SupervisorError::ProcessTerminateTimeout {
                name: spec.name.clone(),
                pid: pid.unwrap_or_default(),
                timeout_secs: timeout.as_secs(),
            };
            warn!("{}, killing", err);
            if let Err(e) = child.kill().await {
                warn!("Killing {} failed: {}", spec.name, e);
            }
            record.last_exit = None;
        }
    }
}

fn describe(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{DEVICE_MONITOR, FILE_SERVER, SHARE_CONTROLLER};
    use plugshare_core::ServiceCommand;
    use std::fs;

    fn sh(script: &str) -> ServiceCommand {
        ServiceCommand::new("/bin/sh", &["-c", script])
    }

    fn timings() -> SupervisorTimings {
        SupervisorTimings {
            liveness_interval: Duration::from_millis(100),
            preventive_restart: Duration::from_secs(3600),
            refresh_poll: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            restart_settle: Duration::ZERO,
        }
    }

    fn supervisor(
        dm: ServiceCommand,
        sc: ServiceCommand,
        fs_cmd: ServiceCommand,
        refresh: &std::path::Path,
    ) -> Supervisor {
        let roster = Roster::new(vec![
            ServiceSpec::new(DEVICE_MONITOR, dm),
            ServiceSpec::new(SHARE_CONTROLLER, sc),
            ServiceSpec::new(FILE_SERVER, fs_cmd),
        ])
        .unwrap();
        Supervisor::new(roster, timings(), RefreshTrigger::new(refresh))
    }

    fn sleepers(refresh: &std::path::Path) -> Supervisor {
        supervisor(sh("exec sleep 30"), sh("exec sleep 30"), sh("exec sleep 30"), refresh)
    }

    async fn status(sup: &Supervisor, name: &str) -> ServiceStatus {
        sup.snapshot()
            .await
            .into_iter()
            .find(|s| s.name == name)
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = sleepers(&dir.path().join("refresh"));

        let pid = sup.start(DEVICE_MONITOR).await.unwrap();
        assert_eq!(status(&sup, DEVICE_MONITOR).await.pid, Some(pid));

        // A second start does not spawn a second instance
        assert_eq!(sup.start(DEVICE_MONITOR).await.unwrap(), pid);

        sup.stop(DEVICE_MONITOR).await.unwrap();
        let st = status(&sup, DEVICE_MONITOR).await;
        assert!(!st.is_running());
        assert!(!sup.check(DEVICE_MONITOR).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let dir = tempfile::tempdir().unwrap();
        let sup = sleepers(&dir.path().join("refresh"));
        assert!(matches!(
            sup.start("web-ui").await,
            Err(SupervisorError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(
            sh("trap '' TERM; exec sleep 30"),
            sh("exec sleep 30"),
            sh("exec sleep 30"),
            &dir.path().join("refresh"),
        );
        sup.timings.stop_timeout = Duration::from_millis(300);

        sup.start(DEVICE_MONITOR).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.stop(DEVICE_MONITOR).await.unwrap();

        assert!(!status(&sup, DEVICE_MONITOR).await.is_running());
    }

    #[tokio::test]
    async fn test_crashed_service_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            sh("exec sleep 30"),
            sh("exit 3"),
            sh("exec sleep 30"),
            &dir.path().join("refresh"),
        );

        let first = sup.start(SHARE_CONTROLLER).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(sup.check(SHARE_CONTROLLER).await.unwrap());
        let st = status(&sup, SHARE_CONTROLLER).await;
        assert_eq!(st.last_exit, Some(3));
        assert_eq!(st.restarts, 1);
        assert!(st.pid.is_some());
        assert_ne!(st.pid, Some(first));
    }

    #[tokio::test]
    async fn test_start_failure_retried_by_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            sh("exec sleep 30"),
            sh("exec sleep 30"),
            ServiceCommand::new("/nonexistent/plugshare-fileserver", &[]),
            &dir.path().join("refresh"),
        );

        let err = sup.start(FILE_SERVER).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessStartFailed { .. }));
        assert!(!status(&sup, FILE_SERVER).await.is_running());

        // Still desired, so the liveness pass tries again
        assert!(sup.check(FILE_SERVER).await.unwrap());
        assert!(!status(&sup, FILE_SERVER).await.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_restarts_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(sleepers(&dir.path().join("refresh")));
        sup.start(DEVICE_MONITOR).await.unwrap();

        let (a, b, c) = tokio::join!(
            sup.restart(DEVICE_MONITOR),
            sup.restart(DEVICE_MONITOR),
            sup.check(DEVICE_MONITOR),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        c.unwrap();

        assert_ne!(a, b);
        let st = status(&sup, DEVICE_MONITOR).await;
        assert_eq!(st.restarts, 2);
        // Only the most recent instance is alive
        let older = if st.pid == Some(a) { b } else { a };
        assert!(kill(Pid::from_raw(older as i32), None).is_err());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_restarts_targets_once() {
        let dir = tempfile::tempdir().unwrap();
        let refresh = dir.path().join("refresh");
        let sup = sleepers(&refresh);
        sup.start_all().await;

        fs::write(&refresh, "1700000000").unwrap();
        assert!(sup.check_refresh().await);
        assert!(!refresh.exists());

        fs::write(&refresh, "1700000000").unwrap();
        assert!(!sup.check_refresh().await);

        let snapshot = sup.snapshot().await;
        let restarts: Vec<(String, u32)> =
            snapshot.iter().map(|s| (s.name.clone(), s.restarts)).collect();
        assert_eq!(
            restarts,
            vec![
                (DEVICE_MONITOR.to_string(), 1),
                (SHARE_CONTROLLER.to_string(), 1),
                (FILE_SERVER.to_string(), 0),
            ]
        );
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_recovers_crash_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed-once");
        // Exits on its first run, stays up afterwards
        let script = format!(
            "if [ -e {0} ]; then exec sleep 30; else touch {0}; exit 1; fi",
            marker.display()
        );
        let sup = Arc::new(supervisor(
            sh("exec sleep 30"),
            sh(&script),
            sh("exec sleep 30"),
            &dir.path().join("refresh"),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sup.clone().run(cancel.clone()));

        let mut recovered = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let st = status(&sup, SHARE_CONTROLLER).await;
            if st.restarts >= 1 && st.is_running() {
                recovered = true;
                break;
            }
        }

        cancel.cancel();
        task.await.unwrap();
        assert!(recovered);
        assert!(sup.snapshot().await.iter().all(|s| !s.is_running()));
    }
}
