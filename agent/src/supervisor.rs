// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor for services run in sub-processes.
//!
//! The supervisor owns the PID file, spawns each service as a child
//! process (a re-execution of the pgwarden binary), and restarts crashed
//! children according to their policy with exponential backoff.  A
//! service that keeps dying faster than it stays up brings the whole
//! tree down: there is no heuristic that can tell a transient failure
//! from a broken configuration, so after a bounded number of rapid
//! restarts the operator gets to decide.

use crate::pidfile::{self, PidFile, PidFileError};
use crate::signals::{ShutdownFlags, ShutdownMode};
use camino::Utf8PathBuf;
use slog::{debug, error, info, o, warn, Logger};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use warden_common::backoff::restart_delay;

/// Give up on a service after this many restarts without a stable run.
const MAX_RAPID_RESTARTS: u32 = 5;
/// A service up for this long gets its retry counter reset.
const STABLE_RUN_TIME: Duration = Duration::from_secs(60);
/// Base delay of the restart backoff (doubles per retry, capped at 32x).
const RESTART_DELAY_BASE: Duration = Duration::from_millis(500);
/// Cadence of the child-watching loop.
const SUPERVISION_INTERVAL: Duration = Duration::from_millis(100);
/// Shutdown escalation: loops before re-signaling, and before SIGKILL.
const ESCALATE_TERM_LOOPS: u32 = 50;
const ESCALATE_KILL_LOOPS: u32 = 300;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("another instance is already running with PID {pid}")]
    AlreadyRunning { pid: u32 },

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("failed to start service {name:?}")]
    SpawnFailed {
        name: String,
        #[source]
        err: std::io::Error,
    },

    #[error("service {name:?} kept failing, giving up")]
    ServiceGaveUp { name: String },

    #[error("lost ownership of the PID file")]
    PidFileLost,
}

/// Restart policies, in the Erlang supervisor tradition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart on any exit.
    Permanent,
    /// Restart only on abnormal exit; a clean exit ends the whole tree
    /// cleanly (used by one-shot initialization services).
    Transient,
    /// Never restart.
    Temporary,
}

/// What to do about one dead child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RestartDecision {
    Restart,
    LeaveDead,
    ShutdownClean,
    ShutdownFatal,
}

fn decide_restart(
    policy: RestartPolicy,
    exited_cleanly: bool,
    retries: u32,
) -> RestartDecision {
    if retries >= MAX_RAPID_RESTARTS {
        return RestartDecision::ShutdownFatal;
    }
    match policy {
        RestartPolicy::Temporary => RestartDecision::LeaveDead,
        RestartPolicy::Transient if exited_cleanly => {
            RestartDecision::ShutdownClean
        }
        RestartPolicy::Transient | RestartPolicy::Permanent => {
            RestartDecision::Restart
        }
    }
}

/// A service definition: a name, a policy, and the argv to execute.
#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub name: String,
    pub policy: RestartPolicy,
    pub argv: Vec<String>,
}

struct Service {
    spec: ServiceSpec,
    child: Option<Child>,
    pid: u32,
    retries: u32,
    started_at: Instant,
    /// Set while waiting out the restart backoff.
    restart_at: Option<Instant>,
    /// Dead and not coming back (temporary policy).
    done: bool,
}

impl Service {
    fn new(spec: ServiceSpec) -> Service {
        Service {
            spec,
            child: None,
            pid: 0,
            retries: 0,
            started_at: Instant::now(),
            restart_at: None,
            done: false,
        }
    }

    fn spawn(&mut self, log: &Logger) -> Result<(), SupervisorError> {
        let mut command = Command::new(&self.spec.argv[0]);
        command.args(&self.spec.argv[1..]);
        let child = command.spawn().map_err(|err| {
            SupervisorError::SpawnFailed {
                name: self.spec.name.clone(),
                err,
            }
        })?;
        self.pid = child.id().unwrap_or(0);
        self.child = Some(child);
        self.started_at = Instant::now();
        self.restart_at = None;
        info!(log, "started service";
            "service" => self.spec.name.as_str(), "pid" => self.pid);
        Ok(())
    }

    fn signal(&self, log: &Logger, signal: i32) {
        if self.child.is_none() || self.pid == 0 {
            return;
        }
        if unsafe { libc::kill(self.pid as libc::pid_t, signal) } != 0 {
            warn!(log, "failed to signal service";
                "service" => self.spec.name.as_str(),
                "pid" => self.pid,
                "signal" => signal);
        }
    }
}

/// Outcome the process should exit with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorOutcome {
    Clean,
    Failed,
}

pub struct Supervisor {
    services: Vec<Service>,
    pidfile_path: Utf8PathBuf,
    flags: ShutdownFlags,
    log: Logger,
    restart_delay_base: Duration,
}

impl Supervisor {
    pub fn new(
        log: &Logger,
        pidfile_path: Utf8PathBuf,
        specs: Vec<ServiceSpec>,
        flags: ShutdownFlags,
    ) -> Supervisor {
        Supervisor {
            services: specs.into_iter().map(Service::new).collect(),
            pidfile_path,
            flags,
            log: log.new(o!("component" => "Supervisor")),
            restart_delay_base: RESTART_DELAY_BASE,
        }
    }

    /// Overrides the restart backoff base.
    #[cfg(test)]
    fn restart_delay_base(mut self, base: Duration) -> Supervisor {
        self.restart_delay_base = base;
        self
    }

    /// Starts every service and supervises until they are gone.
    pub async fn run(&mut self) -> Result<SupervisorOutcome, SupervisorError> {
        let supervisor_pid = std::process::id();

        // Single instance per data directory.
        if let Some(pid) = pidfile::live_owner(&self.pidfile_path)? {
            return Err(SupervisorError::AlreadyRunning { pid });
        }
        pidfile::write(&self.pidfile_path, &PidFile::new(supervisor_pid))?;

        // Start in order; on failure stop whatever already started, in
        // reverse order.
        for index in 0..self.services.len() {
            if let Err(err) = {
                let log = self.log.clone();
                self.services[index].spawn(&log)
            } {
                error!(self.log, "failed to start services, stopping";
                    "error" => %err);
                for started in self.services[..index].iter().rev() {
                    started.signal(&self.log, libc::SIGQUIT);
                }
                let _ = pidfile::remove(&self.pidfile_path);
                return Err(err);
            }
        }
        self.write_pidfile(supervisor_pid)?;

        let outcome = self.supervise(supervisor_pid).await;
        pidfile::remove(&self.pidfile_path)?;
        info!(self.log, "supervisor stopped");
        outcome
    }

    async fn supervise(
        &mut self,
        supervisor_pid: u32,
    ) -> Result<SupervisorOutcome, SupervisorError> {
        let mut shutdown_in_progress = false;
        let mut clean_exit = true;
        let mut stopping_loops: u32 = 0;
        let mut gave_up: Option<String> = None;

        loop {
            tokio::time::sleep(SUPERVISION_INTERVAL).await;

            if !pidfile::owned_by(&self.pidfile_path, supervisor_pid) {
                error!(self.log, "PID file lost or overwritten, stopping");
                self.fan_out(libc::SIGQUIT);
                return Err(SupervisorError::PidFileLost);
            }

            if self.flags.take_reload() {
                info!(self.log, "reloading services");
                self.fan_out(libc::SIGHUP);
            }

            if !shutdown_in_progress && self.flags.should_stop() {
                shutdown_in_progress = true;
                let signal = match self.flags.mode() {
                    ShutdownMode::Immediate => libc::SIGQUIT,
                    ShutdownMode::Fast => libc::SIGINT,
                    _ => libc::SIGTERM,
                };
                info!(self.log, "stopping all services");
                self.fan_out(signal);
            }

            // Reap the dead.
            let mut pidfile_dirty = false;
            for index in 0..self.services.len() {
                let Some(status) = self.try_reap(index) else {
                    continue;
                };
                pidfile_dirty = true;
                let service = &mut self.services[index];
                let exited_cleanly = status.success();
                let uptime = service.started_at.elapsed();

                if uptime >= STABLE_RUN_TIME {
                    service.retries = 0;
                }

                let level_error = !exited_cleanly
                    && service.spec.policy != RestartPolicy::Temporary;
                if level_error {
                    error!(self.log, "service exited";
                        "service" => service.spec.name.as_str(),
                        "status" => %status);
                } else {
                    info!(self.log, "service exited";
                        "service" => service.spec.name.as_str(),
                        "status" => %status);
                }

                if shutdown_in_progress {
                    service.done = true;
                    continue;
                }

                match decide_restart(
                    service.spec.policy,
                    exited_cleanly,
                    service.retries,
                ) {
                    RestartDecision::Restart => {
                        service.retries += 1;
                        let delay = restart_delay(
                            service.retries - 1,
                            self.restart_delay_base,
                        );
                        debug!(self.log, "scheduling restart";
                            "service" => service.spec.name.as_str(),
                            "retries" => service.retries,
                            "delay_ms" => delay.as_millis() as u64);
                        service.restart_at = Some(Instant::now() + delay);
                    }
                    RestartDecision::LeaveDead => {
                        service.done = true;
                    }
                    RestartDecision::ShutdownClean => {
                        info!(self.log,
                            "service finished, shutting down";
                            "service" => service.spec.name.as_str());
                        service.done = true;
                        shutdown_in_progress = true;
                        self.fan_out(libc::SIGTERM);
                    }
                    RestartDecision::ShutdownFatal => {
                        error!(self.log,
                            "service restarted {} times in a row, \
                             giving up",
                            service.retries;
                            "service" => service.spec.name.as_str());
                        gave_up = Some(service.spec.name.clone());
                        service.done = true;
                        clean_exit = false;
                        shutdown_in_progress = true;
                        self.fan_out(libc::SIGTERM);
                    }
                }
            }

            // Start services whose backoff has elapsed.
            if !shutdown_in_progress {
                for index in 0..self.services.len() {
                    let due = matches!(
                        self.services[index].restart_at,
                        Some(at) if at <= Instant::now()
                    );
                    if due {
                        let log = self.log.clone();
                        match self.services[index].spawn(&log) {
                            Ok(()) => pidfile_dirty = true,
                            Err(err) => {
                                error!(self.log,
                                    "failed to restart service";
                                    "error" => %err);
                                clean_exit = false;
                                shutdown_in_progress = true;
                                self.fan_out(libc::SIGTERM);
                            }
                        }
                    }
                }
            }

            if pidfile_dirty {
                self.write_pidfile(supervisor_pid)?;
            }

            if shutdown_in_progress {
                stopping_loops += 1;
                self.shutdown_sequence(stopping_loops);
                if self.services.iter().all(|s| s.child.is_none()) {
                    break;
                }
            } else if self
                .services
                .iter()
                .all(|s| s.done && s.child.is_none())
            {
                // every service was temporary and has finished
                break;
            }
        }

        if let Some(name) = gave_up {
            return Err(SupervisorError::ServiceGaveUp { name });
        }
        if clean_exit {
            Ok(SupervisorOutcome::Clean)
        } else {
            Ok(SupervisorOutcome::Failed)
        }
    }

    /// One waitpid(WNOHANG)-style poll of a child.  Returns the exit
    /// status when the child just died.
    fn try_reap(&mut self, index: usize) -> Option<std::process::ExitStatus> {
        let service = &mut self.services[index];
        let child = service.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                service.child = None;
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(self.log, "failed to poll service";
                    "service" => service.spec.name.as_str(), "error" => %err);
                None
            }
        }
    }

    fn fan_out(&self, signal: i32) {
        for service in &self.services {
            service.signal(&self.log, signal);
        }
    }

    /// Insist on shutdown for children that will not die: re-signal
    /// SIGTERM after ~5s, then SIGKILL at the bounded timeout.
    fn shutdown_sequence(&self, stopping_loops: u32) {
        if stopping_loops == 1 {
            info!(self.log, "waiting for services to terminate");
        }
        if stopping_loops == ESCALATE_TERM_LOOPS {
            info!(self.log,
                "services are still running, signaling them again");
            self.fan_out(libc::SIGTERM);
        }
        if stopping_loops == ESCALATE_KILL_LOOPS {
            warn!(self.log,
                "services did not terminate in time, killing them");
            self.fan_out(libc::SIGKILL);
        }
    }

    fn write_pidfile(
        &self,
        supervisor_pid: u32,
    ) -> Result<(), SupervisorError> {
        let mut pidfile = PidFile::new(supervisor_pid);
        for service in &self.services {
            if service.child.is_some() {
                pidfile
                    .services
                    .push((service.spec.name.clone(), service.pid));
            }
        }
        pidfile::write(&self.pidfile_path, &pidfile)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::signals::ShutdownFlags;

    #[test]
    fn restart_decision_matrix() {
        use RestartDecision as D;
        use RestartPolicy as P;

        // permanent restarts on anything
        assert_eq!(decide_restart(P::Permanent, true, 0), D::Restart);
        assert_eq!(decide_restart(P::Permanent, false, 0), D::Restart);

        // transient restarts only on failure
        assert_eq!(decide_restart(P::Transient, false, 0), D::Restart);
        assert_eq!(decide_restart(P::Transient, true, 0), D::ShutdownClean);

        // temporary never restarts
        assert_eq!(decide_restart(P::Temporary, true, 0), D::LeaveDead);
        assert_eq!(decide_restart(P::Temporary, false, 0), D::LeaveDead);

        // too many rapid restarts overrides everything
        assert_eq!(
            decide_restart(P::Permanent, false, MAX_RAPID_RESTARTS),
            D::ShutdownFatal
        );
        assert_eq!(
            decide_restart(P::Transient, true, MAX_RAPID_RESTARTS),
            D::ShutdownFatal
        );
    }

    #[tokio::test]
    async fn refuses_to_start_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("s.pid"))
            .unwrap();

        // pretend a live supervisor (ourselves) owns the PID file
        pidfile::write(&path, &PidFile::new(std::process::id())).unwrap();

        let log = Logger::root(slog::Discard, o!());
        let mut supervisor = Supervisor::new(
            &log,
            path,
            vec![],
            ShutdownFlags::detached(),
        );
        let err = supervisor.run().await.err().expect("must refuse");
        assert!(matches!(
            err,
            SupervisorError::AlreadyRunning { pid } if pid == std::process::id()
        ));
    }

    #[tokio::test]
    async fn transient_service_clean_exit_stops_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("s.pid"))
            .unwrap();
        let log = Logger::root(slog::Discard, o!());

        let mut supervisor = Supervisor::new(
            &log,
            path.clone(),
            vec![ServiceSpec {
                name: "init".to_string(),
                policy: RestartPolicy::Transient,
                argv: vec!["/bin/true".to_string()],
            }],
            ShutdownFlags::detached(),
        );
        let outcome = supervisor.run().await.unwrap();
        assert_eq!(outcome, SupervisorOutcome::Clean);
        // PID file removed on clean exit
        assert!(pidfile::read(&path).unwrap().is_none());
    }

    #[tokio::test]
    async fn permanent_service_gives_up_after_rapid_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("s.pid"))
            .unwrap();
        let log = Logger::root(slog::Discard, o!());

        let mut supervisor = Supervisor::new(
            &log,
            path,
            vec![ServiceSpec {
                name: "crasher".to_string(),
                policy: RestartPolicy::Permanent,
                argv: vec!["/bin/false".to_string()],
            }],
            ShutdownFlags::detached(),
        )
        .restart_delay_base(Duration::from_millis(1));
        let err = supervisor.run().await.err().expect("must give up");
        assert!(matches!(
            err,
            SupervisorError::ServiceGaveUp { name } if name == "crasher"
        ));
    }
}
