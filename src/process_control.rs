/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::command::{CommandSpec, Executor, Redirect};
use anyhow::Context;
use chrono::{DateTime, Utc};
use colored::*;
use std::{fmt, time::Duration};
use subprocess::{ExitStatus, Popen};
use sysinfo::{ProcessStatus, System};
use tracing::{debug, warn};

/// The operations the driver needs from a running process.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Returns the exit status if the process has already exited.
    fn poll(&mut self) -> Option<ExitStatus>;

    /// Politely asks the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> anyhow::Result<()>;

    /// Forcefully ends the process (SIGKILL on unix).
    fn kill(&mut self) -> anyhow::Result<()>;

    /// Waits at most `timeout` for the process to exit. `Ok(None)` means it is still running.
    fn wait_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<ExitStatus>>;
}

pub struct PopenHandle {
    popen: Popen,
}
impl PopenHandle {
    pub fn new(popen: Popen) -> Self {
        Self { popen }
    }
}

impl ProcessHandle for PopenHandle {
    fn pid(&self) -> Option<u32> {
        self.popen.pid()
    }

    fn poll(&mut self) -> Option<ExitStatus> {
        self.popen.poll()
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.popen
            .terminate()
            .context("Failed to send terminate signal")
    }

    fn kill(&mut self) -> anyhow::Result<()> {
        self.popen.kill().context("Failed to send kill signal")
    }

    fn wait_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<ExitStatus>> {
        self.popen
            .wait_timeout(timeout)
            .context("Failed waiting for process to exit")
    }
}

/// Stand-in process used by the dry-run executor. It runs until it is told to stop.
#[derive(Debug, Default)]
pub struct DryRunHandle {
    exited: Option<ExitStatus>,
}

impl ProcessHandle for DryRunHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn poll(&mut self) -> Option<ExitStatus> {
        self.exited
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.exited = Some(ExitStatus::Signaled(15));
        Ok(())
    }

    fn kill(&mut self) -> anyhow::Result<()> {
        self.exited = Some(ExitStatus::Signaled(9));
        Ok(())
    }

    fn wait_timeout(&mut self, _timeout: Duration) -> anyhow::Result<Option<ExitStatus>> {
        Ok(self.exited)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    StatisticsCollector,
    Crawler,
    Workload,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessRole::StatisticsCollector => "statistics collector",
            ProcessRole::Crawler => "crawler",
            ProcessRole::Workload => "workload generator",
        };
        write!(f, "{}", name)
    }
}

/// How a managed process is expected to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Terminate, wait for the grace period, then kill if it is still alive.
    Graceful,
    /// Kill straight away. Used for processes that loop forever.
    Kill,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// The handle had already been stopped.
    NotRunning,
    /// The process had exited on its own before teardown.
    AlreadyExited(ExitStatus),
    /// The process exited after being asked to terminate.
    Terminated(ExitStatus),
    /// The process was killed. `escalated` is set when a graceful stop timed out first.
    Killed { escalated: bool },
    /// A kill was sent but the exit was not observed; the by-name sweep has to catch it.
    Unconfirmed,
}

/// A background process started for a single iteration. The iteration owns it; dropping it
/// without calling [`ManagedProcess::stop`] kills the process.
pub struct ManagedProcess {
    role: ProcessRole,
    name: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    termination: Termination,
    handle: Option<Box<dyn ProcessHandle>>,
}
impl ManagedProcess {
    pub fn new(
        role: ProcessRole,
        name: impl Into<String>,
        termination: Termination,
        handle: Box<dyn ProcessHandle>,
    ) -> Self {
        Self {
            role,
            name: name.into(),
            pid: handle.pid(),
            started_at: Utc::now(),
            termination,
            handle: Some(handle),
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stops the process according to its termination discipline. Every wait is bounded by
    /// `grace`, so a process that ignores signals can delay teardown but never block it.
    pub fn stop(&mut self, grace: Duration) -> StopOutcome {
        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::NotRunning;
        };

        if let Some(status) = handle.poll() {
            debug!("{} ({}) had already exited: {:?}", self.role, self.name, status);
            return StopOutcome::AlreadyExited(status);
        }

        match self.termination {
            Termination::Graceful => {
                if let Err(err) = handle.terminate() {
                    warn!("Failed to terminate {} ({}): {:#}", self.role, self.name, err);
                }
                match handle.wait_timeout(grace) {
                    Ok(Some(status)) => return StopOutcome::Terminated(status),
                    Ok(None) => warn!(
                        "{} ({}) still running {}s after terminate, killing",
                        self.role,
                        self.name,
                        grace.as_secs_f32()
                    ),
                    Err(err) => warn!("{:#}", err),
                }
                self.kill_and_reap(handle.as_mut(), grace, true)
            }
            Termination::Kill => self.kill_and_reap(handle.as_mut(), grace, false),
        }
    }

    fn kill_and_reap(
        &self,
        handle: &mut dyn ProcessHandle,
        grace: Duration,
        escalated: bool,
    ) -> StopOutcome {
        if let Err(err) = handle.kill() {
            warn!("Failed to kill {} ({}): {:#}", self.role, self.name, err);
        }
        match handle.wait_timeout(grace) {
            Ok(Some(_)) => StopOutcome::Killed { escalated },
            Ok(None) => {
                warn!("{} ({}) did not exit after kill", self.role, self.name);
                StopOutcome::Unconfirmed
            }
            Err(err) => {
                warn!("{:#}", err);
                StopOutcome::Unconfirmed
            }
        }
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("role", &self.role)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("termination", &self.termination)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            warn!(
                "{} ({}) dropped while running, killing it",
                self.role, self.name
            );
            let _ = handle.kill();
            let _ = handle.wait_timeout(Duration::from_secs(1));
        }
    }
}

/// Result of `pkill -9 <name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillByName {
    Matched,
    NoneMatched,
}

/// Sends SIGKILL to every process whose name matches `name`. `pkill` exits with 1 when nothing
/// matched, which is the normal case after a clean teardown and not an error.
pub fn force_kill_by_name(
    executor: &dyn Executor,
    name: &str,
    sudo: bool,
) -> anyhow::Result<KillByName> {
    let cmd = CommandSpec::new("pkill").arg("-9").arg(name).sudo(sudo);
    let outcome = executor.run(&cmd)?;
    match outcome.exit_code() {
        Some(0) => {
            println!("\t{}", format!("- {}", cmd).bright_black());
            Ok(KillByName::Matched)
        }
        Some(1) => Ok(KillByName::NoneMatched),
        _ => Err(anyhow::anyhow!(
            "`{}` failed with {}",
            cmd,
            outcome.describe()
        )),
    }
}

/// Returns `(pid, name)` of every live process on this machine whose name contains one of
/// `names`, excluding the driver itself. Zombies are already dead and are not reported.
pub fn find_residual_processes(names: &[String]) -> Vec<(u32, String)> {
    let mut system = System::new();
    system.refresh_all();

    let own_pid = std::process::id();
    let mut found = system
        .processes()
        .iter()
        .filter_map(|(pid, proc)| {
            let proc_name = proc.name().to_string_lossy().to_string();
            let matches = names.iter().any(|n| proc_name.contains(n.as_str()));
            let alive = proc.status() != ProcessStatus::Zombie;
            (matches && alive && pid.as_u32() != own_pid).then(|| (pid.as_u32(), proc_name))
        })
        .collect::<Vec<_>>();
    found.sort();
    found
}

/// Scans for residual processes until none are left or `settle` has passed, and returns the last
/// scan. Processes killed a moment ago can still be in the table while the kernel reaps them.
pub async fn wait_for_residuals(names: &[String], settle: Duration) -> Vec<(u32, String)> {
    let deadline = tokio::time::Instant::now() + settle;
    loop {
        let found = find_residual_processes(names);
        if found.is_empty() || tokio::time::Instant::now() >= deadline {
            return found;
        }
        debug!("{} processes still listed, rescanning", found.len());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
