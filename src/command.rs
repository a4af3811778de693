/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::process_control::{DryRunHandle, PopenHandle, ProcessHandle};
use anyhow::Context;
use std::{
    fmt,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use subprocess::{Exec, ExitStatus, NullFile, Redirection};
use tracing::{debug, info};

/// Where the standard output and error of a spawned process go.
#[derive(Debug, Clone, PartialEq)]
pub enum Redirect {
    /// Discard both streams.
    Null,
    /// Inherit the driver's streams.
    Parent,
    /// Write stdout to the given file (truncated), discard stderr.
    File(PathBuf),
}

/// An external command as a program plus an argument list. Nothing is ever passed through a
/// shell, so arguments are never re-split or expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    sudo: bool,
}
impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: None,
            sudo: false,
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// Appends `flag value`.
    pub fn opt(self, flag: &str, value: impl ToString) -> Self {
        self.arg(flag).arg(value)
    }

    /// Appends `flag value` only when a value is present.
    pub fn opt_if_some<T: ToString>(self, flag: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.opt(flag, value),
            None => self,
        }
    }

    /// Appends a bare switch only when `enabled` is true.
    pub fn switch_if(self, enabled: bool, flag: &str) -> Self {
        if enabled {
            self.arg(flag)
        } else {
            self
        }
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args_slice(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn uses_sudo(&self) -> bool {
        self.sudo
    }

    /// The full argument vector as it will be executed, `sudo` included.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            argv.push("sudo".to_string());
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Number of times `flag` appears as a standalone argument.
    pub fn count_of(&self, flag: &str) -> usize {
        self.args.iter().filter(|a| a.as_str() == flag).count()
    }

    /// The argument following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(|s| s.as_str())
    }

    fn exec(&self) -> Exec {
        let argv = self.argv();
        let exec = Exec::cmd(&argv[0]).args(&argv[1..]);
        match &self.cwd {
            Some(dir) => exec.cwd(dir),
            None => exec,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let argv = self.argv();
        let joined = shlex::try_join(argv.iter().map(|s| s.as_str()))
            .unwrap_or_else(|_| argv.join(" "));
        write!(f, "{}", joined)
    }
}

/// Exit status and captured output of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}
impl CommandOutcome {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::Exited(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: u32, stderr: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::Exited(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<u32> {
        match self.status {
            ExitStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// One line describing a failure, suitable for a warning.
    pub fn describe(&self) -> String {
        let status = match self.status {
            ExitStatus::Exited(code) => format!("exit code {}", code),
            ExitStatus::Signaled(sig) => format!("killed by signal {}", sig),
            ExitStatus::Other(other) => format!("status {}", other),
            ExitStatus::Undetermined => "undetermined status".to_string(),
        };
        match self.stderr.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("{}: {}", status, line.trim()),
            None => status,
        }
    }
}

/// Runs and spawns external commands. The driver only talks to the outside world through this
/// trait, which keeps argument construction testable without starting anything.
pub trait Executor {
    /// Runs the command to completion, capturing its output. An `Err` means the command could not
    /// be started at all; a non-zero exit is reported through the returned outcome.
    fn run(&self, cmd: &CommandSpec) -> anyhow::Result<CommandOutcome>;

    /// Starts the command in the background and returns a handle to it.
    fn spawn(&self, cmd: &CommandSpec, redirect: &Redirect)
        -> anyhow::Result<Box<dyn ProcessHandle>>;
}

/// Executes commands on this machine with the `subprocess` crate.
#[derive(Debug, Default)]
pub struct SystemExecutor;

/// Reads back everything written to an unnamed capture file.
fn read_capture(file: &mut File) -> anyhow::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = vec![];
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl Executor for SystemExecutor {
    /// Output goes to anonymous temp files rather than pipes: scripts such as the cluster
    /// bring-up leave daemons behind that inherit the output descriptors, and a pipe would not
    /// reach EOF until those daemons exit. The call returns as soon as the command itself exits.
    fn run(&self, cmd: &CommandSpec) -> anyhow::Result<CommandOutcome> {
        debug!("running {}", cmd);
        let mut stdout = tempfile::tempfile().context("Failed to create capture file")?;
        let mut stderr = tempfile::tempfile().context("Failed to create capture file")?;

        let mut popen = cmd
            .exec()
            .stdout(Redirection::File(stdout.try_clone()?))
            .stderr(Redirection::File(stderr.try_clone()?))
            .popen()
            .context(format!("Failed to run command: {}", cmd))?;
        let status = popen
            .wait()
            .context(format!("Failed to wait for command: {}", cmd))?;

        Ok(CommandOutcome {
            status,
            stdout: read_capture(&mut stdout)?,
            stderr: read_capture(&mut stderr)?,
        })
    }

    fn spawn(
        &self,
        cmd: &CommandSpec,
        redirect: &Redirect,
    ) -> anyhow::Result<Box<dyn ProcessHandle>> {
        debug!("spawning {}", cmd);
        let exec = cmd.exec();
        let exec = match redirect {
            Redirect::Null => exec.stdout(NullFile).stderr(NullFile),
            Redirect::Parent => exec,
            Redirect::File(path) => {
                let out_file = File::create(path)
                    .context(format!("Failed to create log file {}", path.display()))?;
                exec.stdout(Redirection::File(out_file)).stderr(NullFile)
            }
        };

        let popen = exec
            .detached()
            .popen()
            .context(format!("Failed to spawn detached process, command: {}", cmd))?;

        Ok(Box::new(PopenHandle::new(popen)))
    }
}

/// Logs every command instead of executing it. Spawned processes are inert handles that "exit"
/// as soon as they are asked to.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

impl Executor for DryRunExecutor {
    fn run(&self, cmd: &CommandSpec) -> anyhow::Result<CommandOutcome> {
        info!("[dry-run] {}", cmd);
        Ok(CommandOutcome::ok(""))
    }

    fn spawn(
        &self,
        cmd: &CommandSpec,
        redirect: &Redirect,
    ) -> anyhow::Result<Box<dyn ProcessHandle>> {
        match redirect {
            Redirect::File(path) => info!("[dry-run] {} > {}", cmd, path.display()),
            _ => info!("[dry-run] {} &", cmd),
        }
        Ok(Box::new(DryRunHandle::default()))
    }
}
