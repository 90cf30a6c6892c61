//! Running commands inside a container.
//!
//! Every transfer is built out of commands run in the pod with their stdio wired to local
//! streams.  [`RemoteExecutor`] is that capability; [`ProcessExecutor`] provides it by spawning
//! `kubectl exec` (or, for tests and local debugging, the command itself).

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    process::{Command, Stdio},
    thread,
};

use log::debug;

use crate::{
    config::ClientConfig,
    error::{Error, Result},
};

// how much of the remote stderr we keep for error messages
const STDERR_TAIL_MAX: usize = 4096;

/// The container a command runs in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
    /// `None` picks the pod's default container.
    pub container: Option<String>,
}

/// A single command invocation against a [`PodTarget`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    pub target: PodTarget,
    pub command: Vec<String>,
    pub tty: bool,
}

impl ExecRequest {
    pub fn new(target: PodTarget, command: Vec<String>) -> Self {
        ExecRequest {
            target,
            command,
            tty: false,
        }
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// The command as a single string, for messages.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Runs a command in a container and wires up its stdio.
///
/// `execute` returns once the remote process has exited and its output streams are drained.  A
/// non-zero exit is an error.  When `stdin` is `None` the remote process gets an empty stdin.
///
/// `stdin` is owned so that a source which never ends, like a terminal, can be left behind once
/// the remote process is gone.
pub trait RemoteExecutor: Send + Sync {
    fn execute(
        &self,
        request: &ExecRequest,
        stdin: Option<Box<dyn Read + Send>>,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<()>;
}

/// Where a [`ProcessExecutor`] actually runs the command.
#[derive(Clone, Debug)]
pub enum Launcher {
    /// `kubectl exec` into the target container.
    Kubectl(ClientConfig),
    /// Directly on this host, ignoring the target.
    Local,
}

impl Launcher {
    fn command(&self, request: &ExecRequest, with_stdin: bool) -> Result<Command> {
        match self {
            Launcher::Kubectl(config) => {
                let mut cmd = Command::new(&config.kubectl);
                cmd.args(config.global_args());
                cmd.arg("exec");
                if with_stdin {
                    cmd.arg("-i");
                }
                if request.tty {
                    cmd.arg("-t");
                }
                cmd.args(["-n", &request.target.namespace, &request.target.pod]);
                if let Some(container) = &request.target.container {
                    cmd.args(["-c", container]);
                }
                cmd.arg("--");
                cmd.args(&request.command);
                Ok(cmd)
            }
            Launcher::Local => {
                let Some((program, args)) = request.command.split_first() else {
                    return Err(Error::Spawn {
                        program: String::new(),
                        source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
                    });
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
        }
    }
}

/// Provides [`RemoteExecutor`] by spawning a local process per command.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    launcher: Launcher,
}

impl ProcessExecutor {
    pub fn new(launcher: Launcher) -> Self {
        ProcessExecutor { launcher }
    }

    pub fn kubectl(config: ClientConfig) -> Self {
        Self::new(Launcher::Kubectl(config))
    }

    pub fn local() -> Self {
        Self::new(Launcher::Local)
    }

    // A terminal session needs the real terminal on our side, so the streams are not used.
    fn execute_tty(&self, request: &ExecRequest) -> Result<()> {
        let mut cmd = self.launcher.command(request, true)?;
        debug!("running {cmd:?} attached to the terminal");
        let status = cmd
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| Error::Spawn {
                program: format!("{:?}", cmd.get_program()),
                source,
            })?;
        if !status.success() {
            return Err(Error::Remote {
                command: request.command_line(),
                status: status.code(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

impl RemoteExecutor for ProcessExecutor {
    fn execute(
        &self,
        request: &ExecRequest,
        stdin: Option<Box<dyn Read + Send>>,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<()> {
        if request.tty {
            return self.execute_tty(request);
        }

        let mut cmd = self.launcher.command(request, stdin.is_some())?;
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        debug!("running {cmd:?}");
        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: format!("{:?}", cmd.get_program()),
            source,
        })?;

        let child_stdin = child.stdin.take();
        let mut child_stdout = child.stdout.take().ok_or_else(|| io::Error::other("no stdout"))?;
        let mut child_stderr = child.stderr.take().ok_or_else(|| io::Error::other("no stderr"))?;

        // Not joined: an input that never ends would keep us here after the command exited.  The
        // copier ends on its own at end-of-input or at the first write after the command is gone.
        if let (Some(mut input), Some(mut pipe)) = (stdin, child_stdin) {
            thread::Builder::new()
                .name("podcopy-stdin".into())
                .spawn(move || {
                    // the remote side sees end-of-input when `pipe` drops
                    if let Err(err) = io::copy(&mut input, &mut pipe) {
                        debug!("stdin copy stopped: {err}");
                    }
                })?;
        }

        let (copied, stderr_tail) = thread::scope(|scope| {
            let errors = scope.spawn(move || {
                let mut tail = StderrTail::new(stderr);
                let _ = io::copy(&mut child_stderr, &mut tail);
                tail.into_string()
            });

            let copied = io::copy(&mut child_stdout, stdout);
            if copied.is_err() {
                // our consumer went away; don't leave the command blocked on a full pipe
                let _ = child.kill();
            }
            // grandchildren of a killed `sh -c` only go away once their stdout breaks
            drop(child_stdout);
            // the stderr copier only ends with the child, so a panic there is the only failure
            let stderr_tail = errors.join().unwrap_or_default();
            (copied, stderr_tail)
        });

        let status = child.wait()?;
        let copied = copied?;
        debug!("{} exited with {status} after {copied} bytes", request.command_line());

        if !status.success() {
            return Err(Error::Remote {
                command: request.command_line(),
                status: status.code(),
                stderr: stderr_tail,
            });
        }
        Ok(())
    }
}

/// Forwards remote stderr while remembering the last few KiB of it.
struct StderrTail<'a> {
    inner: &'a mut (dyn Write + Send),
    tail: VecDeque<u8>,
}

impl<'a> StderrTail<'a> {
    fn new(inner: &'a mut (dyn Write + Send)) -> Self {
        StderrTail {
            inner,
            tail: VecDeque::new(),
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&Vec::from(self.tail)).into_owned()
    }
}

impl Write for StderrTail<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tail.extend(buf);
        let excess = self.tail.len().saturating_sub(STDERR_TAIL_MAX);
        self.tail.drain(..excess);
        // a broken error stream shouldn't fail the command
        let _ = self.inner.write_all(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.inner.flush();
        Ok(())
    }
}
