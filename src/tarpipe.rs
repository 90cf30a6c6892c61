//! A download stream that survives the remote producer dying.
//!
//! [`TarPipe`] runs `tar cf -` in the pod on a worker thread and reads its output through an
//! in-process pipe.  When a read fails and the retry budget allows it, the remote command is
//! launched again with its output piped through `tail -c+N`, skipping the bytes that were
//! already delivered, and reading carries on from the new pipe.
//!
//! This only reassembles the right bytes if the second `tar` run produces output identical to the
//! first one from that offset on.  That holds for an unchanged file, but nothing checks it: if the
//! file changes between attempts the result is garbage, or a corrupted archive error at best.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use log::{debug, warn};

use crate::{
    error::Result,
    exec::{ExecRequest, PodTarget, RemoteExecutor},
    path::{shell_quote, RemoteFile},
    pipe::{spawn_producer, PipeReader},
};

/// How many times a download may be restarted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryBudget {
    Limited(u32),
    Unlimited,
}

impl RetryBudget {
    fn allows(self, used: u32) -> bool {
        match self {
            RetryBudget::Limited(max) => used < max,
            RetryBudget::Unlimited => true,
        }
    }

    /// Without any retries there is nothing to resume, so the plain `tar` command is used.
    fn resumable(self) -> bool {
        self != RetryBudget::Limited(0)
    }
}

impl From<i32> for RetryBudget {
    /// Negative counts mean "retry forever".
    fn from(max_retries: i32) -> Self {
        match u32::try_from(max_retries) {
            Ok(max) => RetryBudget::Limited(max),
            Err(..) => RetryBudget::Unlimited,
        }
    }
}

impl fmt::Display for RetryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryBudget::Limited(max) => write!(f, "{max}"),
            RetryBudget::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Where a [`TarPipe`] is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeState {
    /// Reading from the current remote command.
    Streaming,
    /// The last read failed.
    Failed,
    /// Relaunching the remote command from the resume offset.
    Resuming,
    /// The budget is spent; the last error was handed to the caller.
    GivenUp,
}

/// The remote side of a download: which file, which container, and how to run commands there.
#[derive(Clone)]
pub struct TarSource {
    pub file: RemoteFile,
    pub container: Option<String>,
    pub executor: Arc<dyn RemoteExecutor>,
}

impl TarSource {
    /// The command producing the archive, starting at the 1-based byte `offset`.
    pub fn command(&self, resumable: bool, offset: u64) -> Vec<String> {
        let path = self.file.path.as_str();
        if resumable {
            vec![
                "sh".into(),
                "-c".into(),
                format!("tar cf - {} | tail -c+{offset}", shell_quote(path)),
            ]
        } else {
            vec!["tar".into(), "cf".into(), "-".into(), path.into()]
        }
    }

    fn target(&self) -> PodTarget {
        PodTarget {
            namespace: self.file.namespace.clone(),
            pod: self.file.pod.clone(),
            container: self.container.clone(),
        }
    }

    /// Starts the remote command on a worker thread and returns the reading end of its stdout.
    fn launch(&self, resumable: bool, offset: u64) -> Result<PipeReader> {
        let request = ExecRequest::new(self.target(), self.command(resumable, offset));
        let executor = Arc::clone(&self.executor);
        debug!(
            "launching `{}` in {}/{}",
            request.command_line(),
            request.target.namespace,
            request.target.pod
        );
        let (reader, _worker) = spawn_producer("podcopy-tar-reader", move |writer| {
            executor.execute(&request, None, writer, &mut io::sink())
        })?;
        Ok(reader)
    }
}

/// A [`Read`] over a remote `tar cf -` that restarts it on failure.
///
/// Resumption notices are written to `notices`.
pub struct TarPipe<E: Write> {
    source: TarSource,
    budget: RetryBudget,
    reader: PipeReader,
    bytes_read: u64,
    retries: u32,
    state: PipeState,
    notices: E,
}

impl<E: Write> fmt::Debug for TarPipe<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TarPipe")
            .field("file", &self.source.file)
            .field("budget", &self.budget)
            .field("bytes_read", &self.bytes_read)
            .field("retries", &self.retries)
            .field("state", &self.state)
            .finish()
    }
}

impl<E: Write> TarPipe<E> {
    /// Launches the remote `tar` and returns immediately.
    pub fn new(source: TarSource, budget: RetryBudget, notices: E) -> Result<Self> {
        let reader = source.launch(budget.resumable(), 1)?;
        Ok(TarPipe {
            source,
            budget,
            reader,
            bytes_read: 0,
            retries: 0,
            state: PipeState::Streaming,
            notices,
        })
    }

    /// Bytes handed to the caller so far, over all attempts.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    fn resume(&mut self) -> io::Result<()> {
        self.state = PipeState::Resuming;
        self.retries += 1;

        warn!(
            "resuming copy of {} at {} bytes, retry {}/{}",
            self.source.file.path, self.bytes_read, self.retries, self.budget
        );
        if let Err(err) = writeln!(
            self.notices,
            "Resuming copy at {} bytes, retry {}/{}",
            self.bytes_read, self.retries, self.budget
        ) {
            debug!("dropped resume notice: {err}");
        }

        // the old reader is dropped here, which releases its worker if it is still running
        self.reader = self
            .source
            .launch(true, self.bytes_read + 1)
            .map_err(io::Error::other)?;
        self.state = PipeState::Streaming;
        Ok(())
    }
}

impl<E: Write> Read for TarPipe<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.reader.read(buf) {
                Ok(n) => {
                    self.bytes_read += n as u64;
                    return Ok(n);
                }
                Err(err) => {
                    self.state = PipeState::Failed;
                    debug!("read failed after {} bytes: {err}", self.bytes_read);

                    if !self.budget.allows(self.retries) {
                        self.state = PipeState::GivenUp;
                        warn!("giving up on {} after {} retries", self.source.file.path, self.retries);
                        if let Err(notice_err) = writeln!(
                            self.notices,
                            "Dropping out copy after {} retries",
                            self.retries
                        ) {
                            debug!("dropped give-up notice: {notice_err}");
                        }
                        return Err(err);
                    }

                    self.resume()?;
                }
            }
        }
    }
}
