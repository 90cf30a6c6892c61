//! A small handle-based API over the copy engine.
//!
//! ```no_run
//! use podcopy::{client::Client, config::ClientConfig};
//!
//! # fn main() -> podcopy::Result<()> {
//! let client = Client::kubectl(ClientConfig::from_env());
//! let file = client.file("default", "bastion-relay-2", "/tmp/buddy.txt").max_retries(3);
//! file.write_from_reader(&b"This is Good thing."[..], Some(19))?;
//! file.read_to_writer(std::io::stdout())?;
//! # Ok(())
//! # }
//! ```

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use crate::{
    config::ClientConfig,
    copy::{CopyOptions, DownloadStats, IoStreams},
    error::Result,
    exec::{ExecRequest, PodTarget, ProcessExecutor, RemoteExecutor},
};

/// Entry point: holds the way commands reach the cluster and hands out [`File`] and [`Shell`]
/// handles sharing it.
#[derive(Clone)]
pub struct Client {
    executor: Arc<dyn RemoteExecutor>,
}

impl Client {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Client { executor }
    }

    /// A client going through `kubectl exec`.
    pub fn kubectl(config: ClientConfig) -> Self {
        Self::new(Arc::new(ProcessExecutor::kubectl(config)))
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    pub fn file(
        &self,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        path: impl Into<String>,
    ) -> File {
        File {
            executor: Arc::clone(&self.executor),
            namespace: namespace.into(),
            pod: pod.into(),
            path: path.into(),
            container: None,
            max_retries: 0,
            no_preserve: false,
        }
    }

    /// A command to run attached to the local terminal.  `command` defaults to `sh` when empty.
    pub fn shell(
        &self,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Shell {
        let mut command = command.into();
        if command.is_empty() {
            command = "sh".into();
        }
        let mut argv = vec![command];
        argv.extend(args.into_iter().map(Into::into));

        Shell {
            executor: Arc::clone(&self.executor),
            target: PodTarget {
                namespace: namespace.into(),
                pod: pod.into(),
                container: None,
            },
            command: argv,
            tty: true,
            interactive: true,
        }
    }
}

/// A single file in a pod.
#[derive(Clone)]
pub struct File {
    executor: Arc<dyn RemoteExecutor>,
    namespace: String,
    pod: String,
    path: String,
    container: Option<String>,
    max_retries: i32,
    no_preserve: bool,
}

impl File {
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Negative values retry downloads without limit.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn no_preserve(mut self, no_preserve: bool) -> Self {
        self.no_preserve = no_preserve;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn options<'a>(&self, streams: IoStreams<'a>) -> CopyOptions<'a> {
        let mut options = CopyOptions::new(
            Arc::clone(&self.executor),
            &self.namespace,
            &self.pod,
            &self.path,
        );
        options.container = self.container.clone();
        options.max_retries = self.max_retries;
        options.no_preserve = self.no_preserve;
        options.streams = streams;
        options
    }

    /// Downloads the file into `writer`.  Retry notices and warnings go to stderr.
    pub fn read_to_writer(&self, writer: impl Write + Send) -> Result<DownloadStats> {
        self.read_to_writer_with_notices(writer, io::stderr())
    }

    pub fn read_to_writer_with_notices(
        &self,
        writer: impl Write + Send,
        notices: impl Write + Send,
    ) -> Result<DownloadStats> {
        let mut options = self.options(IoStreams {
            input: None,
            out: Box::new(writer),
            err_out: Box::new(notices),
        });
        options.copy_from_pod()
    }

    /// Uploads the contents of `reader`, which must be exactly `len` bytes long if given.
    pub fn write_from_reader(&self, reader: impl Read + Send, len: Option<u64>) -> Result<()> {
        let mut options = self.options(IoStreams {
            input: Some(Box::new(reader)),
            out: Box::new(io::sink()),
            err_out: Box::new(io::stderr()),
        });
        options.input_size = len;
        options.copy_to_pod()
    }
}

/// A command run in a pod with the local process's stdio.
#[derive(Clone)]
pub struct Shell {
    executor: Arc<dyn RemoteExecutor>,
    target: PodTarget,
    command: Vec<String>,
    tty: bool,
    interactive: bool,
}

impl Shell {
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.target.container = Some(container.into());
        self
    }

    /// Allocate a terminal in the container.  On by default.
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Forward our stdin.  On by default.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn request(&self) -> ExecRequest {
        ExecRequest::new(self.target.clone(), self.command.clone()).with_tty(self.tty)
    }

    /// Runs the command to completion.  A non-zero exit status is an error.
    pub fn run(&self) -> Result<()> {
        let request = self.request();
        let mut stdout = io::stdout();
        let mut stderr = io::stderr();
        let stdin: Option<Box<dyn Read + Send>> = match self.interactive {
            true => Some(Box::new(io::stdin())),
            false => None,
        };
        self.executor.execute(&request, stdin, &mut stdout, &mut stderr)
    }
}
