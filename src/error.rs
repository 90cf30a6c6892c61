use std::io;

use thiserror::Error;

/// Everything that can go wrong while copying a file to or from a pod.
#[derive(Error, Debug)] // can't derive PartialEq because of std::io::Error
pub enum Error {
    #[error("can not download directory: {0}")]
    DirectoryDownload(String),
    #[error("can not upload directory: {0}")]
    DirectoryUpload(String),
    #[error("tar contents corrupted: unexpected entry {name:?} (expected prefix {prefix:?})")]
    CorruptedArchive { name: String, prefix: String },
    #[error("{0}: no regular file in the archive")]
    NotFound(String),
    #[error("source does not match the declared size of {expected} bytes")]
    SizeMismatch { expected: u64 },
    #[error("command `{command}` failed with {}{}", exit_note(.status), stderr_note(.stderr))]
    Remote {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to launch {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid file specification {spec:?}: {reason}")]
    InvalidFileSpec { spec: String, reason: &'static str },
    #[error("no input stream to upload")]
    MissingInput,
    #[error("a transfer worker thread panicked")]
    WorkerPanicked,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn exit_note(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by a signal?)".to_string(),
    }
}

fn stderr_note(stderr: &str) -> String {
    match stderr.trim() {
        "" => String::new(),
        msg => format!(": {msg}"),
    }
}
