//! Single-file copy in and out of Kubernetes pods.
//!
//! There is no filesystem access to the pod: every transfer is a byte stream produced or consumed
//! by a `tar` process running inside the container, driven through a [`exec::RemoteExecutor`].
//! Downloads survive a dropped stream by relaunching the remote `tar` and skipping the bytes that
//! were already delivered (see [`tarpipe::TarPipe`]).

pub mod archive;
pub mod client;
pub mod config;
pub mod copy;
pub mod error;
pub mod exec;
pub mod path;
pub mod pipe;
pub mod tarpipe;


pub use error::{Error, Result};
