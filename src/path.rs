//! Paths on either side of a copy.
//!
//! Remote paths are always `/`-separated strings, regardless of the local platform, and are only
//! ever manipulated lexically: we have no way to ask the pod what a path resolves to.

use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

use crate::error::{Error, Result};

/// Lexically normalizes a `/`-separated path.
///
/// Repeated separators and `.` segments are removed and `..` segments eat the preceding segment.
/// A `..` at the root is dropped (`/..` is `/`), while a leading `..` of a relative path is kept.
/// The empty path cleans to `.`.
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = vec![];

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if !rooted => segments.push(".."),
                _ => {}
            },
            name => segments.push(name),
        }
    }

    let joined = segments.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Removes every leading `/` and every `..` segment from a cleaned copy of `path`.
///
/// The result is always relative and never walks above the directory it's interpreted in.  Paths
/// made only of shortcuts (`/`, `.`, `../..`) strip down to the empty string.
pub fn strip_path_shortcuts(path: &str) -> String {
    clean(path)
        .split('/')
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect::<Vec<_>>()
        .join("/")
}

/// Single-quotes `value` for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A path inside a pod.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl Into<String>) -> Self {
        RemotePath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The last element of the path, ignoring trailing slashes.  `/` for the root and `.` for the
    /// empty path.
    pub fn base(&self) -> RemotePath {
        if self.0.is_empty() {
            return RemotePath::new(".");
        }
        let trimmed = self.0.trim_end_matches('/');
        if trimmed.is_empty() {
            return RemotePath::new("/");
        }
        match trimmed.rfind('/') {
            Some(idx) => RemotePath::new(&trimmed[idx + 1..]),
            None => RemotePath::new(trimmed),
        }
    }

    /// Everything but the last element, cleaned.  `.` if there is no directory part.
    pub fn dir(&self) -> RemotePath {
        match self.0.rfind('/') {
            Some(idx) => RemotePath::new(clean(&self.0[..=idx])),
            None => RemotePath::new("."),
        }
    }

    pub fn clean(&self) -> RemotePath {
        RemotePath::new(clean(&self.0))
    }

    pub fn strip_slashes(&self) -> RemotePath {
        RemotePath::new(self.0.trim_start_matches('/'))
    }

    pub fn join(&self, name: impl AsRef<str>) -> RemotePath {
        RemotePath::new(clean(&format!("{}/{}", self.0, name.as_ref())))
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A path on the local host.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalPath(PathBuf);

impl LocalPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalPath(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// True for `-`, which the command line uses for stdin/stdout.
    pub fn is_stdio(&self) -> bool {
        self.0.as_os_str() == "-"
    }

    pub fn base(&self) -> Option<&str> {
        self.0.file_name().and_then(|name| name.to_str())
    }

    pub fn dir(&self) -> LocalPath {
        match self.0.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => LocalPath::new(parent),
            _ => LocalPath::new("."),
        }
    }

    pub fn clean(&self) -> LocalPath {
        let mut cleaned = PathBuf::new();
        for component in self.0.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !cleaned.pop() {
                        cleaned.push("..");
                    }
                }
                other => cleaned.push(other),
            }
        }
        if cleaned.as_os_str().is_empty() {
            cleaned.push(".");
        }
        LocalPath(cleaned)
    }
}

impl fmt::Display for LocalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

/// A file inside a specific pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    pub namespace: String,
    pub pod: String,
    pub path: RemotePath,
}

/// One end of a copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSpec {
    Remote(RemoteFile),
    Local(LocalPath),
}

impl FileSpec {
    /// Parses `[namespace/]pod:path`, or anything without a `:` as a local path.
    pub fn parse(spec: &str, default_namespace: &str) -> Result<FileSpec> {
        let Some((pod, path)) = spec.split_once(':') else {
            return Ok(FileSpec::Local(LocalPath::new(spec)));
        };

        let invalid = |reason| Error::InvalidFileSpec {
            spec: spec.to_string(),
            reason,
        };

        if path.is_empty() {
            return Err(invalid("remote path cannot be empty"));
        }

        let (namespace, pod) = match pod.split('/').collect::<Vec<_>>()[..] {
            [pod] => (default_namespace, pod),
            [namespace, pod] => (namespace, pod),
            _ => return Err(invalid("must match [namespace/]pod:path")),
        };
        if namespace.is_empty() || pod.is_empty() {
            return Err(invalid("namespace and pod name cannot be empty"));
        }

        Ok(FileSpec::Remote(RemoteFile {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            path: RemotePath::new(path),
        }))
    }
}
