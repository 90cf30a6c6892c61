//! Moving one file between a local stream and a pod.

use std::{
    cell::RefCell,
    fmt,
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
    thread,
};

use log::{debug, info};

use crate::{
    archive::{make_tar, untar_all},
    error::{Error, Result},
    exec::{ExecRequest, PodTarget, RemoteExecutor},
    path::{strip_path_shortcuts, RemoteFile, RemotePath},
    pipe::pipe,
    tarpipe::{RetryBudget, TarPipe, TarSource},
};

/// The local ends of a copy.
pub struct IoStreams<'a> {
    /// What gets uploaded.  Unused by downloads.
    pub input: Option<Box<dyn Read + Send + 'a>>,
    /// Where a download is written.  Uploads send the remote `tar`'s stdout here.
    pub out: Box<dyn Write + Send + 'a>,
    /// Notices about retries and skipped entries, and the remote stderr of uploads.
    pub err_out: Box<dyn Write + Send + 'a>,
}

impl Default for IoStreams<'_> {
    fn default() -> Self {
        IoStreams {
            input: None,
            out: Box::new(io::sink()),
            err_out: Box::new(io::stderr()),
        }
    }
}

/// The outcome of a successful download.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Archive bytes received, over all attempts.
    pub archive_bytes: u64,
    /// How many times the remote `tar` had to be restarted.
    pub retries: u32,
}

/// Everything needed for one copy to or from a pod.
///
/// A `CopyOptions` drives exactly one transfer at a time; concurrent copies each need their own.
pub struct CopyOptions<'a> {
    pub namespace: String,
    pub pod_name: String,
    /// The file inside the pod.
    pub file_name: String,
    pub container: Option<String>,
    /// Ask the remote `tar` not to restore ownership and permissions from the archive.
    pub no_preserve: bool,
    /// How often a failed download is resumed: 0 never, negative without limit.
    pub max_retries: i32,
    /// Length of `streams.input`, if known.  Otherwise the input is spooled to find out.
    pub input_size: Option<u64>,
    pub streams: IoStreams<'a>,
    executor: Arc<dyn RemoteExecutor>,
}

impl fmt::Debug for CopyOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // streams and executor don't impl Debug
        f.debug_struct("CopyOptions")
            .field("namespace", &self.namespace)
            .field("pod_name", &self.pod_name)
            .field("file_name", &self.file_name)
            .field("container", &self.container)
            .field("no_preserve", &self.no_preserve)
            .field("max_retries", &self.max_retries)
            .field("input_size", &self.input_size)
            .finish_non_exhaustive()
    }
}

impl<'a> CopyOptions<'a> {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        CopyOptions {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            file_name: file_name.into(),
            container: None,
            no_preserve: false,
            max_retries: 0,
            input_size: None,
            streams: IoStreams::default(),
            executor,
        }
    }

    fn remote_file(&self) -> RemoteFile {
        RemoteFile {
            namespace: self.namespace.clone(),
            pod: self.pod_name.clone(),
            path: RemotePath::new(&self.file_name),
        }
    }

    fn target(&self, file: &RemoteFile) -> PodTarget {
        PodTarget {
            namespace: file.namespace.clone(),
            pod: file.pod.clone(),
            container: self.container.clone(),
        }
    }

    /// Succeeds exactly when `file` exists in the pod and is a directory.
    ///
    /// Every other outcome, including a missing file or a failure to run `test` at all, is an
    /// error.
    pub fn check_destination_is_dir(&self, file: &RemoteFile) -> Result<()> {
        let request = ExecRequest::new(
            self.target(file),
            vec!["test".into(), "-d".into(), file.path.to_string()],
        );
        self.executor
            .execute(&request, None, &mut io::sink(), &mut io::sink())
    }

    /// The remote `tar` invocation that unpacks an upload of `dest`.
    pub fn upload_command(&self, dest: &RemotePath) -> Vec<String> {
        let mut command: Vec<String> = vec!["tar".into()];
        if self.no_preserve {
            command.extend(["--no-same-permissions".into(), "--no-same-owner".into()]);
        }
        command.extend(["-xmf".into(), "-".into()]);

        let dir = dest.dir();
        if !dir.is_empty() && dir.as_str() != "." {
            command.extend(["-C".into(), dir.to_string()]);
        }
        command
    }

    /// Downloads the pod's file into `streams.out`.
    ///
    /// Fails without transferring anything if the path is a directory, and with
    /// [`Error::NotFound`] if the archive held no regular file.
    pub fn copy_from_pod(&mut self) -> Result<DownloadStats> {
        let src = self.remote_file();
        if self.check_destination_is_dir(&src).is_ok() {
            return Err(Error::DirectoryDownload(self.file_name.clone()));
        }

        let prefix = strip_path_shortcuts(src.path.strip_slashes().clean().as_str());
        let source = TarSource {
            file: src,
            container: self.container.clone(),
            executor: Arc::clone(&self.executor),
        };
        let budget = RetryBudget::from(self.max_retries);
        info!(
            "downloading {}/{}:{} (retries: {budget})",
            self.namespace, self.pod_name, self.file_name
        );

        // the pipe's retry notices and the extractor's warnings share the error stream
        let err_out = RefCell::new(&mut self.streams.err_out);
        let mut pipe = TarPipe::new(source, budget, SharedWriter(&err_out))?;
        let extracted = untar_all(
            &prefix,
            &mut pipe,
            &mut self.streams.out,
            &mut SharedWriter(&err_out),
        )?;
        self.streams.out.flush()?;

        let stats = DownloadStats {
            archive_bytes: pipe.bytes_read(),
            retries: pipe.retries(),
        };
        debug!("download finished: {stats:?}");

        if extracted == 0 {
            return Err(Error::NotFound(self.file_name.clone()));
        }
        Ok(stats)
    }

    /// Uploads `streams.input` to the pod's file.
    ///
    /// Fails without transferring anything if the destination is a directory.  There is no
    /// resumption: any failure of the remote `tar` fails the upload.
    pub fn copy_to_pod(&mut self) -> Result<()> {
        let dest = self.remote_file();
        if self.check_destination_is_dir(&dest).is_ok() {
            return Err(Error::DirectoryUpload(self.file_name.clone()));
        }

        let input = self.streams.input.take().ok_or(Error::MissingInput)?;
        let request = ExecRequest::new(self.target(&dest), self.upload_command(&dest.path));
        let input_size = self.input_size;
        info!(
            "uploading to {}/{}:{} with `{}`",
            self.namespace,
            self.pod_name,
            self.file_name,
            request.command_line()
        );

        let executor = &self.executor;
        let out = &mut self.streams.out;
        let err_out = &mut self.streams.err_out;
        let (reader, mut writer) = pipe();

        thread::scope(|scope| -> Result<()> {
            let producer = thread::Builder::new()
                .name("podcopy-tar-writer".into())
                .spawn_scoped(scope, move || {
                    let result = make_tar(input, input_size, &dest.path, &mut writer);
                    if let Err(err) = &result {
                        writer.close_with_error(io::Error::other(err.to_string()));
                    }
                    result
                })?;

            // the executor drops the reader once the remote side stops reading, which unblocks
            // the producer
            let remote = executor.execute(&request, Some(Box::new(reader)), out, err_out);
            let produced = producer.join().map_err(|_| Error::WorkerPanicked)?;

            match (produced, remote) {
                // the remote end going away first is reported by the remote result
                (Err(Error::Io(err)), remote) if err.kind() == ErrorKind::BrokenPipe => remote,
                (Err(err), _) => Err(err),
                (Ok(()), remote) => remote,
            }
        })
    }
}

/// Lets the retry notices and the extractor's warnings go to one error stream.
struct SharedWriter<'r, W>(&'r RefCell<W>);

impl<W: Write> Write for SharedWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;
    use tar::{Builder, EntryType, Header};

    use super::*;
    use crate::test::{FakeExecutor, SharedBuffer};

    const BUDDY: &[u8] = b"This is Good thing.";

    fn options<'a>(executor: &Arc<FakeExecutor>, path: &str) -> CopyOptions<'a> {
        CopyOptions::new(executor.clone(), "default", "bastion-relay-2", path)
    }

    #[test]
    fn test_upload_command() {
        let executor = Arc::new(FakeExecutor::new());
        let mut opts = options(&executor, "/tmp/buddy.txt");
        assert_eq!(
            opts.upload_command(&RemotePath::new("/tmp/buddy.txt")),
            ["tar", "-xmf", "-", "-C", "/tmp"]
        );
        assert_eq!(
            opts.upload_command(&RemotePath::new("buddy.txt")),
            ["tar", "-xmf", "-"]
        );
        opts.no_preserve = true;
        assert_eq!(
            opts.upload_command(&RemotePath::new("/buddy.txt")),
            [
                "tar",
                "--no-same-permissions",
                "--no-same-owner",
                "-xmf",
                "-",
                "-C",
                "/"
            ]
        );
    }

    #[test]
    fn test_upload_scenario() {
        let executor = Arc::new(FakeExecutor::new());
        let mut opts = options(&executor, "/tmp/buddy.txt");
        opts.streams.input = Some(Box::new(BUDDY));
        opts.input_size = Some(BUDDY.len() as u64);
        opts.copy_to_pod().unwrap();

        assert_eq!(
            executor.commands(),
            ["test -d /tmp/buddy.txt", "tar -xmf - -C /tmp"]
        );
        assert_eq!(executor.file("/tmp/buddy.txt").unwrap(), BUDDY);

        let requests = executor.requests();
        assert_eq!(requests[1].target.namespace, "default");
        assert_eq!(requests[1].target.pod, "bastion-relay-2");
        assert_eq!(requests[1].target.container, None);
    }

    #[test]
    fn test_upload_unknown_size() {
        let executor = Arc::new(FakeExecutor::new());
        let data = vec![b'z'; 100_000];
        let mut opts = options(&executor, "/var/data/blob");
        opts.container = Some("sidecar".into());
        opts.streams.input = Some(Box::new(&data[..]));
        opts.copy_to_pod().unwrap();

        assert_eq!(executor.file("/var/data/blob").unwrap(), data);
        assert!(executor
            .requests()
            .iter()
            .all(|r| r.target.container.as_deref() == Some("sidecar")));
    }

    #[test]
    fn test_upload_rejects_directory() {
        let executor = Arc::new(FakeExecutor::new());
        executor.add_dir("/tmp");
        let mut opts = options(&executor, "/tmp");
        opts.streams.input = Some(Box::new(BUDDY));

        let err = opts.copy_to_pod().unwrap_err();
        assert_eq!(err.to_string(), "can not upload directory: /tmp");
        assert_eq!(executor.commands(), ["test -d /tmp"]);
    }

    #[test]
    fn test_upload_without_input() {
        let executor = Arc::new(FakeExecutor::new());
        let mut opts = options(&executor, "/tmp/buddy.txt");
        assert!(matches!(opts.copy_to_pod(), Err(Error::MissingInput)));
    }

    #[test]
    fn test_upload_size_mismatch_wins_over_remote_error() {
        let executor = Arc::new(FakeExecutor::new());
        let mut opts = options(&executor, "/tmp/buddy.txt");
        opts.streams.input = Some(Box::new(BUDDY));
        opts.input_size = Some(1000);

        assert!(matches!(
            opts.copy_to_pod(),
            Err(Error::SizeMismatch { expected: 1000 })
        ));
    }

    #[test]
    fn test_download() {
        let executor = Arc::new(FakeExecutor::new());
        executor.add_file("/tmp/buddy.txt", BUDDY);
        let out = SharedBuffer::new();
        let mut opts = options(&executor, "/tmp/buddy.txt");
        opts.streams.out = Box::new(out.clone());

        let stats = opts.copy_from_pod().unwrap();
        assert_eq!(out.contents(), BUDDY);
        assert_eq!(stats.retries, 0);
        assert_eq!(
            executor.commands(),
            ["test -d /tmp/buddy.txt", "tar cf - /tmp/buddy.txt"]
        );
    }

    #[test]
    fn test_download_rejects_directory_before_tar() {
        let executor = Arc::new(FakeExecutor::new());
        executor.add_dir("/var/log");
        let mut opts = options(&executor, "/var/log");

        let err = opts.copy_from_pod().unwrap_err();
        assert!(matches!(err, Error::DirectoryDownload(_)));
        assert_eq!(err.to_string(), "can not download directory: /var/log");
        assert_eq!(executor.commands(), ["test -d /var/log"]);
    }

    #[test]
    fn test_download_two_failures_then_success() {
        let executor = Arc::new(FakeExecutor::new());
        let contents: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        executor.add_file("/data/counter.bin", &contents);
        executor.fail_download_at(600);
        executor.fail_download_at(3000);

        let out = SharedBuffer::new();
        let notices = SharedBuffer::new();
        let mut opts = options(&executor, "/data/counter.bin");
        opts.max_retries = 2;
        opts.streams.out = Box::new(out.clone());
        opts.streams.err_out = Box::new(notices.clone());

        let stats = opts.copy_from_pod().unwrap();
        assert_eq!(out.contents(), contents);
        assert_eq!(stats.retries, 2);
        assert_eq!(
            notices.to_string_lossy(),
            "Resuming copy at 600 bytes, retry 1/2\nResuming copy at 3000 bytes, retry 2/2\n"
        );
    }

    #[test]
    fn test_download_no_retries() {
        let executor = Arc::new(FakeExecutor::new());
        executor.add_file("/tmp/buddy.txt", &[3; 4000]);
        executor.fail_download_at(1024);

        let notices = SharedBuffer::new();
        let mut opts = options(&executor, "/tmp/buddy.txt");
        opts.streams.err_out = Box::new(notices.clone());

        let err = opts.copy_from_pod().unwrap_err();
        assert!(matches!(&err, Error::Io(e) if e.to_string() == "connection reset by peer"));
        assert_eq!(
            executor.commands(),
            ["test -d /tmp/buddy.txt", "tar cf - /tmp/buddy.txt"]
        );
        assert_eq!(notices.to_string_lossy(), "Dropping out copy after 0 retries\n");
    }

    #[test]
    fn test_download_scenario_unlimited_retries() {
        let executor = Arc::new(FakeExecutor::new());
        executor.add_file("/tmp/buddy.txt", BUDDY);
        executor.fail_download_at(10);

        let out = SharedBuffer::new();
        let notices = SharedBuffer::new();
        let mut opts = options(&executor, "/tmp/buddy.txt");
        opts.max_retries = -1;
        opts.streams.out = Box::new(out.clone());
        opts.streams.err_out = Box::new(notices.clone());

        let stats = opts.copy_from_pod().unwrap();
        assert_eq!(out.contents(), BUDDY);
        assert_eq!(stats.retries, 1);
        assert_eq!(
            executor.commands(),
            [
                "test -d /tmp/buddy.txt",
                "sh -c tar cf - '/tmp/buddy.txt' | tail -c+1",
                "sh -c tar cf - '/tmp/buddy.txt' | tail -c+11",
            ]
        );
        assert_eq!(
            notices.to_string_lossy(),
            "Resuming copy at 10 bytes, retry 1/unlimited\n"
        );
    }

    #[test]
    fn test_download_corrupted_archive() {
        let executor = Arc::new(FakeExecutor::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(4);
        let mut builder = Builder::new(vec![]);
        builder
            .append_data(&mut header, "etc/shadow", &b"root"[..])
            .unwrap();
        executor.set_archive("/tmp/buddy.txt", builder.into_inner().unwrap());

        let out = SharedBuffer::new();
        let mut opts = options(&executor, "/tmp/buddy.txt");
        opts.max_retries = 5;
        opts.streams.out = Box::new(out.clone());

        let err = opts.copy_from_pod().unwrap_err();
        assert!(matches!(err, Error::CorruptedArchive { .. }), "{err}");
        assert!(out.contents().is_empty());
        // corruption is not a transport failure: no relaunch
        assert_eq!(executor.commands().len(), 2);
    }

    #[test]
    fn test_download_skips_links_and_reports_them() {
        let executor = Arc::new(FakeExecutor::new());
        let mut builder = Builder::new(vec![]);
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "tmp/buddy.txt", "/etc/passwd")
            .unwrap();
        executor.set_archive("/tmp/buddy.txt", builder.into_inner().unwrap());

        let notices = SharedBuffer::new();
        let mut opts = options(&executor, "/tmp/buddy.txt");
        opts.streams.err_out = Box::new(notices.clone());

        let err = opts.copy_from_pod().unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(notices.to_string_lossy().starts_with("warning: skipping symlink"));
    }

    #[test]
    fn test_download_missing_file() {
        let executor = Arc::new(FakeExecutor::new());
        let mut opts = options(&executor, "/tmp/missing");
        opts.streams.err_out = Box::new(io::sink());

        let err = opts.copy_from_pod().unwrap_err();
        assert!(err.to_string().contains("Cannot stat"), "{err}");
    }

    #[test]
    fn test_download_relative_and_dotted_paths() {
        let executor = Arc::new(FakeExecutor::new());
        let config = |name: &str| {
            let mut builder = Builder::new(vec![]);
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(9);
            builder
                .append_data(&mut header, name, &b"port: 80\n"[..])
                .unwrap();
            builder.into_inner().unwrap()
        };

        executor.set_archive("srv/config.yaml", config("srv/config.yaml"));
        let out = SharedBuffer::new();
        let mut opts = options(&executor, "srv/config.yaml");
        opts.streams.out = Box::new(out.clone());
        opts.copy_from_pod().unwrap();
        assert_eq!(out.contents(), b"port: 80\n");

        // GNU tar drops every leading component up to the last `..`, so the entry no longer
        // carries the directory the prefix check expects
        executor.set_archive("/srv/./app/../config.yaml", config("config.yaml"));
        let mut opts = options(&executor, "/srv/./app/../config.yaml");
        opts.streams.out = Box::new(io::sink());
        let err = opts.copy_from_pod().unwrap_err();
        assert!(
            matches!(err, Error::CorruptedArchive { ref name, ref prefix }
                if name == "config.yaml" && prefix == "srv/config.yaml"),
            "{err}"
        );
    }
}
