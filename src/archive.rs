//! The single-file tar framing used on the wire.
//!
//! Uploads are sent as a one-entry archive for the remote `tar -x` to unpack.  Downloads come out
//! of the remote `tar cf -` and are checked entry by entry before anything reaches the sink.

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use tar::{Archive, Builder, EntryType, Header};

use crate::{
    error::{Error, Result},
    path::RemotePath,
};

/// Mode of the files we upload.
pub const UPLOAD_MODE: u32 = 0o644;

/// Writes a tar stream to `writer` holding exactly one regular file, named after the base name
/// of `dest`, with the contents of `src`.
///
/// The header carries the real length of the contents.  If `size` is given, `src` must produce
/// exactly that many bytes, otherwise this fails with [`Error::SizeMismatch`] (after having
/// written an archive the remote end will reject).  Without `size`, `src` is first spooled to an
/// anonymous temporary file to find its length.
pub fn make_tar(
    mut src: impl Read,
    size: Option<u64>,
    dest: &RemotePath,
    writer: impl Write,
) -> Result<()> {
    let Some(size) = size else {
        let mut spool = tempfile::tempfile()?;
        let size = io::copy(&mut src, &mut spool)?;
        spool.seek(SeekFrom::Start(0))?;
        debug!("spooled {size} bytes for {dest}");
        return make_tar(spool, Some(size), dest, writer);
    };

    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(UPLOAD_MODE);
    header.set_mtime(mtime);
    header.set_size(size);

    let mut builder = Builder::new(writer);
    let mut body = src.take(size);
    builder.append_data(&mut header, dest.base().as_str(), &mut body)?;

    if body.limit() != 0 {
        return Err(Error::SizeMismatch { expected: size });
    }
    let mut src = body.into_inner();
    if src.read(&mut [0u8])? != 0 {
        return Err(Error::SizeMismatch { expected: size });
    }

    // writes the end-of-archive blocks
    builder.into_inner()?.flush()?;
    Ok(())
}

fn escapes_root(name: &str) -> bool {
    name.starts_with('/') || name.split('/').any(|segment| segment == "..")
}

/// Reads a tar stream and copies the contents of its regular files to `out`.
///
/// Every entry must be named below `prefix`, and must not be absolute or contain `..`: anything
/// else means the stream is not the archive we asked for, and we fail with
/// [`Error::CorruptedArchive`] before writing any of its contents.  Directories are skipped
/// silently.  Symlinks and every other kind of entry are skipped with a warning on `notices`.
///
/// Returns the number of regular files copied, which may be zero.
pub fn untar_all(
    prefix: &str,
    reader: impl Read,
    out: &mut impl Write,
    notices: &mut impl Write,
) -> Result<usize> {
    let mut archive = Archive::new(reader);
    let mut extracted = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if !name.starts_with(prefix) || escapes_root(&name) {
            return Err(Error::CorruptedArchive {
                name,
                prefix: prefix.to_string(),
            });
        }

        match entry.header().entry_type() {
            EntryType::Directory => continue,
            EntryType::Regular | EntryType::Continuous => {
                let copied = io::copy(&mut entry, out)?;
                debug!("extracted {name} ({copied} bytes)");
                extracted += 1;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name_bytes()
                    .map(|target| String::from_utf8_lossy(&target).into_owned())
                    .unwrap_or_default();
                warn!("skipping symlink {name} -> {target}");
                let _ = writeln!(notices, "warning: skipping symlink: {name:?} -> {target:?}");
            }
            other => {
                warn!("skipping {other:?} entry {name}");
                let _ = writeln!(notices, "warning: skipping non-regular file: {name:?}");
            }
        }
    }

    Ok(extracted)
}
