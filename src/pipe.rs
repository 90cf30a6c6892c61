//! An in-process byte pipe between a worker thread and its consumer.
//!
//! Unlike an OS pipe, the writing side can end the stream with an error, which the reader then
//! observes in place of end-of-stream.  Dropping the reader makes further writes fail with
//! `BrokenPipe`, which is how a consumer that gives up releases a blocked producer.

use std::{
    io::{self, ErrorKind, Read, Write},
    thread::{self, JoinHandle},
};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::trace;

use crate::error::Result;

// chunks in flight before the writer blocks
const PIPE_DEPTH: usize = 16;

enum Message {
    Data(Vec<u8>),
    Error(io::Error),
}

/// Creates a connected reader/writer pair.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (sender, receiver) = bounded(PIPE_DEPTH);
    (
        PipeReader {
            receiver,
            chunk: vec![],
            pos: 0,
            closed: None,
        },
        PipeWriter { sender },
    )
}

#[derive(Debug)]
enum Closed {
    Eof,
    Failed(ErrorKind, String),
}

pub struct PipeReader {
    receiver: Receiver<Message>,
    chunk: Vec<u8>,
    pos: usize,
    closed: Option<Closed>,
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // receiver doesn't impl Debug
        f.debug_struct("PipeReader")
            .field("buffered", &(self.chunk.len() - self.pos))
            .field("closed", &self.closed)
            .finish()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos == self.chunk.len() {
            match &self.closed {
                Some(Closed::Eof) => return Ok(0),
                Some(Closed::Failed(kind, msg)) => return Err(io::Error::new(*kind, msg.clone())),
                None => {}
            }

            match self.receiver.recv() {
                Ok(Message::Data(data)) => {
                    self.chunk = data;
                    self.pos = 0;
                }
                Ok(Message::Error(err)) => {
                    self.closed = Some(Closed::Failed(err.kind(), err.to_string()));
                    return Err(err);
                }
                // every writer is gone without an error: clean end of stream
                Err(..) => self.closed = Some(Closed::Eof),
            }
        }

        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

pub struct PipeWriter {
    sender: Sender<Message>,
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

impl PipeWriter {
    /// Ends the stream with `err` instead of end-of-stream.  Does nothing if the reader is gone.
    pub fn close_with_error(self, err: io::Error) {
        let _ = self.sender.send(Message::Error(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.sender
            .send(Message::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "pipe reader was closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `produce` on a new named thread, feeding the returned reader.
///
/// When `produce` fails the pipe is closed with its error, so the reader never waits on a
/// producer that has already given up.
pub fn spawn_producer<F>(name: &str, produce: F) -> Result<(PipeReader, JoinHandle<Result<()>>)>
where
    F: FnOnce(&mut PipeWriter) -> Result<()> + Send + 'static,
{
    let (reader, mut writer) = pipe();
    let thread_name = name.to_string();
    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let result = produce(&mut writer);
            if let Err(err) = &result {
                trace!("{thread_name}: closing pipe with error: {err}");
                writer.close_with_error(io::Error::other(err.to_string()));
            }
            result
        })?;
    Ok((reader, handle))
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::error::Error;

    #[test]
    fn test_pipe_roundtrip() {
        let (mut reader, mut writer) = pipe();
        let producer = thread::spawn(move || {
            for i in 0..100u8 {
                writer.write_all(&[i; 37]).unwrap();
            }
        });

        let mut data = vec![];
        reader.read_to_end(&mut data).unwrap();
        producer.join().unwrap();

        assert_eq!(data.len(), 3700);
        assert_eq!(data[36], 0);
        assert_eq!(data[37], 1);
        assert_eq!(data[3699], 99);
    }

    #[test]
    fn test_pipe_error_after_data() {
        let (mut reader, mut writer) = pipe();
        writer.write_all(b"hello").unwrap();
        writer.close_with_error(io::Error::new(ErrorKind::ConnectionReset, "stream reset"));

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), "stream reset");

        // the error sticks
        assert_eq!(
            reader.read(&mut buf).unwrap_err().kind(),
            ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_dropped_reader_breaks_writer() {
        let (reader, mut writer) = pipe();
        drop(reader);
        assert_eq!(
            writer.write(b"x").unwrap_err().kind(),
            ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn test_blocked_writer_released_by_reader_drop() {
        let (reader, mut writer) = pipe();
        // more chunks than the pipe holds, so the producer blocks until the reader goes away
        let producer =
            thread::spawn(move || (0..PIPE_DEPTH * 4).try_for_each(|_| writer.write_all(b"chunk")));
        drop(reader);
        assert_eq!(
            producer.join().unwrap().unwrap_err().kind(),
            ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn test_spawn_producer_forwards_error() {
        let (mut reader, handle) = spawn_producer("test-producer", |writer| {
            writer.write_all(b"partial")?;
            Err(Error::MissingInput)
        })
        .unwrap();

        let mut data = vec![];
        let err = reader.read_to_end(&mut data).unwrap_err();
        assert_eq!(data, b"partial");
        assert_eq!(err.to_string(), "no input stream to upload");
        assert!(matches!(handle.join().unwrap(), Err(Error::MissingInput)));
    }
}
