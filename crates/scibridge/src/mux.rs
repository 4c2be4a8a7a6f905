//! Duplex stream multiplexing over the worker's stdout and stderr.
//!
//! The worker writes responses and pixel data on stdout (the payload stream)
//! and free-form diagnostics on stderr. Both must be drained concurrently or a
//! chatty worker blocks on a full stderr pipe while the host waits on stdout.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::bytes::{Bytes, BytesMut};

use crate::bridge::protocol::Command;
use crate::supervisor::WorkerState;

/// Which worker output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// stdout: responses and binary plane data.
    Payload,
    /// stderr: informational only.
    Diagnostic,
}

/// Result of one blocking wait on the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    Data(Source, Bytes),
    /// Both streams reached EOF and the process has exited.
    Closed,
    /// The payload stream reached EOF but the process did not exit.
    PayloadClosed,
    /// The configured wait elapsed without any output.
    TimedOut,
}

/// The channel the session speaks over.
///
/// Implemented by the live worker process; tests substitute a scripted link.
#[async_trait]
pub trait WorkerLink: Send {
    /// Write one command line in full.
    async fn send_command(&mut self, command: Command) -> io::Result<()>;

    /// Write raw bytes in full.
    async fn send_payload(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Wait for the next chunk of output from either stream.
    async fn wait_for_data(&mut self, timeout: Option<Duration>) -> MuxEvent;

    /// Current run state, queried on demand.
    fn state(&mut self) -> WorkerState;
}

/// Reads whichever of two streams produces bytes first.
///
/// Per-stream order is preserved. Between streams the order is whatever the
/// pipes deliver.
#[derive(Debug)]
pub struct StreamMux<P, D> {
    payload: Option<P>,
    diagnostic: Option<D>,
    buffer_size: usize,
}

impl<P, D> StreamMux<P, D>
where
    P: AsyncRead + Unpin,
    D: AsyncRead + Unpin,
{
    pub fn new(payload: P, diagnostic: D, buffer_size: usize) -> Self {
        Self {
            payload: Some(payload),
            diagnostic: Some(diagnostic),
            buffer_size: buffer_size.max(1),
        }
    }

    /// True once both streams have reached EOF.
    pub fn is_drained(&self) -> bool {
        self.payload.is_none() && self.diagnostic.is_none()
    }

    pub fn payload_open(&self) -> bool {
        self.payload.is_some()
    }

    /// Next chunk from whichever stream is ready, or `None` once both are at EOF.
    ///
    /// A read error closes the affected stream.
    pub async fn next_chunk(&mut self) -> Option<(Source, Bytes)> {
        loop {
            match self.read_once().await? {
                (source, Some(bytes)) => return Some((source, bytes)),
                (_, None) => {}
            }
        }
    }

    /// Like [`StreamMux::next_chunk`], but returns `None` as soon as the
    /// payload stream reaches EOF.
    pub async fn next_chunk_until_payload_eof(&mut self) -> Option<(Source, Bytes)> {
        loop {
            match self.read_once().await? {
                (source, Some(bytes)) => return Some((source, bytes)),
                (Source::Payload, None) => return None,
                (Source::Diagnostic, None) => {}
            }
        }
    }

    /// One read from whichever open stream is ready. A stream at EOF or in
    /// error is closed and reported with `None` bytes.
    async fn read_once(&mut self) -> Option<(Source, Option<Bytes>)> {
        let size = self.buffer_size;
        let (source, result) = match (&mut self.payload, &mut self.diagnostic) {
            (Some(out), Some(err)) => tokio::select! {
                r = read_chunk(out, size) => (Source::Payload, r),
                r = read_chunk(err, size) => (Source::Diagnostic, r),
            },
            (Some(out), None) => (Source::Payload, read_chunk(out, size).await),
            (None, Some(err)) => (Source::Diagnostic, read_chunk(err, size).await),
            (None, None) => return None,
        };

        match result {
            Ok(Some(bytes)) => {
                tracing::trace!(?source, bytes = bytes.len(), "Worker output");
                Some((source, Some(bytes)))
            }
            Ok(None) => {
                tracing::trace!(?source, "Worker stream reached EOF");
                self.close(source);
                Some((source, None))
            }
            Err(e) => {
                tracing::warn!(?source, error = %e, "Worker stream read failed; closing it");
                self.close(source);
                Some((source, None))
            }
        }
    }

    fn close(&mut self, source: Source) {
        match source {
            Source::Payload => self.payload = None,
            Source::Diagnostic => self.diagnostic = None,
        }
    }
}

async fn read_chunk<R>(reader: &mut R, size: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(size);
    let n = reader.read_buf(&mut buf).await?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(buf.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect<P, D>(mux: &mut StreamMux<P, D>) -> (Vec<u8>, Vec<u8>)
    where
        P: AsyncRead + Unpin,
        D: AsyncRead + Unpin,
    {
        let mut payload = Vec::new();
        let mut diagnostic = Vec::new();
        while let Some((source, bytes)) = mux.next_chunk().await {
            match source {
                Source::Payload => payload.extend_from_slice(&bytes),
                Source::Diagnostic => diagnostic.extend_from_slice(&bytes),
            }
        }
        (payload, diagnostic)
    }

    #[tokio::test]
    async fn separates_streams() {
        let mut mux = StreamMux::new(&b"true\n\n"[..], &b"loading reader\n"[..], 4);

        let (payload, diagnostic) = collect(&mut mux).await;

        assert_eq!(payload, b"true\n\n");
        assert_eq!(diagnostic, b"loading reader\n");
        assert!(mux.is_drained());
        assert!(!mux.payload_open());
    }

    #[tokio::test]
    async fn preserves_order_within_a_stream() {
        let (mut out_tx, out_rx) = tokio::io::duplex(8);
        let (err_tx, err_rx) = tokio::io::duplex(8);
        drop(err_tx);

        let writer = tokio::spawn(async move {
            for chunk in [&b"abc"[..], b"def", b"ghi"] {
                out_tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut mux = StreamMux::new(out_rx, err_rx, 2);
        let (payload, diagnostic) = collect(&mut mux).await;
        writer.await.unwrap();

        assert_eq!(payload, b"abcdefghi");
        assert!(diagnostic.is_empty());
    }

    #[tokio::test]
    async fn keeps_reading_payload_after_diagnostic_eof() {
        let (mut out_tx, out_rx) = tokio::io::duplex(64);
        let mut mux = StreamMux::new(out_rx, &b""[..], 64);

        out_tx.write_all(b"4096\n\n").await.unwrap();
        let (source, bytes) = mux.next_chunk().await.unwrap();
        assert_eq!(source, Source::Payload);
        assert_eq!(&bytes[..], b"4096\n\n");
        assert!(!mux.is_drained());

        drop(out_tx);
        assert_eq!(mux.next_chunk().await, None);
        assert!(mux.is_drained());
    }

    #[tokio::test]
    async fn stops_at_payload_eof_while_diagnostics_stay_open() {
        let (out_tx, out_rx) = tokio::io::duplex(64);
        let (mut err_tx, err_rx) = tokio::io::duplex(64);
        let mut mux = StreamMux::new(out_rx, err_rx, 64);

        err_tx.write_all(b"closing stdout\n").await.unwrap();
        let (source, bytes) = mux.next_chunk_until_payload_eof().await.unwrap();
        assert_eq!(source, Source::Diagnostic);
        assert_eq!(&bytes[..], b"closing stdout\n");

        drop(out_tx);
        assert_eq!(mux.next_chunk_until_payload_eof().await, None);
        assert!(!mux.payload_open());
        assert!(!mux.is_drained());
        drop(err_tx);
    }
}
