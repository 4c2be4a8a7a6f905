//! Bulk pixel transfer for `read` and `write`.
//!
//! Reads stream raw bytes straight into the caller's buffer. Writes go plane by
//! plane in bounded chunks; the worker acknowledges every chunk and then every
//! plane with an empty reply, which keeps both pipes from filling up.

use serde::Serialize;
use tokio_util::bytes::BytesMut;

use crate::bridge::protocol::{Command, WriteParams, parse_count_reply};
use crate::error::BridgeError;
use crate::image::{ImageInfo, IoRegion, LookupTable};
use crate::session::Exchange;

/// Counters for one `write`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub planes: u64,
    pub chunks: u64,
    pub chunk_acks: u64,
    pub plane_acks: u64,
    pub bytes: u64,
}

/// Bytes needed to hold `region` of an image laid out as `info`.
pub fn region_len(info: &ImageInfo, region: &IoRegion) -> Result<usize, BridgeError> {
    (info.pixel_size() as u64)
        .checked_mul(region.pixel_count())
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| BridgeError::InvalidRegion("region does not fit in memory".to_string()))
}

/// Check that a buffer of `available` bytes can hold `region`.
pub(crate) fn check_buffer(
    info: &ImageInfo,
    region: &IoRegion,
    available: usize,
) -> Result<usize, BridgeError> {
    let expected = region_len(info, region)?;
    if available < expected {
        return Err(BridgeError::BufferSize {
            expected,
            actual: available,
        });
    }
    Ok(expected)
}

pub(crate) async fn read_region(
    exchange: &mut Exchange<'_>,
    path: &str,
    region: &IoRegion,
    dest: &mut [u8],
) -> Result<(), BridgeError> {
    exchange.send(Command::read(path, region)).await?;

    let expected = dest.len();
    let mut filled = 0;
    while filled < expected {
        let chunk = exchange.next_payload("read").await?;
        let remaining = expected - filled;
        if chunk.len() > remaining {
            return Err(exchange.protocol(
                "read",
                format!(
                    "worker sent {} bytes past the {expected} expected",
                    chunk.len() - remaining
                ),
            ));
        }
        dest[filled..filled + chunk.len()].copy_from_slice(&chunk);
        filled += chunk.len();
        tracing::trace!(filled, expected, "Read progress");
    }

    tracing::debug!(path, bytes = expected, "Region read");
    Ok(())
}

/// Everything `write` needs besides the pixel buffer.
pub(crate) struct WriteRequest<'a> {
    pub path: &'a str,
    pub info: &'a ImageInfo,
    pub region: &'a IoRegion,
    pub lut: Option<&'a LookupTable>,
    pub chunk_size: usize,
}

pub(crate) async fn write_region(
    exchange: &mut Exchange<'_>,
    request: &WriteRequest<'_>,
    source: &[u8],
) -> Result<TransferStats, BridgeError> {
    let info = request.info;
    exchange
        .send(Command::write(&WriteParams {
            path: request.path,
            byte_order: info.byte_order,
            region: request.region,
            spacing: info.spacing,
            component_type: info.component_type,
            components: info.components,
            lut: request.lut,
        }))
        .await?;

    let reply = exchange.await_reply("write").await?;
    let bytes_per_plane = parse_count_reply(&reply, exchange.line_ending())
        .map_err(|message| exchange.protocol("write", message))?;

    let planes = usize::try_from(request.region.plane_count()).unwrap_or(usize::MAX);
    let total = planes.checked_mul(bytes_per_plane).ok_or_else(|| {
        exchange.protocol("write", format!("{planes} planes of {bytes_per_plane} bytes"))
    })?;
    if source.len() < total {
        return Err(BridgeError::BufferSize {
            expected: total,
            actual: source.len(),
        });
    }
    if source.len() > total {
        tracing::debug!(
            ignored = source.len() - total,
            "Source buffer longer than the worker expects"
        );
    }
    tracing::debug!(path = request.path, planes, bytes_per_plane, "Writing planes");

    let chunk_size = request.chunk_size.max(1);
    let mut acks = Acks::default();
    let mut stats = TransferStats::default();
    for plane in 0..planes {
        let start = plane * bytes_per_plane;
        for chunk in source[start..start + bytes_per_plane].chunks(chunk_size) {
            exchange.send_payload("write", chunk).await?;
            stats.chunks += 1;
            stats.bytes += chunk.len() as u64;

            acks.next(exchange).await?;
            stats.chunk_acks += 1;
        }

        acks.next(exchange).await?;
        stats.plane_acks += 1;
        stats.planes += 1;
        tracing::trace!(plane, "Plane acknowledged");
    }

    if !acks.pending.is_empty() {
        tracing::warn!(
            extra = acks.pending.len(),
            "Worker sent bytes after the last acknowledgement"
        );
    }
    tracing::debug!(?stats, "Write complete");
    Ok(stats)
}

/// Acknowledgements from the worker. Each one is an empty reply; several may
/// arrive in one read or be split across reads, so bytes past the first
/// terminator are carried over to the next ack.
#[derive(Debug, Default)]
struct Acks {
    pending: BytesMut,
}

impl Acks {
    async fn next(&mut self, exchange: &mut Exchange<'_>) -> Result<(), BridgeError> {
        let terminator = exchange.line_ending().terminator();
        loop {
            if let Some(at) = self
                .pending
                .windows(terminator.len())
                .position(|window| window == terminator)
            {
                let _ = self.pending.split_to(at + terminator.len());
                return Ok(());
            }
            let bytes = exchange.next_payload("write").await?;
            self.pending.extend_from_slice(&bytes);
        }
    }
}
