//! Backpressure-aware chunked send loop.
//!
//! Invariant: a chunk is only handed to the channel while the buffered amount
//! is at or below the low-watermark, so the local buffer never exceeds
//! `low_watermark + chunk_size`.

use bytes::Bytes;
use kayo_core::{DataMessage, TransferError, TransferOptions, TransportError};
use tracing::{debug, info, warn};

use crate::progress::ProgressSink;
use crate::{send_control, DataChannel};

/// Outcome of one completed file transfer to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub peer: u64,
    pub name: String,
    pub bytes_sent: u64,
    pub chunks: u64,
}

/// Send `payload` as binary chunks, pausing whenever the channel's buffer is
/// above the low-watermark. Returns the number of chunks sent.
pub async fn send_chunked(
    channel: &dyn DataChannel,
    payload: &Bytes,
    peer: u64,
    options: &TransferOptions,
    progress: Option<&dyn ProgressSink>,
) -> Result<u64, TransferError> {
    let chunk_size = options.chunk_size(channel.max_message_size());
    let low_watermark = options.low_watermark(chunk_size);
    channel.set_low_watermark(low_watermark).await;

    let total = payload.len() as u64;
    let mut offset = 0usize;
    let mut chunks = 0u64;

    debug!(peer, total, chunk_size, low_watermark, "Chunked send starting");

    while offset < payload.len() {
        if !channel.is_open() {
            return Err(TransferError::ChannelClosed { sent: offset as u64, total });
        }

        let end = (offset + chunk_size).min(payload.len());
        channel
            .send_binary(payload.slice(offset..end))
            .await
            .map_err(|e| closed_at(e, offset as u64, total))?;
        offset = end;
        chunks += 1;

        if let Some(sink) = progress {
            sink.on_progress(peer, offset as u64, total);
        }

        if channel.buffered_amount().await > low_watermark {
            wait_for_drain(channel, options, offset as u64).await?;
        }
    }

    Ok(chunks)
}

fn closed_at(err: TransportError, sent: u64, total: u64) -> TransferError {
    match err {
        TransportError::ConnectionClosed => TransferError::ChannelClosed { sent, total },
        other => TransferError::Send(other),
    }
}

async fn wait_for_drain(
    channel: &dyn DataChannel,
    options: &TransferOptions,
    sent: u64,
) -> Result<(), TransferError> {
    if options.stall_timeout_ms == 0 {
        channel.low_watermark_reached().await;
        return Ok(());
    }
    tokio::time::timeout(options.stall_timeout(), channel.low_watermark_reached())
        .await
        .map_err(|_| {
            warn!(sent, ms = options.stall_timeout_ms, "Peer stopped draining, giving up");
            TransferError::Stalled { sent, ms: options.stall_timeout_ms }
        })
}

/// Full framed transfer: start-of-file marker, chunks, end-of-file marker.
pub async fn send_file(
    channel: &dyn DataChannel,
    name: &str,
    payload: &Bytes,
    peer: u64,
    options: &TransferOptions,
    progress: Option<&dyn ProgressSink>,
) -> Result<TransferReport, TransferError> {
    let total = payload.len() as u64;

    send_control(channel, &DataMessage::StartOfFile(name.to_owned()))
        .await
        .map_err(|e| closed_at(e, 0, total))?;

    let chunks = send_chunked(channel, payload, peer, options, progress).await?;

    send_control(channel, &DataMessage::EndOfFile)
        .await
        .map_err(|e| closed_at(e, total, total))?;

    if let Some(sink) = progress {
        sink.on_complete(peer, total);
    }
    info!(peer, file = name, bytes = total, chunks, "File sent");

    Ok(TransferReport { peer, name: name.to_owned(), bytes_sent: total, chunks })
}
