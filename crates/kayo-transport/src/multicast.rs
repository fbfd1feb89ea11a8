//! One file to many peers.
//!
//! Every peer gets its own task and its own send loop. A slow or failed peer
//! only holds back itself.

use std::sync::Arc;

use bytes::Bytes;
use kayo_core::{TransferError, TransferOptions};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chunked::{send_file, TransferReport};
use crate::progress::ProgressSink;
use crate::DataChannel;

/// A peer to send to, by id.
#[derive(Clone)]
pub struct PeerTarget {
    pub peer: u64,
    pub channel: Arc<dyn DataChannel>,
}

impl PeerTarget {
    pub fn new(peer: u64, channel: Arc<dyn DataChannel>) -> Self {
        Self { peer, channel }
    }
}

/// Handle over the per-peer transfer tasks.
pub struct MulticastTransfer {
    name: String,
    tasks: Vec<(u64, JoinHandle<Result<TransferReport, TransferError>>)>,
}

impl MulticastTransfer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peers(&self) -> Vec<u64> {
        self.tasks.iter().map(|(peer, _)| *peer).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|(_, task)| task.is_finished())
    }

    /// Cancel every unfinished per-peer task.
    pub fn abort(&self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }

    /// Wait for every peer. Results come back in the order peers were given.
    pub async fn join(self) -> Vec<(u64, Result<TransferReport, TransferError>)> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for (peer, task) in self.tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(peer, error = %e, "Transfer task panicked");
                    }
                    Err(TransferError::Aborted)
                }
            };
            results.push((peer, result));
        }
        results
    }
}

/// Start sending `payload` to every target concurrently.
///
/// Must be called from within a Tokio runtime.
pub fn multicast_transfer(
    name: &str,
    payload: Bytes,
    targets: Vec<PeerTarget>,
    options: TransferOptions,
    progress: Option<Arc<dyn ProgressSink>>,
) -> MulticastTransfer {
    info!(file = name, bytes = payload.len(), peers = targets.len(), "Multicast transfer starting");

    let tasks = targets
        .into_iter()
        .map(|target| {
            let name = name.to_owned();
            let payload = payload.clone();
            let options = options.clone();
            let progress = progress.clone();
            let task = tokio::spawn(async move {
                let result = send_file(
                    target.channel.as_ref(),
                    &name,
                    &payload,
                    target.peer,
                    &options,
                    progress.as_deref(),
                )
                .await;
                if let Err(e) = &result {
                    warn!(peer = target.peer, file = %name, error = %e, "Transfer to peer failed");
                }
                result
            });
            (target.peer, task)
        })
        .collect();

    MulticastTransfer { name: name.to_owned(), tasks }
}
