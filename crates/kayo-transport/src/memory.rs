//! In-process [`DataChannel`] pair.
//!
//! Each direction is a queue with a byte counter. The sender's buffered amount
//! only drops when the other end actually consumes a message, so a reader that
//! never calls [`MemoryChannel::recv`] behaves like a slow network peer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use kayo_core::TransportError;
use tokio::sync::Notify;

use crate::{ChannelMessage, DataChannel};

#[derive(Default)]
struct PipeState {
    queue: VecDeque<ChannelMessage>,
    buffered: usize,
    low_watermark: usize,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    /// A message was queued (single consumer, permit semantics).
    readable: Notify,
    /// `buffered` dropped to the low-watermark, or the link closed.
    drained: Notify,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        // A poisoned pipe only means a panicking test thread; the counters are
        // still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Link {
    closed: AtomicBool,
}

/// One end of an in-memory channel pair.
pub struct MemoryChannel {
    label: String,
    max_message_size: Option<usize>,
    outbound: Arc<Pipe>,
    inbound: Arc<Pipe>,
    link: Arc<Link>,
}

impl MemoryChannel {
    /// Two connected ends that advertise no maximum message size.
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        Self::pair_with_max(label, None)
    }

    pub fn pair_with_max(label: &str, max_message_size: Option<usize>) -> (Arc<Self>, Arc<Self>) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let link = Arc::new(Link { closed: AtomicBool::new(false) });

        let a = Arc::new(Self {
            label: label.to_owned(),
            max_message_size,
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
            link: link.clone(),
        });
        let b = Arc::new(Self {
            label: label.to_owned(),
            max_message_size,
            outbound: b_to_a,
            inbound: a_to_b,
            link,
        });
        (a, b)
    }

    /// Next message from the other end; `None` once closed and drained.
    pub async fn recv(&self) -> Option<ChannelMessage> {
        loop {
            {
                let mut state = self.inbound.lock();
                if let Some(msg) = state.queue.pop_front() {
                    state.buffered = state.buffered.saturating_sub(msg.len());
                    if state.buffered <= state.low_watermark {
                        self.inbound.drained.notify_waiters();
                    }
                    return Some(msg);
                }
            }
            if !self.is_open() {
                return None;
            }
            self.inbound.readable.notified().await;
        }
    }

    fn push(&self, msg: ChannelMessage) -> Result<(), TransportError> {
        if let Some(max) = self.max_message_size {
            if msg.len() > max {
                return Err(TransportError::SendFailed {
                    reason: format!("message of {} bytes exceeds maximum of {max}", msg.len()),
                });
            }
        }
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        {
            let mut state = self.outbound.lock();
            state.buffered += msg.len();
            state.queue.push_back(msg);
        }
        self.outbound.readable.notify_one();
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        !self.link.closed.load(Ordering::Acquire)
    }

    fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.push(ChannelMessage::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.push(ChannelMessage::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.outbound.lock().buffered
    }

    async fn set_low_watermark(&self, bytes: usize) {
        self.outbound.lock().low_watermark = bytes;
    }

    async fn low_watermark_reached(&self) {
        loop {
            let notified = self.outbound.drained.notified();
            {
                let state = self.outbound.lock();
                if state.buffered <= state.low_watermark || !self.is_open() {
                    return;
                }
            }
            notified.await;
        }
    }

    async fn close(&self) {
        if self.link.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for pipe in [&self.outbound, &self.inbound] {
            pipe.readable.notify_one();
            pipe.readable.notify_waiters();
            pipe.drained.notify_waiters();
        }
    }
}
