//! Utility for sharing a single socket among tasks
//!
//! One background task reads every frame from the bus and forwards it to the channels whose
//! [`FrameFilter`] matches the frame's identifier. The SDO client, PDO monitor, LSS master and
//! heartbeat monitor each get their own channel, so frame dispatch never depends on which
//! consumer happens to poll first.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use snafu::Snafu;
use tokio::sync::mpsc::error::TrySendError;
use tokio::{
    sync::mpsc::{channel, Receiver, Sender},
    task::JoinHandle,
};
use servocan_common::{
    messages::{HEARTBEAT_ID, LSS_RESP_ID, SDO_RESP_BASE},
    traits::AsyncCanReceiver,
    CanId, CanMessage,
};

const CHANNEL_CAPACITY: usize = 100;
const MIN_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Selects the frames delivered to a receive channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFilter {
    /// Every frame
    All,
    /// Frames with exactly this identifier
    Id(CanId),
    /// Standard frames with an identifier in `first..=last`
    Range {
        /// First identifier
        first: u16,
        /// Last identifier, inclusive
        last: u16,
    },
    /// Standard frames in the four predefined TPDO ranges, and all extended frames
    ///
    /// A CANopen device only sends 29-bit identifiers from PDOs configured for them.
    Tpdo,
}

impl FrameFilter {
    /// Frames from the SDO server of `node_id`
    pub fn sdo_response(node_id: u8) -> Self {
        FrameFilter::Id(CanId::std(SDO_RESP_BASE + node_id as u16))
    }

    /// Frames from LSS slaves
    pub fn lss_response() -> Self {
        FrameFilter::Id(LSS_RESP_ID)
    }

    /// Heartbeat and boot-up frames of all nodes
    pub fn heartbeat() -> Self {
        FrameFilter::Range {
            first: HEARTBEAT_ID + 1,
            last: HEARTBEAT_ID + 0x7F,
        }
    }

    /// Returns true if a frame with this identifier passes the filter
    pub fn matches(&self, id: CanId) -> bool {
        match (self, id) {
            (FrameFilter::All, _) => true,
            (FrameFilter::Id(expected), id) => *expected == id,
            (FrameFilter::Range { first, last }, CanId::Std(id)) => (*first..=*last).contains(&id),
            (FrameFilter::Tpdo, CanId::Std(id)) => {
                id & 0x7F != 0 && matches!(id & 0x780, 0x180 | 0x280 | 0x380 | 0x480)
            }
            (FrameFilter::Tpdo, CanId::Extended(_)) => true,
            _ => false,
        }
    }
}

/// Error returned when the receive task has shut down
#[derive(Clone, Copy, Debug, Snafu)]
#[snafu(display("Shared receiver closed"))]
pub struct NoMsgError;

#[derive(Debug)]
struct SharedReceiverInner {
    senders: Vec<(FrameFilter, Sender<CanMessage>)>,
}

impl SharedReceiverInner {
    pub fn create_rx(&mut self, filter: FrameFilter) -> Receiver<CanMessage> {
        let (tx, rx) = channel(CHANNEL_CAPACITY);
        self.senders.push((filter, tx));
        rx
    }
}

fn lock(inner: &Mutex<SharedReceiverInner>) -> MutexGuard<'_, SharedReceiverInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fans frames from one [`AsyncCanReceiver`] out to filtered channels
#[derive(Debug)]
pub struct SharedReceiver {
    task_handle: JoinHandle<()>,
    inner: Arc<Mutex<SharedReceiverInner>>,
}

impl SharedReceiver {
    /// Spawn the receive task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R: AsyncCanReceiver + 'static>(mut receiver: R) -> Self {
        let inner = Arc::new(Mutex::new(SharedReceiverInner {
            senders: Vec::new(),
        }));
        let inner_clone = inner.clone();
        let task_handle = tokio::spawn(async move {
            let mut backoff = MIN_ERROR_BACKOFF;
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        backoff = MIN_ERROR_BACKOFF;
                        let mut inner = lock(&inner_clone);
                        inner.senders.retain(|(filter, sender)| {
                            if !filter.matches(msg.id()) {
                                return !sender.is_closed();
                            }
                            if let Err(e) = sender.try_send(msg) {
                                return match e {
                                    TrySendError::Full(_) => {
                                        log::warn!("Dropped received message due to overflow");
                                        true
                                    }
                                    TrySendError::Closed(_) => false,
                                };
                            }
                            true
                        });
                    }
                    Err(e) => {
                        // Back off while reads keep failing
                        log::error!("Error reading CAN bus: {e}, retrying in {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
                    }
                }
            }
        });
        Self { task_handle, inner }
    }

    /// Create a new channel receiving the frames which pass `filter`
    pub fn create_rx(&self, filter: FrameFilter) -> SharedReceiverChannel {
        let rx = lock(&self.inner).create_rx(filter);

        SharedReceiverChannel {
            inner: self.inner.clone(),
            filter,
            receiver: rx,
        }
    }

    /// Get the number of current receiver channels
    #[allow(dead_code)]
    pub fn num_channels(&self) -> usize {
        lock(&self.inner).senders.len()
    }
}

impl Drop for SharedReceiver {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

/// One filtered channel of a [`SharedReceiver`]
#[derive(Debug)]
pub struct SharedReceiverChannel {
    /// Data shared with the multi consumer Rx
    inner: Arc<Mutex<SharedReceiverInner>>,
    filter: FrameFilter,
    /// Our receive channel
    receiver: Receiver<CanMessage>,
}

impl Clone for SharedReceiverChannel {
    fn clone(&self) -> Self {
        let receiver = lock(&self.inner).create_rx(self.filter);
        Self {
            inner: self.inner.clone(),
            filter: self.filter,
            receiver,
        }
    }
}

impl SharedReceiverChannel {
    /// Create another channel on the same receiver with a different filter
    pub fn with_filter(&self, filter: FrameFilter) -> Self {
        let receiver = lock(&self.inner).create_rx(filter);
        Self {
            inner: self.inner.clone(),
            filter,
            receiver,
        }
    }

    /// The filter of this channel
    pub fn filter(&self) -> FrameFilter {
        self.filter
    }
}

impl AsyncCanReceiver for SharedReceiverChannel {
    type Error = NoMsgError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, NoMsgError> {
        match self.receiver.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => Err(NoMsgError),
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, NoMsgError> {
        self.receiver.recv().await.ok_or(NoMsgError)
    }
}
