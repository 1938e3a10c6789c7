//! An in-memory CAN bus
//!
//! Every frame sent by a participant is delivered to all other participants. Senders and
//! receivers created as a pair share an endpoint ID, so a participant does not see its own frames.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use snafu::Snafu;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use servocan_common::{
    messages::CanMessage,
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};

const QSIZE: usize = 4096;

/// Endpoint ID of frames without a sender
const NO_ENDPOINT: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct SimBus {
    tx: broadcast::Sender<(usize, CanMessage)>,
    next_endpoint: Arc<AtomicUsize>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(QSIZE);
        Self {
            tx,
            next_endpoint: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a sender and receiver for one participant
    pub fn new_pair(&self) -> (SimBusSender, SimBusReceiver) {
        let endpoint = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        (
            SimBusSender {
                endpoint,
                tx: self.tx.clone(),
            },
            SimBusReceiver {
                endpoint,
                rx: self.tx.subscribe(),
            },
        )
    }

    /// A receiver which sees every frame, for logging
    pub fn new_receiver(&self) -> SimBusReceiver {
        SimBusReceiver {
            endpoint: NO_ENDPOINT,
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimBusSender {
    endpoint: usize,
    tx: broadcast::Sender<(usize, CanMessage)>,
}

impl AsyncCanSender for SimBusSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        // A bus without listeners still accepts frames
        let _ = self.tx.send((self.endpoint, msg));
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Simulated bus closed"))]
pub struct BusClosed;

#[derive(Debug)]
pub struct SimBusReceiver {
    endpoint: usize,
    rx: broadcast::Receiver<(usize, CanMessage)>,
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = BusClosed;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, BusClosed> {
        loop {
            match self.rx.try_recv() {
                Ok((endpoint, _)) if endpoint == self.endpoint => continue,
                Ok((_, msg)) => return Ok(Some(msg)),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => {
                    log::warn!("Simulated bus receiver dropped {n} frames");
                }
                Err(TryRecvError::Closed) => return Err(BusClosed),
            }
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, BusClosed> {
        loop {
            match self.rx.recv().await {
                Ok((endpoint, _)) if endpoint == self.endpoint => continue,
                Ok((_, msg)) => return Ok(msg),
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Simulated bus receiver dropped {n} frames");
                }
                Err(RecvError::Closed) => return Err(BusClosed),
            }
        }
    }
}
