//! Utility for sharing a single socket among tasks
use std::sync::Arc;
use tokio::sync::Mutex;

use servocan_common::{
    traits::{AsyncCanSender, CanSendError},
    CanMessage,
};

/// A cloneable handle to one transmit half of the bus
#[derive(Debug)]
pub struct SharedSender<S: AsyncCanSender> {
    inner: Arc<Mutex<S>>,
}

impl<S: AsyncCanSender> Clone for SharedSender<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: AsyncCanSender> SharedSender<S> {
    /// Wrap a sender for sharing
    pub fn new(sender: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sender)),
        }
    }

    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let mut inner = self.inner.lock().await;
        inner.send(msg).await
    }
}

impl<S: AsyncCanSender> AsyncCanSender for SharedSender<S> {
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), CanSendError>> + Send {
        self.send(msg)
    }
}
