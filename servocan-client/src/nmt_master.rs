//! NMT commands sent by the master
use servocan_common::{
    messages::{NmtCommand, NmtCommandCmd},
    traits::AsyncCanSender,
};

use crate::error::{Error, TransportSnafu};

/// Sends NMT commands to one node, or to all nodes with node ID 0
#[derive(Debug, Clone)]
pub struct NmtMaster<S> {
    sender: S,
}

impl<S: AsyncCanSender> NmtMaster<S> {
    /// Create an NMT master sending on `sender`
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    async fn send(&mut self, cmd: NmtCommandCmd, node: u8) -> Result<(), Error> {
        log::debug!("NMT {cmd:?} to node {node}");
        self.sender
            .send(NmtCommand { cmd, node }.into())
            .await
            .map_err(|_| TransportSnafu.build())
    }

    /// Put the node into operational state
    pub async fn start(&mut self, node: u8) -> Result<(), Error> {
        self.send(NmtCommandCmd::Start, node).await
    }

    /// Put the node into stopped state
    pub async fn stop(&mut self, node: u8) -> Result<(), Error> {
        self.send(NmtCommandCmd::Stop, node).await
    }

    /// Put the node into pre-operational state
    pub async fn pre_operational(&mut self, node: u8) -> Result<(), Error> {
        self.send(NmtCommandCmd::EnterPreOp, node).await
    }

    /// Reset the node's application
    pub async fn reset_app(&mut self, node: u8) -> Result<(), Error> {
        self.send(NmtCommandCmd::ResetApp, node).await
    }

    /// Reset the node's communication, making it load a newly stored node ID
    pub async fn reset_comms(&mut self, node: u8) -> Result<(), Error> {
        self.send(NmtCommandCmd::ResetComm, node).await
    }
}
