//! Node ID assignment for daisy chained drives
//!
//! Drives leave the factory with the same node ID. Before they can share a bus, every drive is
//! unconfigured, then LSS fast scan isolates them one at a time and gives each its own ID.
use std::collections::BTreeSet;

use snafu::ResultExt;
use tokio::time::{sleep, timeout_at, Instant};
use servocan_common::{
    lss::{LssIdentity, LssState},
    messages::{DriveMessage, NmtState},
    traits::{AsyncCanReceiver, AsyncCanSender},
    NodeId,
};

use crate::{
    bus::{FrameFilter, SharedReceiver, SharedSender},
    error::*,
    lss_master::LssMaster,
    nmt_master::NmtMaster,
    sdo_client::SdoClient,
    settings::ClientSettings,
};

/// A drive which received a node ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedNode {
    /// The assigned node ID
    pub node_id: u8,
    /// Identity found by the fast scan
    pub identity: LssIdentity,
}

/// Runs LSS node ID assignment over a shared bus
#[derive(Debug)]
pub struct NodeIdAssigner<'a, S: AsyncCanSender> {
    sender: SharedSender<S>,
    receiver: &'a SharedReceiver,
    lss: LssMaster<SharedSender<S>, crate::bus::SharedReceiverChannel>,
    nmt: NmtMaster<SharedSender<S>>,
    settings: ClientSettings,
}

fn check_node_id(value: u16) -> Result<u8, Error> {
    if (1..=127).contains(&value) {
        Ok(value as u8)
    } else {
        InvalidNodeIdSnafu { value }.fail()
    }
}

impl<'a, S: AsyncCanSender> NodeIdAssigner<'a, S> {
    /// Create an assigner
    pub fn new(sender: SharedSender<S>, receiver: &'a SharedReceiver, settings: ClientSettings) -> Self {
        let mut lss = LssMaster::new(sender.clone(), receiver.create_rx(FrameFilter::lss_response()));
        lss.set_response_timeout(settings.lss_response_timeout());
        let nmt = NmtMaster::new(sender.clone());
        Self {
            sender,
            receiver,
            lss,
            nmt,
            settings,
        }
    }

    /// Give every drive on the bus a unique node ID, starting at `base_id`
    ///
    /// All drives are unconfigured first, so IDs are assigned in fast scan order. Each drive is
    /// verified after the final reset by reading its serial number over SDO at the new ID.
    pub async fn assign_node_ids(&mut self, base_id: u8) -> Result<Vec<AssignedNode>, Error> {
        check_node_id(base_id as u16)?;
        self.unconfigure_all().await?;

        let mut assigned = Vec::new();
        loop {
            self.lss
                .set_global_mode(LssState::Waiting)
                .await
                .context(LssSnafu)?;
            let Some(identity) = self
                .lss
                .fast_scan(self.settings.lss_scan_timeout())
                .await
                .context(LssSnafu)?
            else {
                break;
            };
            let node_id = check_node_id(base_id as u16 + assigned.len() as u16)?;
            log::info!(
                "Found device vendor 0x{:08X} product 0x{:08X} serial 0x{:08X}, assigning {node_id}",
                identity.vendor_id,
                identity.product_code,
                identity.serial
            );
            self.configure_selected(node_id).await?;
            assigned.push(AssignedNode { node_id, identity });
        }
        self.lss
            .set_global_mode(LssState::Waiting)
            .await
            .context(LssSnafu)?;
        log::info!("Assigned {} node IDs", assigned.len());
        if assigned.is_empty() {
            return Ok(assigned);
        }

        let ids: Vec<u8> = assigned.iter().map(|n| n.node_id).collect();
        self.reset_and_wait_for_bootup(&ids).await?;
        for node in &assigned {
            self.verify_serial(node.node_id, node.identity.serial).await?;
        }
        Ok(assigned)
    }

    /// The node IDs reported by all drives over LSS
    pub async fn configured_node_ids(&mut self) -> Result<Vec<u8>, Error> {
        self.lss
            .set_global_mode(LssState::Configuring)
            .await
            .context(LssSnafu)?;
        let result = self
            .lss
            .inquire_all_node_ids(self.settings.lss_response_timeout())
            .await
            .context(LssSnafu);
        self.lss
            .set_global_mode(LssState::Waiting)
            .await
            .context(LssSnafu)?;
        let ids: BTreeSet<u8> = result?
            .into_iter()
            .filter(|id| *id != NodeId::UNCONFIGURED_RAW)
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Move the drive at `current` to node ID `new`
    ///
    /// The drive is selected over LSS with the identity read from it over SDO, and nothing is
    /// changed unless it reports `current` as its node ID.
    pub async fn change_node_id(&mut self, current: u8, new: u8) -> Result<LssIdentity, Error> {
        let current = check_node_id(current as u16)?;
        let new = check_node_id(new as u16)?;
        let identity = self.read_identity(current).await?;
        log::info!(
            "Node {current}: identity vendor 0x{:08X} product 0x{:08X} revision 0x{:08X} serial 0x{:08X}",
            identity.vendor_id,
            identity.product_code,
            identity.revision,
            identity.serial
        );

        self.lss
            .enter_config_by_identity(identity)
            .await
            .context(LssSnafu)?;
        let result = self.change_selected(current, new).await;
        self.lss
            .set_global_mode(LssState::Waiting)
            .await
            .context(LssSnafu)?;
        result?;

        self.reset_and_wait_for_bootup(&[new]).await?;
        self.verify_serial(new, identity.serial).await?;
        Ok(identity)
    }

    async fn change_selected(&mut self, current: u8, new: u8) -> Result<(), Error> {
        let reported = self.lss.inquire_node_id().await.context(LssSnafu)?;
        if reported.raw() != current {
            log::error!("Expected node ID {current}, device reports {}", reported.raw());
            return NodeIdMismatchSnafu {
                expected: current,
                reported: reported.raw(),
            }
            .fail();
        }
        log::info!("Configuring node ID {current} -> {new}");
        self.configure_selected(new).await
    }

    /// Set, check and store the node ID of the drive in configuration state
    async fn configure_selected(&mut self, node_id: u8) -> Result<(), Error> {
        let id = NodeId::new(node_id).map_err(|_| Error::InvalidNodeId {
            value: node_id as u16,
        })?;
        self.lss.set_node_id(id).await.context(LssSnafu)?;
        match self.lss.inquire_node_id().await {
            Ok(reported) if reported == id => (),
            Ok(reported) => {
                log::error!("Node ID {node_id} not taken, device reports {}", reported.raw());
                return NodeUnreachableSnafu { node_id }.fail();
            }
            Err(e) => {
                log::error!("No answer to node ID inquiry after assigning {node_id}: {e}");
                return NodeUnreachableSnafu { node_id }.fail();
            }
        }
        self.lss.store_config().await.context(LssSnafu)
    }

    /// Clear the node ID of every drive
    async fn unconfigure_all(&mut self) -> Result<(), Error> {
        log::info!("Unconfiguring all nodes");
        self.lss
            .set_global_mode(LssState::Configuring)
            .await
            .context(LssSnafu)?;
        // Every drive answers, only the first answer is read
        match self.lss.set_node_id(NodeId::Unconfigured).await {
            Ok(()) => {
                if let Err(e) = self.lss.store_config().await {
                    log::warn!("Could not store configuration: {e}");
                }
            }
            Err(e) => log::warn!("Error during unconfiguration: {e}"),
        }
        self.lss
            .set_global_mode(LssState::Waiting)
            .await
            .context(LssSnafu)?;
        self.nmt.reset_comms(0).await?;
        sleep(self.settings.lss_reset_delay()).await;
        Ok(())
    }

    /// Reset communication of all nodes and wait for the boot-up of each of `ids`
    async fn reset_and_wait_for_bootup(&mut self, ids: &[u8]) -> Result<(), Error> {
        let mut heartbeats = self.receiver.create_rx(FrameFilter::heartbeat());
        self.nmt.reset_comms(0).await?;

        let mut pending: BTreeSet<u8> = ids.iter().copied().collect();
        let deadline = Instant::now() + self.settings.bootup_timeout();
        while !pending.is_empty() {
            match timeout_at(deadline, heartbeats.recv()).await {
                Ok(Ok(msg)) => {
                    if let Ok(DriveMessage::Heartbeat(hb)) = DriveMessage::try_from(msg) {
                        if hb.state == NmtState::Bootup && pending.remove(&hb.node) {
                            log::debug!("Node {}: boot-up", hb.node);
                        }
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Error waiting for boot-up: {e}");
                    break;
                }
                Err(_) => break,
            }
        }
        if let Some(node_id) = pending.first() {
            log::error!("Node {node_id}: no boot-up after reset");
            return NodeUnreachableSnafu { node_id: *node_id }.fail();
        }
        Ok(())
    }

    async fn read_identity(&self, node_id: u8) -> Result<LssIdentity, Error> {
        let mut sdo = SdoClient::new_std(
            node_id,
            self.sender.clone(),
            self.receiver.create_rx(FrameFilter::sdo_response(node_id)),
        );
        sdo.set_timeout(self.settings.sdo_timeout());
        sdo.read_identity().await.context(SdoSnafu { node_id })
    }

    async fn verify_serial(&self, node_id: u8, serial: u32) -> Result<(), Error> {
        match self.read_identity(node_id).await {
            Ok(identity) if identity.serial == serial => {
                log::info!("Node {node_id}: verified serial 0x{serial:08X}");
                Ok(())
            }
            Ok(identity) => {
                log::error!(
                    "Node {node_id}: serial 0x{:08X} does not match discovered 0x{serial:08X}",
                    identity.serial
                );
                NodeUnreachableSnafu { node_id }.fail()
            }
            Err(e) => {
                log::error!("Node {node_id}: {e}");
                NodeUnreachableSnafu { node_id }.fail()
            }
        }
    }
}
