//! LSS master used to discover drives and assign their node IDs
use core::time::Duration;

use snafu::Snafu;
use tokio::time::timeout_at;
use servocan_common::{
    lss::{LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM},
    traits::{AsyncCanReceiver, AsyncCanSender},
    NodeId,
};

/// Default wait for the answer of the slave in configuration state
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(50);
/// Default wait after each fast scan step
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(20);

/// Struct to interact with nodes using the LSS protocol
#[derive(Debug)]
pub struct LssMaster<S, R> {
    sender: S,
    receiver: R,
    response_timeout: Duration,
}

/// Error returned by [`LssMaster`]
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum LssError {
    /// Timed out while waiting for an expected LSS response
    #[snafu(display("Timed out waiting for LSS response"))]
    Timeout,
    /// A request could not be handed to the transport
    #[snafu(display("Failed to send LSS request"))]
    Transport,
    /// The LSS slave returned an error code in response to a ConfigBitTiming command
    #[snafu(display(
        "LSS slave returned an error in response to ConfigBitTiming command. error: {}, Spec error: {}",
        error,
        spec_error
    ))]
    BitTimingConfigError {
        /// Error code
        ///
        /// 1 - Baudrate not supported
        /// 255 - Special error code in spec_error
        error: u8,
        /// Manufacturer specific error code
        ///
        /// Only supposed to be valid when error is 255
        spec_error: u8,
    },
    /// The LSS slave returned an error code in response to a ConfigNodeId command
    #[snafu(display(
        "LSS slave returned an error in response to ConfigNodeId command. error: {}, Spec error: {}",
        error,
        spec_error
    ))]
    NodeIdConfigError {
        /// Error code
        ///
        /// 1 - Node address is invalid
        /// 255 - Special error code in spec_error
        error: u8,
        /// Manufacturer specific error code
        ///
        /// Only supposed to be valid when error is 255
        spec_error: u8,
    },
    /// The LSS slave returned an error code in response to a StoreConfiguration command
    #[snafu(display(
        "LSS slave returned an error in response to StoreConfiguration. error: {}, Spec error: {}",
        error,
        spec_error
    ))]
    NodeStoreConfigError {
        /// Error code
        ///
        /// 1 - Node does not support storing configuration
        /// 255 - Special error code in spec_error
        error: u8,
        /// Manufacturer specific error code
        ///
        /// Only supposed to be valid when error is 255
        spec_error: u8,
    },
    /// The slave answered with a different response than the request calls for
    #[snafu(display("Unexpected LSS response {response:?}"))]
    UnexpectedResponse {
        /// The response received
        response: LssResponse,
    },
}

fn check_ack(error: u8, spec_error: u8, make: fn(u8, u8) -> LssError) -> Result<(), LssError> {
    if error == 0 {
        Ok(())
    } else {
        Err(make(error, spec_error))
    }
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> LssMaster<S, R> {
    /// Create a new LssMaster
    ///
    /// # Arguments
    /// - `sender`: An object which implements [`AsyncCanSender`] to be used for sending messages to
    ///   the bus
    /// - `receiver`: An object which implements [`AsyncCanReceiver`] to be used for receiving
    ///   messages from the bus. It only needs to deliver frames on the LSS response ID.
    pub fn new(sender: S, receiver: R) -> Self {
        Self {
            sender,
            receiver,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Set how long to wait for the answer of a slave
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Configure an LSS slave with known identity
    ///
    /// If you know the 128-bit identity value for a node, you can configure it this way.
    pub async fn configure_by_identity(
        &mut self,
        identity: LssIdentity,
        node_id: NodeId,
        baud_rate_table: u8,
        baud_rate_index: u8,
    ) -> Result<(), LssError> {
        self.enter_config_by_identity(identity).await?;
        self.set_node_id(node_id).await?;
        self.set_baud_rate(baud_rate_table, baud_rate_index).await?;
        Ok(())
    }

    /// Put the single node with this identity into configuration state
    ///
    /// All other slaves are switched to waiting state first.
    pub async fn enter_config_by_identity(&mut self, identity: LssIdentity) -> Result<(), LssError> {
        self.send(LssRequest::SwitchModeGlobal {
            mode: LssState::Waiting as u8,
        })
        .await?;

        // The slave whose identity matches answers the serial step
        self.send(LssRequest::SwitchStateVendor {
            vendor_id: identity.vendor_id,
        })
        .await?;
        self.send(LssRequest::SwitchStateProduct {
            product_code: identity.product_code,
        })
        .await?;
        self.send(LssRequest::SwitchStateRevision {
            revision: identity.revision,
        })
        .await?;
        match self
            .send_and_receive(LssRequest::SwitchStateSerial {
                serial: identity.serial,
            })
            .await?
        {
            LssResponse::SwitchStateResponse => Ok(()),
            response => UnexpectedResponseSnafu { response }.fail(),
        }
    }

    /// Send a command to set the baud rate on the LSS slave current in configuration mode
    ///
    /// The node must have been put into configuration mode already.
    ///
    /// Returns Err(LssError::Timeout) if the node does not respond to the command, or
    /// Err(LssError::BitTimingConfigError) if the node responds with an error.
    ///
    /// # Arguments
    /// * `table` - The index of the table of baud rate settings to use (0 for the default CANOpen
    ///   table)
    /// * `index` - The index into the table of the baud rate setting to use
    pub async fn set_baud_rate(&mut self, table: u8, index: u8) -> Result<(), LssError> {
        match self
            .send_and_receive(LssRequest::ConfigureBitTiming { table, index })
            .await?
        {
            LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                check_ack(error, spec_error, |error, spec_error| {
                    LssError::BitTimingConfigError { error, spec_error }
                })
            }
            response => UnexpectedResponseSnafu { response }.fail(),
        }
    }

    /// Tell every slave to switch to its configured bit timing after `delay_ms`
    pub async fn activate_bit_timing(&mut self, delay_ms: u16) -> Result<(), LssError> {
        self.send(LssRequest::ActivateBitTiming { delay: delay_ms })
            .await
    }

    /// Send a command to set the node ID on the LSS slave current in configuration mode
    ///
    /// The node must have been put into configuration mode already. Passing
    /// [`NodeId::Unconfigured`] clears the node ID.
    ///
    /// Returns Err(LssError::Timeout) if the node does not respond to the command, or
    /// Err(LssError::NodeIdConfigError) if the node responds with an error.
    pub async fn set_node_id(&mut self, node_id: NodeId) -> Result<(), LssError> {
        match self
            .send_and_receive(LssRequest::ConfigureNodeId {
                node_id: node_id.into(),
            })
            .await?
        {
            LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                check_ack(error, spec_error, |error, spec_error| {
                    LssError::NodeIdConfigError { error, spec_error }
                })
            }
            response => UnexpectedResponseSnafu { response }.fail(),
        }
    }

    /// Send command to store configuration
    ///
    /// The node must have been put into configuration mode already.
    ///
    /// Returns Err(LssError::Timeout) if the node does not respond to the command, or
    /// Err(LssError::NodeStoreConfigError) if the node responds with an error.
    pub async fn store_config(&mut self) -> Result<(), LssError> {
        match self
            .send_and_receive(LssRequest::StoreConfiguration)
            .await?
        {
            LssResponse::StoreConfigurationAck { error, spec_error } => {
                check_ack(error, spec_error, |error, spec_error| {
                    LssError::NodeStoreConfigError { error, spec_error }
                })
            }
            response => UnexpectedResponseSnafu { response }.fail(),
        }
    }

    /// Read the active node ID of the slave in configuration state
    pub async fn inquire_node_id(&mut self) -> Result<NodeId, LssError> {
        match self.send_and_receive(LssRequest::InquireNodeId).await? {
            LssResponse::InquireNodeIdAck { node_id } => {
                NodeId::new(node_id).map_err(|_| LssError::UnexpectedResponse {
                    response: LssResponse::InquireNodeIdAck { node_id },
                })
            }
            response => UnexpectedResponseSnafu { response }.fail(),
        }
    }

    /// Collect the node IDs reported by every slave in configuration state
    ///
    /// Waits the full `timeout`, since any number of slaves may answer.
    pub async fn inquire_all_node_ids(&mut self, timeout: Duration) -> Result<Vec<u8>, LssError> {
        if let Err(e) = self.receiver.flush() {
            log::warn!("Error flushing LSS receiver: {e}");
        }
        self.send(LssRequest::InquireNodeId).await?;
        let wait_until = tokio::time::Instant::now() + timeout;
        let mut ids = Vec::new();
        loop {
            match timeout_at(wait_until, self.receiver.recv()).await {
                Err(_) => break,
                Ok(Ok(msg)) => {
                    if let Ok(LssResponse::InquireNodeIdAck { node_id }) = LssResponse::try_from(msg)
                    {
                        ids.push(node_id);
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Error reading LSS responses: {e}");
                    return TimeoutSnafu.fail();
                }
            }
        }
        Ok(ids)
    }

    /// Read the 128-bit identity of the slave in configuration state
    pub async fn inquire_identity(&mut self) -> Result<LssIdentity, LssError> {
        let vendor_id = match self.send_and_receive(LssRequest::InquireVendor).await? {
            LssResponse::InquireVendorAck { vendor_id } => vendor_id,
            response => return UnexpectedResponseSnafu { response }.fail(),
        };
        let product_code = match self.send_and_receive(LssRequest::InquireProduct).await? {
            LssResponse::InquireProductAck { product_code } => product_code,
            response => return UnexpectedResponseSnafu { response }.fail(),
        };
        let revision = match self.send_and_receive(LssRequest::InquireRevision).await? {
            LssResponse::InquireRevisionAck { revision } => revision,
            response => return UnexpectedResponseSnafu { response }.fail(),
        };
        let serial = match self.send_and_receive(LssRequest::InquireSerial).await? {
            LssResponse::InquireSerialAck { serial } => serial,
            response => return UnexpectedResponseSnafu { response }.fail(),
        };
        Ok(LssIdentity::new(vendor_id, product_code, revision, serial))
    }

    /// Perform a fast scan of the network to find one unconfigured node
    ///
    /// On success, the found node is left in configuration state. Returns `Ok(None)` when no
    /// unconfigured node answers.
    ///
    /// # Arguments
    /// * `timeout` - The duration of time to wait for responses after each message.
    ///   Duration::from_millis(20) is probably a pretty safe value, but this depends on the
    ///   responsiveness of the slaves, and on the amount of bus traffic. If the timeout is set too
    ///   short, the scan may fail to find existing nodes.
    pub async fn fast_scan(&mut self, timeout: Duration) -> Result<Option<LssIdentity>, LssError> {
        let mut id = [0u32; 4];

        // The first message resets the LSS state machines, and a response confirms that there is
        // at least one unconfigured slave to discover
        if !self.fast_scan_step(0, LSS_FASTSCAN_CONFIRM, 0, 0, timeout).await? {
            return Ok(None);
        }
        for sub in 0..4u8 {
            for bit_check in (0..32u8).rev() {
                // Slaves answer when their identity matches in all bits above bit_check
                if !self
                    .fast_scan_step(id[sub as usize], bit_check, sub, sub, timeout)
                    .await?
                {
                    id[sub as usize] |= 1 << bit_check;
                }
            }
            let next = (sub + 1) % 4;
            if !self
                .fast_scan_step(id[sub as usize], 0, sub, next, timeout)
                .await?
            {
                log::warn!("LSS fast scan lost the slave while confirming sub {sub}");
                return Ok(None);
            }
        }

        Ok(Some(LssIdentity::new(id[0], id[1], id[2], id[3])))
    }

    /// Send command to the bus to set the LSS mode for all nodes
    pub async fn set_global_mode(&mut self, mode: LssState) -> Result<(), LssError> {
        self.send(LssRequest::SwitchModeGlobal { mode: mode as u8 })
            .await
    }

    async fn fast_scan_step(
        &mut self,
        id: u32,
        bit_check: u8,
        sub: u8,
        next: u8,
        timeout: Duration,
    ) -> Result<bool, LssError> {
        self.send(LssRequest::FastScan {
            id,
            bit_check,
            sub,
            next,
        })
        .await?;

        // Unlike send_and_receive, always wait the full timeout, because any number of slaves may
        // answer
        let wait_until = tokio::time::Instant::now() + timeout;
        let mut resp_flag = false;
        loop {
            match timeout_at(wait_until, self.receiver.recv()).await {
                Err(_) => break,
                Ok(Ok(msg)) => {
                    if let Ok(LssResponse::IdentifySlave) = LssResponse::try_from(msg) {
                        resp_flag = true;
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Error reading LSS responses: {e}");
                    return TimeoutSnafu.fail();
                }
            }
        }
        Ok(resp_flag)
    }

    async fn send(&mut self, msg: LssRequest) -> Result<(), LssError> {
        self.sender
            .send(msg.into())
            .await
            .map_err(|_| LssError::Transport)
    }

    async fn send_and_receive(&mut self, msg: LssRequest) -> Result<LssResponse, LssError> {
        // Drop stale answers from earlier exchanges
        if let Err(e) = self.receiver.flush() {
            log::warn!("Error flushing LSS receiver: {e}");
        }
        self.send(msg).await?;

        let wait_until = tokio::time::Instant::now() + self.response_timeout;
        loop {
            match timeout_at(wait_until, self.receiver.recv()).await {
                Ok(Ok(msg)) => {
                    // Frames which are not LSS responses are skipped
                    if let Ok(lss_resp) = msg.try_into() {
                        return Ok(lss_resp);
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Error reading LSS responses: {e}");
                    return TimeoutSnafu.fail();
                }
                Err(_) => return TimeoutSnafu.fail(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use servocan_common::{
        messages::{CanMessage, LSS_REQ_ID},
        traits::CanSendError,
    };
    use tokio::sync::mpsc;

    #[derive(Debug, Snafu)]
    struct Closed;

    /// Slaves answering fast scan steps the way LSS slaves do
    struct FakeSlaves {
        identities: Vec<LssIdentity>,
        tx: mpsc::UnboundedSender<CanMessage>,
        states: Arc<Mutex<Vec<(u8, bool)>>>,
    }

    impl AsyncCanSender for FakeSlaves {
        async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
            assert_eq!(LSS_REQ_ID, msg.id());
            let Ok(LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            }) = LssRequest::try_from(msg.data())
            else {
                return Ok(());
            };
            let mut states = self.states.lock().unwrap();
            let mut answered = false;
            for (i, identity) in self.identities.iter().enumerate() {
                let (state_sub, active) = &mut states[i];
                if bit_check == LSS_FASTSCAN_CONFIRM {
                    *state_sub = 0;
                    *active = true;
                    answered = true;
                    continue;
                }
                if !*active || *state_sub != sub {
                    continue;
                }
                let Some(value) = identity.by_addr(sub) else {
                    continue;
                };
                let mask = u32::MAX.checked_shl(bit_check as u32).unwrap_or(0);
                if value & mask == id & mask {
                    answered = true;
                    if bit_check == 0 {
                        *state_sub = next;
                    }
                } else if bit_check == 0 {
                    *active = false;
                }
            }
            if answered {
                self.tx
                    .send(LssResponse::IdentifySlave.into())
                    .map_err(|e| CanSendError(e.0))?;
            }
            Ok(())
        }
    }

    struct ChannelReceiver(mpsc::UnboundedReceiver<CanMessage>);

    impl AsyncCanReceiver for ChannelReceiver {
        type Error = Closed;

        fn try_recv(&mut self) -> Result<Option<CanMessage>, Closed> {
            Ok(self.0.try_recv().ok())
        }

        async fn recv(&mut self) -> Result<CanMessage, Closed> {
            self.0.recv().await.ok_or(Closed)
        }
    }

    fn master(identities: Vec<LssIdentity>) -> LssMaster<FakeSlaves, ChannelReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        let states = Arc::new(Mutex::new(vec![(0, false); identities.len()]));
        LssMaster::new(
            FakeSlaves {
                identities,
                tx,
                states,
            },
            ChannelReceiver(rx),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_scan_finds_lowest_identity() {
        let a = LssIdentity::new(0x1234, 0x5678, 2, 100);
        let b = LssIdentity::new(0x1234, 0x5678, 2, 7);
        let mut master = master(vec![a, b]);
        let found = master
            .fast_scan(DEFAULT_SCAN_TIMEOUT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b, found);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_scan_empty_bus() {
        let mut master = master(vec![]);
        assert_eq!(None, master.fast_scan(DEFAULT_SCAN_TIMEOUT).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_node_id_times_out() {
        let mut master = master(vec![]);
        assert_eq!(
            Err(LssError::Timeout),
            master.set_node_id(NodeId::new(5).unwrap()).await
        );
    }
}
