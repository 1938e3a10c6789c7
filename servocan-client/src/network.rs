//! The bus level facade
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use snafu::ResultExt;
use tokio::task::JoinHandle;
use servocan_common::{
    cia402::{DriveState, Statusword},
    constants::object_ids,
    lss::LssIdentity,
    messages::{DriveMessage, NmtState},
    object_dict::ObjectDictionary,
    objects::ObjectId,
    traits::{AsyncCanReceiver, AsyncCanSender},
    value::ObjectValue,
    NodeId,
};

use crate::{
    bus::{FrameFilter, SharedReceiver, SharedReceiverChannel, SharedSender},
    drive::Drive,
    error::*,
    lss_master::LssMaster,
    motion::{HomingParams, MotionResult, MotionSequencer, ProfileParams},
    nmt_master::NmtMaster,
    node_assignment::{AssignedNode, NodeIdAssigner},
    node_configuration::{NodeConfig, PdoConfig, StoreTarget},
    pdo_monitor::{cob_id_from_raw, PdoLayout, PdoMonitor},
    settings::ClientSettings,
    CancelToken,
};

/// What the heartbeat monitor knows about a node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node ID
    pub node_id: u8,
    /// State from the last heartbeat
    pub nmt_state: Option<NmtState>,
    /// When the last heartbeat arrived
    pub last_seen: Instant,
    /// When the last boot-up message arrived
    pub last_bootup: Option<Instant>,
}

impl core::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Node {}: {}",
            self.node_id,
            self.nmt_state
                .map(|s| s.to_string())
                .unwrap_or("Unknown State".into())
        )?;
        let age = Instant::now().duration_since(self.last_seen);
        writeln!(f, "    Last Seen: {}s ago", age.as_secs())?;
        Ok(())
    }
}

impl NodeInfo {
    fn new(node_id: u8) -> Self {
        Self {
            node_id,
            nmt_state: None,
            last_seen: Instant::now(),
            last_bootup: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_node_id(node_id: u8) -> Result<(), Error> {
    match NodeId::new(node_id) {
        Ok(NodeId::Configured(_)) => Ok(()),
        _ => InvalidNodeIdSnafu {
            value: node_id as u16,
        }
        .fail(),
    }
}

/// A CANopen bus with CiA 402 drives
///
/// Owns the shared transport, the heartbeat monitor and the PDO monitor, and hands out one
/// [`Drive`] per node.
#[derive(Debug)]
pub struct Network<S: AsyncCanSender + 'static> {
    sender: SharedSender<S>,
    receiver: SharedReceiver,
    od: Arc<ObjectDictionary>,
    settings: ClientSettings,
    pdo: Arc<PdoMonitor>,
    nodes: Arc<Mutex<HashMap<u8, NodeInfo>>>,
    drives: Mutex<HashMap<u8, Arc<Drive<S>>>>,
    _monitor_task: MonitorTask,
}

#[derive(Debug)]
struct MonitorTask(JoinHandle<()>);

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<S: AsyncCanSender + 'static> Network<S> {
    /// Start the background tasks on a transport
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        sender: S,
        receiver: impl AsyncCanReceiver + 'static,
        od: ObjectDictionary,
        settings: ClientSettings,
    ) -> Self {
        let receiver = SharedReceiver::new(receiver);
        let sender = SharedSender::new(sender);
        let pdo = Arc::new(PdoMonitor::new(receiver.create_rx(FrameFilter::Tpdo)));

        let mut heartbeat_rx = receiver.create_rx(FrameFilter::heartbeat());
        let nodes = Arc::new(Mutex::new(HashMap::new()));
        let monitor_task = {
            let nodes = nodes.clone();
            tokio::spawn(async move {
                while let Ok(msg) = heartbeat_rx.recv().await {
                    if let Ok(DriveMessage::Heartbeat(heartbeat)) = DriveMessage::try_from(msg) {
                        let mut nodes = lock(&nodes);
                        let node = match nodes.entry(heartbeat.node) {
                            Entry::Occupied(e) => e.into_mut(),
                            Entry::Vacant(e) => {
                                log::info!("Node {}: discovered", heartbeat.node);
                                e.insert(NodeInfo::new(heartbeat.node))
                            }
                        };
                        node.nmt_state = Some(heartbeat.state);
                        node.last_seen = Instant::now();
                        if heartbeat.state == NmtState::Bootup {
                            node.last_bootup = Some(node.last_seen);
                        }
                    }
                }
            })
        };

        Self {
            sender,
            receiver,
            od: Arc::new(od),
            settings,
            pdo,
            nodes,
            drives: Mutex::new(HashMap::new()),
            _monitor_task: MonitorTask(monitor_task),
        }
    }

    /// The settings in use
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// The object dictionary used for all drives
    pub fn dictionary(&self) -> &Arc<ObjectDictionary> {
        &self.od
    }

    /// The PDO monitor fed by this network
    pub fn pdo_monitor(&self) -> &Arc<PdoMonitor> {
        &self.pdo
    }

    /// Get the handle of the drive at `node_id`, creating it on first use
    pub fn drive(&self, node_id: u8) -> Result<Arc<Drive<S>>, Error> {
        check_node_id(node_id)?;
        let mut drives = lock(&self.drives);
        let drive = drives.entry(node_id).or_insert_with(|| {
            Arc::new(Drive::new(
                node_id,
                self.sender.clone(),
                self.receiver.create_rx(FrameFilter::sdo_response(node_id)),
                self.od.clone(),
                Some(self.pdo.clone()),
                self.settings.clone(),
            ))
        });
        Ok(drive.clone())
    }

    /// Get a motion sequencer for the drive at `node_id`
    pub fn sequencer(&self, node_id: u8) -> Result<MotionSequencer<S>, Error> {
        Ok(MotionSequencer::new(self.drive(node_id)?))
    }

    /// Write an object of a drive by name
    pub async fn configure(
        &self,
        node_id: u8,
        name: &str,
        value: impl Into<ObjectValue>,
    ) -> Result<(), Error> {
        self.drive(node_id)?.configure(name, value).await
    }

    /// Read an object of a drive by name
    pub async fn read(&self, node_id: u8, name: &str) -> Result<ObjectValue, Error> {
        self.drive(node_id)?.read(name).await
    }

    /// Move a drive to `state`, within the configured state transition timeout
    pub async fn transition_to(&self, node_id: u8, state: DriveState) -> Result<Statusword, Error> {
        self.drive(node_id)?
            .transition_to(state, self.settings.state_transition_timeout())
            .await
    }

    /// Clear a drive fault
    pub async fn fault_reset(&self, node_id: u8) -> Result<Statusword, Error> {
        self.drive(node_id)?
            .fault_reset(self.settings.state_transition_timeout())
            .await
    }

    /// Home a drive
    pub async fn home(
        &self,
        node_id: u8,
        params: &HomingParams,
        timeout: Duration,
    ) -> Result<MotionResult, Error> {
        self.sequencer(node_id)?
            .home(params, timeout, &CancelToken::new())
            .await
    }

    /// Move a drive to `position` and return the position read back
    pub async fn move_to(&self, node_id: u8, position: i32, timeout: Duration) -> Result<i32, Error> {
        self.move_to_with_profile(node_id, position, None, timeout)
            .await
            .map(|r| r.position)
    }

    /// Move a drive with explicit profile parameters
    pub async fn move_to_with_profile(
        &self,
        node_id: u8,
        position: i32,
        profile: Option<&ProfileParams>,
        timeout: Duration,
    ) -> Result<MotionResult, Error> {
        self.sequencer(node_id)?
            .move_to(position, profile, timeout, &CancelToken::new())
            .await
    }

    /// Put a drive into profile position mode, ready for [`move_to`](Self::move_to)
    pub async fn prepare_profile_position(
        &self,
        node_id: u8,
        window: u32,
        window_time: u16,
    ) -> Result<Statusword, Error> {
        self.sequencer(node_id)?
            .prepare_profile_position(window, window_time, self.settings.state_transition_timeout())
            .await
    }

    /// Make a drive store its parameters
    pub async fn save_parameters(&self, node_id: u8) -> Result<(), Error> {
        self.drive(node_id)?.save_parameters().await
    }

    /// Make a drive restore its default parameters
    pub async fn restore_defaults(&self, node_id: u8) -> Result<(), Error> {
        self.drive(node_id)?.restore_defaults().await
    }

    fn assigner(&self) -> NodeIdAssigner<'_, S> {
        NodeIdAssigner::new(self.sender.clone(), &self.receiver, self.settings.clone())
    }

    /// Give every drive a unique node ID starting at `base_id`
    ///
    /// Existing drive handles are dropped, since node IDs change.
    pub async fn assign_node_ids(&self, base_id: u8) -> Result<Vec<AssignedNode>, Error> {
        lock(&self.drives).clear();
        self.assigner().assign_node_ids(base_id).await
    }

    /// The node IDs reported by all drives over LSS
    pub async fn configured_node_ids(&self) -> Result<Vec<u8>, Error> {
        self.assigner().configured_node_ids().await
    }

    /// Change the node ID of a single drive
    pub async fn change_node_id(&self, current: u8, new: u8) -> Result<LssIdentity, Error> {
        lock(&self.drives).retain(|id, _| *id != current && *id != new);
        self.assigner().change_node_id(current, new).await
    }

    /// An LSS master on this bus
    pub fn lss_master(&self) -> LssMaster<SharedSender<S>, SharedReceiverChannel> {
        let mut lss = LssMaster::new(
            self.sender.clone(),
            self.receiver.create_rx(FrameFilter::lss_response()),
        );
        lss.set_response_timeout(self.settings.lss_response_timeout());
        lss
    }

    /// Write the stores and PDO settings of `config` to a drive
    ///
    /// Transmit PDOs which are enabled are registered with the PDO monitor.
    pub async fn apply_config(&self, node_id: u8, config: &NodeConfig) -> Result<(), Error> {
        let drive = self.drive(node_id)?;
        for store in config.stores() {
            match &store.target {
                StoreTarget::Name(name) => {
                    let entry = self.od.resolve(name).context(UnknownObjectSnafu)?;
                    drive.write_entry(entry, &store.value).await?;
                }
                StoreTarget::Address {
                    index,
                    sub,
                    data_type,
                } => {
                    let data = store.value.encode(*data_type).context(InvalidValueSnafu {
                        name: format!("0x{index:04X}sub{sub}"),
                    })?;
                    drive.download(*index, *sub, &data).await?;
                }
            }
        }

        for (n, pdo) in config.tpdos() {
            let n = *n as u16;
            configure_pdo(
                &drive,
                object_ids::TPDO_COMM_BASE + n,
                object_ids::TPDO_MAP_BASE + n,
                pdo,
            )
            .await?;
            let cob_id = cob_id_from_raw(pdo_cob_value(pdo.cob));
            if pdo.enabled {
                let layout = PdoLayout::new(
                    cob_id,
                    pdo.mappings
                        .iter()
                        .map(|m| (ObjectId::new(m.index, m.sub), m.size))
                        .collect(),
                );
                self.pdo
                    .register(node_id, layout)
                    .context(PdoSnafu { node_id })?;
            } else {
                self.pdo.unregister(cob_id);
            }
        }
        for (n, pdo) in config.rpdos() {
            let n = *n as u16;
            configure_pdo(
                &drive,
                object_ids::RPDO_COMM_BASE + n,
                object_ids::RPDO_MAP_BASE + n,
                pdo,
            )
            .await?;
        }
        Ok(())
    }

    /// Send NMT start to `node_id`, or to all nodes with 0
    pub async fn nmt_start(&self, node_id: u8) -> Result<(), Error> {
        self.nmt().start(node_id).await
    }

    /// Send NMT stop to `node_id`, or to all nodes with 0
    pub async fn nmt_stop(&self, node_id: u8) -> Result<(), Error> {
        self.nmt().stop(node_id).await
    }

    /// Send NMT enter pre-operational to `node_id`, or to all nodes with 0
    pub async fn nmt_pre_operational(&self, node_id: u8) -> Result<(), Error> {
        self.nmt().pre_operational(node_id).await
    }

    /// Send NMT reset application to `node_id`, or to all nodes with 0
    pub async fn nmt_reset_app(&self, node_id: u8) -> Result<(), Error> {
        self.nmt().reset_app(node_id).await
    }

    /// Send NMT reset communication to `node_id`, or to all nodes with 0
    pub async fn nmt_reset_comms(&self, node_id: u8) -> Result<(), Error> {
        self.nmt().reset_comms(node_id).await
    }

    fn nmt(&self) -> NmtMaster<SharedSender<S>> {
        NmtMaster::new(self.sender.clone())
    }

    /// Nodes seen through heartbeats, ordered by node ID
    pub fn node_list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = lock(&self.nodes).values().cloned().collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    /// Wait for a boot-up message from `node_id` received after `since`
    pub async fn wait_for_bootup(
        &self,
        node_id: u8,
        since: Instant,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let booted = lock(&self.nodes)
                .get(&node_id)
                .and_then(|n| n.last_bootup)
                .is_some_and(|t| t >= since);
            if booted {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                log::error!("Node {node_id}: timeout waiting for boot-up message");
                return NodeUnreachableSnafu { node_id }.fail();
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }
}

/// The COB-ID object value for a configured identifier
///
/// Identifiers above 0x7FF get bit 29, marking a 29-bit identifier.
fn pdo_cob_value(cob: u32) -> u32 {
    let cob = cob & 0x1FFF_FFFF;
    if cob > 0x7FF {
        cob | (1 << 29)
    } else {
        cob
    }
}

/// Write the communication and mapping parameters of one PDO
///
/// The PDO is disabled while its mapping changes.
async fn configure_pdo<S: AsyncCanSender>(
    drive: &Drive<S>,
    comm_index: u16,
    mapping_index: u16,
    config: &PdoConfig,
) -> Result<(), Error> {
    const PDO_DISABLED: u32 = 1 << 31;
    let node_id = drive.node_id();
    let mut sdo = drive.sdo_client().await;
    let context = SdoSnafu { node_id };
    let cob = pdo_cob_value(config.cob);

    sdo.download_u32(comm_index, 1, cob | PDO_DISABLED)
        .await
        .context(context)?;
    sdo.download_u8(mapping_index, 0, 0).await.context(context)?;
    for (i, mapping) in config.mappings.iter().enumerate() {
        let raw = ObjectId::new(mapping.index, mapping.sub).to_mapping(mapping.size);
        sdo.download_u32(mapping_index, i as u8 + 1, raw)
            .await
            .context(context)?;
    }
    sdo.download_u8(mapping_index, 0, config.mappings.len() as u8)
        .await
        .context(context)?;
    sdo.download_u8(comm_index, 2, config.transmission_type)
        .await
        .context(context)?;
    if let Some(inhibit_time) = config.inhibit_time {
        sdo.download_u16(comm_index, 3, inhibit_time)
            .await
            .context(context)?;
    }
    if let Some(event_timer) = config.event_timer {
        sdo.download_u16(comm_index, 5, event_timer)
            .await
            .context(context)?;
    }
    if config.enabled {
        sdo.download_u32(comm_index, 1, cob).await.context(context)?;
    }
    log::info!(
        "Node {node_id}: PDO 0x{comm_index:04X} on COB-ID 0x{cob:X} with {} mappings{}",
        config.mappings.len(),
        if config.enabled { "" } else { " (disabled)" }
    );
    Ok(())
}
