//! A simulated CiA 402 servo drive
//!
//! Implements enough of a real drive to exercise the client: an SDO server with expedited and
//! segmented transfers, the power state machine, homing and profile position modes, TPDOs built
//! from the PDO objects, an LSS slave and NMT.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use servocan_common::{
    cia402::{
        next_state, DriveCommand, DriveState, OperationMode, CW_FAULT_RESET, CW_NEW_SETPOINT,
        SW_HOMING_ERROR, SW_OPERATION_MODE_SPECIFIC, SW_TARGET_REACHED,
    },
    constants::{object_ids, values},
    lss::{LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM},
    messages::{
        default_rpdo_cob_id, default_tpdo_cob_id, CanId, CanMessage, DriveMessage, Heartbeat,
        NmtCommandCmd, NmtState, NUM_DEFAULT_PDOS, SDO_RESP_BASE,
    },
    objects::ObjectId,
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
    NodeId,
};

use crate::sim_bus::SimBus;

const UNCONFIGURED: u8 = NodeId::UNCONFIGURED_RAW;
const PDO_DISABLED: u32 = 1 << 31;
/// Statusword bits which follow a new set-point
const MOTION_BITS: u16 = SW_TARGET_REACHED | SW_OPERATION_MODE_SPECIFIC | SW_HOMING_ERROR;

/// How a simulated drive is set up, and which misbehaviour it shows
#[derive(Debug, Clone)]
pub struct SimDriveConfig {
    /// Node ID at power up, 255 for unconfigured
    pub node_id: u8,
    pub identity: LssIdentity,
    pub device_name: String,
    /// Time from set-point acknowledge to target reached
    pub motion_time: Duration,
    /// Time from homing start to homing attained
    pub homing_time: Duration,
    /// Period of TPDO transmission while operational
    pub tpdo_period: Duration,
    /// Never acknowledge a new set-point
    pub never_ack: bool,
    /// Report a homing error instead of homing attained
    pub homing_fails: bool,
    /// Send upload segments with an inverted toggle bit
    pub broken_toggle: bool,
    /// After each edge of controlword bit 4, keep reporting the previous target reached,
    /// bit 12 and homing error for this long
    pub status_lag: Duration,
}

impl SimDriveConfig {
    pub fn new(node_id: u8, serial: u32) -> Self {
        Self {
            node_id,
            identity: LssIdentity::new(0x0000_0A5E, 0x0000_0100, 1, serial),
            device_name: "XLA-5-SIM".into(),
            motion_time: Duration::from_millis(50),
            homing_time: Duration::from_millis(50),
            tpdo_period: Duration::from_millis(10),
            never_ack: false,
            homing_fails: false,
            broken_toggle: false,
            status_lag: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
enum SdoState {
    Idle,
    Download {
        index: u16,
        sub: u8,
        toggle: bool,
        buf: Vec<u8>,
    },
    Upload {
        toggle: bool,
        data: Vec<u8>,
        pos: usize,
    },
}

#[derive(Debug)]
struct FastScanState {
    sub: u8,
    active: bool,
}

/// An access to the drive's object dictionary, as seen by the drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// An SDO write which the drive accepted
    Write { index: u16, sub: u8, data: Vec<u8> },
    /// The statusword was read over SDO, with the value returned
    StatuswordRead(u16),
}

/// The observable state of a simulated drive
#[derive(Debug)]
pub struct DriveModel {
    config: SimDriveConfig,
    /// The node ID in use
    node_id: u8,
    /// The node ID applied at the next communication reset
    pending_node_id: u8,
    stored_node_id: u8,
    nmt_state: NmtState,
    lss_state: LssState,
    selective_match: u8,
    fast_scan: FastScanState,
    objects: HashMap<ObjectId, Vec<u8>>,
    sdo: SdoState,

    state: DriveState,
    mode: i8,
    controlword: u16,
    controlwords: Vec<u16>,
    events: Vec<SimEvent>,
    position: i32,
    target_reached: bool,
    setpoint_ack: bool,
    homing_attained: bool,
    homing_error: bool,
    homing_until: Option<Instant>,
    move_until: Option<(Instant, i32)>,
    /// Motion bits reported in place of the real ones, until the instant
    lagged: Option<(Instant, u16)>,
    clock: Instant,
    saved: usize,
    restored: usize,
}

fn u32_bytes(v: u32) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

fn read_u32(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let len = data.len().min(4);
    buf[..len].copy_from_slice(&data[..len]);
    u32::from_le_bytes(buf)
}

impl DriveModel {
    fn new(config: SimDriveConfig) -> Self {
        let node_id = config.node_id;
        let mut model = Self {
            node_id,
            pending_node_id: node_id,
            stored_node_id: node_id,
            nmt_state: NmtState::PreOperational,
            lss_state: LssState::Waiting,
            selective_match: 0,
            fast_scan: FastScanState {
                sub: 0,
                active: false,
            },
            objects: HashMap::new(),
            sdo: SdoState::Idle,
            state: DriveState::SwitchOnDisabled,
            mode: 0,
            controlword: 0,
            controlwords: Vec::new(),
            events: Vec::new(),
            position: 0,
            target_reached: true,
            setpoint_ack: false,
            homing_attained: false,
            homing_error: false,
            homing_until: None,
            move_until: None,
            lagged: None,
            clock: Instant::now(),
            saved: 0,
            restored: 0,
            config,
        };
        model.load_defaults();
        model
    }

    fn set(&mut self, index: u16, sub: u8, data: Vec<u8>) {
        self.objects.insert(ObjectId::new(index, sub), data);
    }

    fn load_defaults(&mut self) {
        let identity = self.config.identity;
        self.set(0x1000, 0, u32_bytes(0x0002_0192));
        self.set(0x1001, 0, vec![0]);
        self.set(object_ids::DEVICE_NAME, 0, self.config.device_name.as_bytes().to_vec());
        self.set(object_ids::SAVE_OBJECTS, 1, u32_bytes(1));
        self.set(object_ids::RESTORE_DEFAULTS, 1, u32_bytes(1));
        self.set(object_ids::HEARTBEAT_PRODUCER_TIME, 0, vec![0, 0]);
        self.set(object_ids::IDENTITY, 0, vec![4]);
        self.set(object_ids::IDENTITY, 1, u32_bytes(identity.vendor_id));
        self.set(object_ids::IDENTITY, 2, u32_bytes(identity.product_code));
        self.set(object_ids::IDENTITY, 3, u32_bytes(identity.revision));
        self.set(object_ids::IDENTITY, 4, u32_bytes(identity.serial));

        for (index, len) in [
            (object_ids::POSITION_WINDOW, 4),
            (object_ids::POSITION_WINDOW_TIME, 2),
            (object_ids::TARGET_POSITION, 4),
            (object_ids::HOME_OFFSET, 4),
            (object_ids::MAX_PROFILE_VELOCITY, 4),
            (object_ids::PROFILE_VELOCITY, 4),
            (object_ids::PROFILE_ACCELERATION, 4),
            (object_ids::PROFILE_DECELERATION, 4),
            (object_ids::HOMING_METHOD, 1),
            (object_ids::HOMING_ACCELERATION, 4),
            (object_ids::MAX_ACCELERATION, 4),
        ] {
            self.set(index, 0, vec![0; len]);
        }
        for sub in [1, 2] {
            self.set(object_ids::SOFTWARE_POSITION_LIMIT, sub, vec![0; 4]);
            self.set(object_ids::HOMING_SPEEDS, sub, vec![0; 4]);
        }
        self.set(object_ids::PROFILE_JERK, 1, vec![0; 4]);
        self.load_pdo_defaults();
    }

    /// TPDO1 sends statusword and position, everything else is disabled
    fn load_pdo_defaults(&mut self) {
        let node_id = if self.node_id == UNCONFIGURED {
            0
        } else {
            self.node_id
        };
        for n in 0..NUM_DEFAULT_PDOS {
            let n16 = n as u16;
            for (comm, map, cob) in [
                (
                    object_ids::RPDO_COMM_BASE,
                    object_ids::RPDO_MAP_BASE,
                    default_rpdo_cob_id(node_id, n) as u32 | PDO_DISABLED,
                ),
                (
                    object_ids::TPDO_COMM_BASE,
                    object_ids::TPDO_MAP_BASE,
                    if n == 0 {
                        default_tpdo_cob_id(node_id, n) as u32
                    } else {
                        default_tpdo_cob_id(node_id, n) as u32 | PDO_DISABLED
                    },
                ),
            ] {
                self.set(comm + n16, 1, u32_bytes(cob));
                self.set(comm + n16, 2, vec![254]);
                self.set(comm + n16, 3, vec![0, 0]);
                self.set(comm + n16, 5, vec![0, 0]);
                self.set(map + n16, 0, vec![0]);
                for sub in 1..=8 {
                    self.set(map + n16, sub, vec![0; 4]);
                }
            }
        }
        let map = object_ids::TPDO_MAP_BASE;
        self.set(map, 1, u32_bytes(ObjectId::new(object_ids::STATUSWORD, 0).to_mapping(16)));
        self.set(
            map,
            2,
            u32_bytes(ObjectId::new(object_ids::POSITION_ACTUAL_VALUE, 0).to_mapping(32)),
        );
        self.set(map, 0, vec![2]);
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn pending_node_id(&self) -> u8 {
        self.pending_node_id
    }

    pub fn stored_node_id(&self) -> u8 {
        self.stored_node_id
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    pub fn mode(&self) -> i8 {
        self.mode
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    /// Every controlword written, in order
    pub fn controlwords(&self) -> &[u16] {
        &self.controlwords
    }

    /// Accepted writes and statusword reads, in order
    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    /// Number of accepted store parameter commands
    pub fn saved(&self) -> usize {
        self.saved
    }

    /// Number of accepted restore default commands
    pub fn restored(&self) -> usize {
        self.restored
    }

    pub fn object(&self, index: u16, sub: u8) -> Option<&[u8]> {
        self.objects
            .get(&ObjectId::new(index, sub))
            .map(|v| v.as_slice())
    }

    pub fn set_never_ack(&mut self, never_ack: bool) {
        self.config.never_ack = never_ack;
    }

    /// Put the power state machine into `state`, as if the drive had got there by itself
    pub fn force_state(&mut self, state: DriveState) {
        self.state = state;
        self.controlword = match state {
            DriveState::ReadyToSwitchOn => 0x06,
            DriveState::SwitchedOn => 0x07,
            DriveState::OperationEnabled => 0x0F,
            DriveState::QuickStopActive => 0x02,
            _ => 0,
        };
    }

    /// Latch a fault, aborting any motion
    pub fn inject_fault(&mut self) {
        self.state = DriveState::Fault;
        self.move_until = None;
        self.homing_until = None;
        self.setpoint_ack = false;
    }

    pub fn statusword(&self) -> u16 {
        let sw = self.actual_statusword();
        match self.lagged {
            Some((until, bits)) if self.clock < until => (sw & !MOTION_BITS) | bits,
            _ => sw,
        }
    }

    fn actual_statusword(&self) -> u16 {
        let mut sw = self.state.statusword_bits();
        if self.target_reached {
            sw |= SW_TARGET_REACHED;
        }
        match OperationMode::try_from(self.mode) {
            Ok(OperationMode::Homing) => {
                if self.homing_attained {
                    sw |= SW_OPERATION_MODE_SPECIFIC;
                }
                if self.homing_error {
                    sw |= SW_HOMING_ERROR;
                }
            }
            Ok(OperationMode::ProfilePosition) => {
                if self.setpoint_ack {
                    sw |= SW_OPERATION_MODE_SPECIFIC;
                }
            }
            _ => (),
        }
        sw
    }

    /// Advance running motion to `now`
    fn update(&mut self, now: Instant) {
        self.clock = self.clock.max(now);
        if self.homing_until.is_some_and(|t| now >= t) {
            self.homing_until = None;
            if self.config.homing_fails {
                self.homing_error = true;
            } else {
                let offset = read_u32(self.object(object_ids::HOME_OFFSET, 0).unwrap_or(&[]));
                self.position = offset as i32;
                self.homing_attained = true;
                self.target_reached = true;
            }
        }
        if let Some((until, target)) = self.move_until {
            if now >= until {
                self.move_until = None;
                self.position = target;
                self.target_reached = true;
            }
        }
    }

    fn write_controlword(&mut self, cw: u16, now: Instant) {
        let prev = self.controlword;
        self.controlword = cw;
        self.controlwords.push(cw);
        if (cw ^ prev) & CW_NEW_SETPOINT != 0 && !self.config.status_lag.is_zero() {
            let bits = self.actual_statusword() & MOTION_BITS;
            self.lagged = Some((now + self.config.status_lag, bits));
        }

        let reset_edge = cw & CW_FAULT_RESET != 0 && prev & CW_FAULT_RESET == 0;
        if self.state == DriveState::Fault {
            if reset_edge {
                self.state = DriveState::SwitchOnDisabled;
            }
            return;
        }
        if let Some(command) = DriveCommand::from_controlword(cw) {
            // 0x07 means disable operation when coming from OPERATION ENABLED
            let command = match (self.state, command) {
                (DriveState::OperationEnabled, DriveCommand::SwitchOn) => {
                    DriveCommand::DisableOperation
                }
                (_, command) => command,
            };
            if let Some(next) = next_state(self.state, command) {
                self.state = next;
            }
        }
        if self.state != DriveState::OperationEnabled {
            self.move_until = None;
            self.homing_until = None;
            self.setpoint_ack = false;
            return;
        }

        let rising = cw & CW_NEW_SETPOINT != 0 && prev & CW_NEW_SETPOINT == 0;
        let falling = cw & CW_NEW_SETPOINT == 0 && prev & CW_NEW_SETPOINT != 0;
        match OperationMode::try_from(self.mode) {
            Ok(OperationMode::Homing) if rising => {
                self.homing_attained = false;
                self.homing_error = false;
                self.target_reached = false;
                self.homing_until = Some(now + self.config.homing_time);
            }
            Ok(OperationMode::ProfilePosition) => {
                if rising && !self.config.never_ack {
                    let target =
                        read_u32(self.object(object_ids::TARGET_POSITION, 0).unwrap_or(&[]));
                    self.setpoint_ack = true;
                    self.target_reached = false;
                    self.move_until = Some((now + self.config.motion_time, target as i32));
                }
                if falling {
                    self.setpoint_ack = false;
                }
            }
            _ => (),
        }
    }

    fn read_object(&self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        match (index, sub) {
            (object_ids::STATUSWORD, 0) => Ok(self.statusword().to_le_bytes().to_vec()),
            (object_ids::CONTROLWORD, 0) => Ok(self.controlword.to_le_bytes().to_vec()),
            (object_ids::MODE_OF_OPERATION, 0) | (object_ids::MODE_OF_OPERATION_DISPLAY, 0) => {
                Ok(vec![self.mode as u8])
            }
            (object_ids::POSITION_ACTUAL_VALUE, 0) => Ok(self.position.to_le_bytes().to_vec()),
            _ => self
                .objects
                .get(&ObjectId::new(index, sub))
                .cloned()
                .ok_or(AbortCode::NoSuchObject),
        }
    }

    fn write_object(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        now: Instant,
    ) -> Result<(), AbortCode> {
        self.apply_write(index, sub, data, now)?;
        self.events.push(SimEvent::Write {
            index,
            sub,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn apply_write(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        now: Instant,
    ) -> Result<(), AbortCode> {
        match (index, sub) {
            (object_ids::CONTROLWORD, 0) => {
                self.write_controlword(read_u32(data) as u16, now);
                return Ok(());
            }
            (object_ids::MODE_OF_OPERATION, 0) => {
                self.mode = *data.first().ok_or(AbortCode::DataTypeMismatchLengthLow)? as i8;
                return Ok(());
            }
            (object_ids::STATUSWORD, 0)
            | (object_ids::MODE_OF_OPERATION_DISPLAY, 0)
            | (object_ids::POSITION_ACTUAL_VALUE, 0)
            | (object_ids::DEVICE_NAME, 0)
            | (object_ids::IDENTITY, _) => return Err(AbortCode::ReadOnly),
            (object_ids::SAVE_OBJECTS, 1) => {
                if read_u32(data) != values::SAVE_CMD {
                    return Err(AbortCode::CantStore);
                }
                self.saved += 1;
                return Ok(());
            }
            (object_ids::RESTORE_DEFAULTS, 1) => {
                if read_u32(data) != values::LOAD_CMD {
                    return Err(AbortCode::CantStore);
                }
                self.restored += 1;
                return Ok(());
            }
            _ => (),
        }
        let id = ObjectId::new(index, sub);
        let Some(current) = self.objects.get_mut(&id) else {
            return Err(AbortCode::NoSuchObject);
        };
        if data.len() > current.len() {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        if data.len() < current.len() {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        current.copy_from_slice(data);
        Ok(())
    }

    fn handle_sdo(&mut self, req: SdoRequest, now: Instant) -> Option<SdoResponse> {
        match req {
            SdoRequest::InitiateDownload {
                n,
                e: true,
                s,
                index,
                sub,
                data,
            } => {
                let len = if s { 4 - n as usize } else { 4 };
                self.sdo = SdoState::Idle;
                Some(match self.write_object(index, sub, &data[..len], now) {
                    Ok(()) => SdoResponse::download_acknowledge(index, sub),
                    Err(code) => SdoResponse::abort(index, sub, code),
                })
            }
            SdoRequest::InitiateDownload {
                e: false,
                index,
                sub,
                ..
            } => {
                if self.read_object(index, sub).is_err() {
                    self.sdo = SdoState::Idle;
                    return Some(SdoResponse::abort(index, sub, AbortCode::NoSuchObject));
                }
                self.sdo = SdoState::Download {
                    index,
                    sub,
                    toggle: false,
                    buf: Vec::new(),
                };
                Some(SdoResponse::download_acknowledge(index, sub))
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                let SdoState::Download {
                    index,
                    sub,
                    toggle,
                    buf,
                } = &mut self.sdo
                else {
                    return Some(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier));
                };
                let (index, sub) = (*index, *sub);
                if t != *toggle {
                    self.sdo = SdoState::Idle;
                    return Some(SdoResponse::abort(index, sub, AbortCode::ToggleNotAlternated));
                }
                buf.extend_from_slice(&data[..7 - n as usize]);
                *toggle = !*toggle;
                if c {
                    let buf = std::mem::take(buf);
                    self.sdo = SdoState::Idle;
                    if let Err(code) = self.write_object(index, sub, &buf, now) {
                        return Some(SdoResponse::abort(index, sub, code));
                    }
                }
                Some(SdoResponse::download_segment_acknowledge(t))
            }
            SdoRequest::InitiateUpload { index, sub } => {
                self.sdo = SdoState::Idle;
                if (index, sub) == (object_ids::STATUSWORD, 0) {
                    self.events.push(SimEvent::StatuswordRead(self.statusword()));
                }
                match self.read_object(index, sub) {
                    Ok(data) if data.len() <= 4 => {
                        Some(SdoResponse::expedited_upload(index, sub, &data))
                    }
                    Ok(data) => {
                        let size = data.len() as u32;
                        self.sdo = SdoState::Upload {
                            toggle: false,
                            data,
                            pos: 0,
                        };
                        Some(SdoResponse::upload_acknowledge(index, sub, size))
                    }
                    Err(code) => Some(SdoResponse::abort(index, sub, code)),
                }
            }
            SdoRequest::ReqUploadSegment { t } => {
                let SdoState::Upload { toggle, data, pos } = &mut self.sdo else {
                    return Some(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier));
                };
                if t != *toggle {
                    self.sdo = SdoState::Idle;
                    return Some(SdoResponse::abort(0, 0, AbortCode::ToggleNotAlternated));
                }
                let end = (*pos + 7).min(data.len());
                let chunk = data[*pos..end].to_vec();
                *pos = end;
                *toggle = !*toggle;
                let complete = end >= data.len();
                if complete {
                    self.sdo = SdoState::Idle;
                }
                let sent_toggle = if self.config.broken_toggle { !t } else { t };
                Some(SdoResponse::upload_segment(sent_toggle, complete, &chunk))
            }
            SdoRequest::Abort { .. } => {
                self.sdo = SdoState::Idle;
                None
            }
        }
    }

    fn handle_lss(&mut self, req: LssRequest) -> Option<LssResponse> {
        let identity = self.config.identity;
        match req {
            LssRequest::SwitchModeGlobal { mode } => {
                self.lss_state = LssState::from_byte(mode).unwrap_or(LssState::Waiting);
                self.selective_match = 0;
                None
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                self.selective_match = (vendor_id == identity.vendor_id) as u8;
                None
            }
            LssRequest::SwitchStateProduct { product_code } => {
                if self.selective_match == 1 && product_code == identity.product_code {
                    self.selective_match = 2;
                } else {
                    self.selective_match = 0;
                }
                None
            }
            LssRequest::SwitchStateRevision { revision } => {
                if self.selective_match == 2 && revision == identity.revision {
                    self.selective_match = 3;
                } else {
                    self.selective_match = 0;
                }
                None
            }
            LssRequest::SwitchStateSerial { serial } => {
                let matched = self.selective_match == 3 && serial == identity.serial;
                self.selective_match = 0;
                if matched {
                    self.lss_state = LssState::Configuring;
                    Some(LssResponse::SwitchStateResponse)
                } else {
                    None
                }
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => self.handle_fast_scan(id, bit_check, sub, next),
            _ if self.lss_state != LssState::Configuring => None,
            LssRequest::ConfigureNodeId { node_id } => {
                if node_id == UNCONFIGURED || (1..=127).contains(&node_id) {
                    self.pending_node_id = node_id;
                    Some(LssResponse::ConfigureNodeIdAck {
                        error: 0,
                        spec_error: 0,
                    })
                } else {
                    Some(LssResponse::ConfigureNodeIdAck {
                        error: 1,
                        spec_error: 0,
                    })
                }
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                let error = if table == 0 && index <= 8 && index != 5 { 0 } else { 1 };
                Some(LssResponse::ConfigureBitTimingAck {
                    error,
                    spec_error: 0,
                })
            }
            LssRequest::ActivateBitTiming { .. } => None,
            LssRequest::StoreConfiguration => {
                self.stored_node_id = self.pending_node_id;
                Some(LssResponse::StoreConfigurationAck {
                    error: 0,
                    spec_error: 0,
                })
            }
            LssRequest::InquireVendor => Some(LssResponse::InquireVendorAck {
                vendor_id: identity.vendor_id,
            }),
            LssRequest::InquireProduct => Some(LssResponse::InquireProductAck {
                product_code: identity.product_code,
            }),
            LssRequest::InquireRevision => Some(LssResponse::InquireRevisionAck {
                revision: identity.revision,
            }),
            LssRequest::InquireSerial => Some(LssResponse::InquireSerialAck {
                serial: identity.serial,
            }),
            LssRequest::InquireNodeId => Some(LssResponse::InquireNodeIdAck {
                node_id: self.pending_node_id,
            }),
        }
    }

    /// Only drives without a node ID take part in fast scan
    fn handle_fast_scan(
        &mut self,
        id: u32,
        bit_check: u8,
        sub: u8,
        next: u8,
    ) -> Option<LssResponse> {
        if self.pending_node_id != UNCONFIGURED || self.lss_state != LssState::Waiting {
            return None;
        }
        if bit_check == LSS_FASTSCAN_CONFIRM {
            self.fast_scan = FastScanState { sub: 0, active: true };
            return Some(LssResponse::IdentifySlave);
        }
        if !self.fast_scan.active || self.fast_scan.sub != sub || bit_check > 31 {
            return None;
        }
        let value = self.config.identity.by_addr(sub)?;
        let mask = u32::MAX.checked_shl(bit_check as u32).unwrap_or(0);
        if value & mask != id & mask {
            if bit_check == 0 {
                self.fast_scan.active = false;
            }
            return None;
        }
        if bit_check == 0 {
            if sub == 3 {
                self.fast_scan.active = false;
                self.lss_state = LssState::Configuring;
            } else {
                self.fast_scan.sub = next;
            }
        }
        Some(LssResponse::IdentifySlave)
    }

    fn handle_nmt(&mut self, cmd: NmtCommandCmd) -> Option<CanMessage> {
        match cmd {
            NmtCommandCmd::Start => self.nmt_state = NmtState::Operational,
            NmtCommandCmd::Stop => self.nmt_state = NmtState::Stopped,
            NmtCommandCmd::EnterPreOp => self.nmt_state = NmtState::PreOperational,
            NmtCommandCmd::ResetApp | NmtCommandCmd::ResetComm => {
                if cmd == NmtCommandCmd::ResetApp {
                    self.state = DriveState::SwitchOnDisabled;
                    self.controlword = 0;
                    self.mode = 0;
                    self.move_until = None;
                    self.homing_until = None;
                }
                self.node_id = self.pending_node_id;
                self.load_pdo_defaults();
                self.nmt_state = NmtState::PreOperational;
                self.sdo = SdoState::Idle;
                self.lss_state = LssState::Waiting;
                if self.node_id != UNCONFIGURED {
                    return Some(
                        Heartbeat {
                            node: self.node_id,
                            toggle: false,
                            state: NmtState::Bootup,
                        }
                        .into(),
                    );
                }
            }
        }
        None
    }

    /// Process one received frame and return the frames sent in response
    pub fn handle_frame(&mut self, msg: CanMessage, now: Instant) -> Vec<CanMessage> {
        self.update(now);
        let Ok(parsed) = DriveMessage::try_from(msg) else {
            return Vec::new();
        };
        let own_id = self.node_id;
        let addressed = move |node: u8| node == own_id && node != UNCONFIGURED;
        match parsed {
            DriveMessage::NmtCommand(cmd) if cmd.node == 0 || addressed(cmd.node) => {
                self.handle_nmt(cmd.cmd).into_iter().collect()
            }
            DriveMessage::SdoRequest { node, req } if addressed(node) => self
                .handle_sdo(req, now)
                .map(|resp| resp.to_can_message(CanId::std(SDO_RESP_BASE + self.node_id as u16)))
                .into_iter()
                .collect(),
            DriveMessage::LssRequest(req) => {
                self.handle_lss(req).map(CanMessage::from).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// The enabled TPDOs, built from the current object values
    pub fn tpdo_frames(&mut self, now: Instant) -> Vec<CanMessage> {
        self.update(now);
        if self.nmt_state != NmtState::Operational || self.node_id == UNCONFIGURED {
            return Vec::new();
        }
        let mut frames = Vec::new();
        for n in 0..NUM_DEFAULT_PDOS as u16 {
            let Ok(cob) = self.read_object(object_ids::TPDO_COMM_BASE + n, 1) else {
                continue;
            };
            let cob = read_u32(&cob);
            if cob & PDO_DISABLED != 0 {
                continue;
            }
            let map_index = object_ids::TPDO_MAP_BASE + n;
            let count = self
                .object(map_index, 0)
                .and_then(|d| d.first().copied())
                .unwrap_or(0);
            let mut data = Vec::new();
            for sub in 1..=count {
                let raw = read_u32(self.object(map_index, sub).unwrap_or(&[]));
                let (id, bits) = ObjectId::from_mapping(raw);
                let len = bits as usize / 8;
                let mut value = self.read_object(id.index, id.sub).unwrap_or_default();
                value.resize(len, 0);
                data.extend_from_slice(&value);
            }
            if data.len() > 8 {
                continue;
            }
            let id = if cob & (1 << 29) != 0 {
                CanId::extended(cob & 0x1FFF_FFFF)
            } else {
                CanId::std((cob & 0x7FF) as u16)
            };
            frames.push(CanMessage::new(id, &data));
        }
        frames
    }
}

/// A drive running on a [`SimBus`]
///
/// The drive task stops when the handle is dropped.
#[derive(Debug)]
pub struct SimDrive {
    model: Arc<Mutex<DriveModel>>,
    task: JoinHandle<()>,
}

impl SimDrive {
    pub fn spawn(bus: &SimBus, config: SimDriveConfig) -> Self {
        let tpdo_period = config.tpdo_period;
        let model = Arc::new(Mutex::new(DriveModel::new(config)));
        let (mut sender, mut receiver) = bus.new_pair();
        let task_model = model.clone();
        let task = tokio::spawn(async move {
            let mut tpdo_timer = tokio::time::interval(tpdo_period);
            tpdo_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let frames = tokio::select! {
                    msg = receiver.recv() => {
                        let Ok(msg) = msg else { break };
                        lock(&task_model).handle_frame(msg, Instant::now())
                    }
                    _ = tpdo_timer.tick() => lock(&task_model).tpdo_frames(Instant::now()),
                };
                for frame in frames {
                    let _ = sender.send(frame).await;
                }
            }
        });
        Self { model, task }
    }

    /// Access the drive's state
    pub fn model(&self) -> MutexGuard<'_, DriveModel> {
        lock(&self.model)
    }
}

impl Drop for SimDrive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(model: &Mutex<DriveModel>) -> MutexGuard<'_, DriveModel> {
    model.lock().unwrap_or_else(|e| e.into_inner())
}
