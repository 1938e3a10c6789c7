//! Decoding of drive status broadcast in transmit PDOs
//!
//! Drives can be configured to broadcast their statusword and position in a TPDO. The monitor
//! keeps the latest decoded value per node, so state polling can skip an SDO round trip when a
//! fresh value is available.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use snafu::Snafu;
use tokio::task::JoinHandle;
use servocan_common::{
    cia402::Statusword,
    constants::object_ids,
    messages::default_tpdo_cob_id,
    objects::ObjectId,
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId, CanMessage,
};

use crate::{bus::FrameFilter, sdo_client::SdoClient, SdoClientError};

const STATUSWORD: ObjectId = ObjectId::new(object_ids::STATUSWORD, 0);
const POSITION_ACTUAL: ObjectId = ObjectId::new(object_ids::POSITION_ACTUAL_VALUE, 0);

/// Error decoding or building a PDO payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum PdoError {
    /// The frame length differs from the mapping's total size
    #[snafu(display("PDO protocol violation: mapping needs {expected} bytes, frame has {actual}"))]
    LengthMismatch {
        /// Size of the mapping in bytes
        expected: usize,
        /// Frame length
        actual: usize,
    },
    /// A mapped object is not a whole number of bytes
    #[snafu(display("Mapping of {id} has a size of {bits} bits"))]
    NotByteAligned {
        /// The mapped object
        id: ObjectId,
        /// Mapped size in bits
        bits: u8,
    },
    /// The mapping does not fit into a frame
    #[snafu(display("Mapping needs {len} bytes, more than a CAN frame holds"))]
    TooLong {
        /// Size of the mapping in bytes
        len: usize,
    },
    /// No value was supplied for a mapped object
    #[snafu(display("No value for mapped object {id}"))]
    MissingValue {
        /// The mapped object
        id: ObjectId,
    },
    /// The COB-ID is outside the TPDO identifier ranges the monitor listens to
    #[snafu(display("COB-ID {cob_id:?} is not in a TPDO range"))]
    CobIdOutOfRange {
        /// The COB-ID
        cob_id: CanId,
    },
}

/// The mapping of one PDO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoLayout {
    /// Identifier of the PDO frames
    pub cob_id: CanId,
    /// Mapped objects in payload order, with their size in bits
    pub mappings: Vec<(ObjectId, u8)>,
}

impl PdoLayout {
    /// Create a layout
    pub fn new(cob_id: CanId, mappings: Vec<(ObjectId, u8)>) -> Self {
        Self { cob_id, mappings }
    }

    /// Statusword followed by position actual value on the first TPDO of `node_id`
    pub fn default_tpdo1(node_id: u8) -> Self {
        Self::new(
            CanId::std(default_tpdo_cob_id(node_id, 0)),
            vec![(STATUSWORD, 16), (POSITION_ACTUAL, 32)],
        )
    }

    /// Total payload size in bytes
    pub fn byte_len(&self) -> Result<usize, PdoError> {
        let mut len = 0;
        for (id, bits) in &self.mappings {
            if bits % 8 != 0 {
                return NotByteAlignedSnafu {
                    id: *id,
                    bits: *bits,
                }
                .fail();
            }
            len += *bits as usize / 8;
        }
        if len > 8 {
            return TooLongSnafu { len }.fail();
        }
        Ok(len)
    }

    /// Split a payload into the raw little endian bytes of each mapped object
    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<Vec<(ObjectId, &'a [u8])>, PdoError> {
        let expected = self.byte_len()?;
        if data.len() != expected {
            return LengthMismatchSnafu {
                expected,
                actual: data.len(),
            }
            .fail();
        }
        let mut offset = 0;
        let mut values = Vec::with_capacity(self.mappings.len());
        for (id, bits) in &self.mappings {
            let size = *bits as usize / 8;
            values.push((*id, &data[offset..offset + size]));
            offset += size;
        }
        Ok(values)
    }

    /// Build a payload, looking up the raw value of each mapped object
    ///
    /// Values longer than the mapped size are truncated to it, shorter ones are zero extended.
    pub fn encode(
        &self,
        mut lookup: impl FnMut(ObjectId) -> Option<Vec<u8>>,
    ) -> Result<Vec<u8>, PdoError> {
        let len = self.byte_len()?;
        let mut data = Vec::with_capacity(len);
        for (id, bits) in &self.mappings {
            let size = *bits as usize / 8;
            let mut value = lookup(*id).ok_or(PdoError::MissingValue { id: *id })?;
            value.resize(size, 0);
            data.extend_from_slice(&value);
        }
        Ok(data)
    }
}

/// The most recent statusword broadcast by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatuswordSnapshot {
    /// The statusword
    pub statusword: Statusword,
    /// Position actual value, if mapped in the same PDO
    pub position: Option<i32>,
    /// When the frame was received
    pub received: Instant,
}

#[derive(Debug, Default)]
struct MonitorState {
    layouts: HashMap<CanId, (u8, PdoLayout)>,
    latest: HashMap<u8, StatuswordSnapshot>,
    violations: HashMap<u8, u64>,
}

impl MonitorState {
    fn handle_frame(&mut self, msg: CanMessage) {
        let Some((node_id, layout)) = self.layouts.get(&msg.id()) else {
            return;
        };
        let node_id = *node_id;
        let values = match layout.decode(msg.data()) {
            Ok(values) => values,
            Err(e) => {
                log::warn!("Node {node_id}: {e}");
                *self.violations.entry(node_id).or_default() += 1;
                return;
            }
        };
        let mut statusword = None;
        let mut position = None;
        for (id, raw) in values {
            if id == STATUSWORD && raw.len() == 2 {
                statusword = Some(Statusword(u16::from_le_bytes([raw[0], raw[1]])));
            } else if id == POSITION_ACTUAL && raw.len() == 4 {
                position = Some(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
            }
        }
        if let Some(statusword) = statusword {
            self.latest.insert(
                node_id,
                StatuswordSnapshot {
                    statusword,
                    position,
                    received: Instant::now(),
                },
            );
        }
    }
}

fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Background decoder of TPDO frames
#[derive(Debug)]
pub struct PdoMonitor {
    state: Arc<Mutex<MonitorState>>,
    task: JoinHandle<()>,
}

impl PdoMonitor {
    /// Start monitoring frames from `receiver`
    ///
    /// The receiver should deliver the TPDO identifier ranges, e.g. a shared receiver channel
    /// with [`FrameFilter::Tpdo`]. Must be called from within a tokio runtime.
    pub fn new<R: AsyncCanReceiver + 'static>(mut receiver: R) -> Self {
        let state = Arc::new(Mutex::new(MonitorState::default()));
        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(msg) => lock(&state).handle_frame(msg),
                        Err(e) => {
                            log::error!("PDO monitor receive failed: {e}");
                            break;
                        }
                    }
                }
            })
        };
        Self { state, task }
    }

    /// Decode frames matching `layout` as status of `node_id`
    ///
    /// Replaces any layout previously registered on the same COB-ID.
    pub fn register(&self, node_id: u8, layout: PdoLayout) -> Result<(), PdoError> {
        if !FrameFilter::Tpdo.matches(layout.cob_id) {
            return CobIdOutOfRangeSnafu {
                cob_id: layout.cob_id,
            }
            .fail();
        }
        layout.byte_len()?;
        log::debug!(
            "Node {node_id}: monitoring PDO {:?} with {} mapped objects",
            layout.cob_id,
            layout.mappings.len()
        );
        lock(&self.state)
            .layouts
            .insert(layout.cob_id, (node_id, layout));
        Ok(())
    }

    /// Stop decoding frames of a layout
    pub fn unregister(&self, cob_id: CanId) {
        lock(&self.state).layouts.remove(&cob_id);
    }

    /// The most recent statusword received from `node_id`, if any
    pub fn latest(&self, node_id: u8) -> Option<StatuswordSnapshot> {
        lock(&self.state).latest.get(&node_id).copied()
    }

    /// Number of frames from `node_id` which did not match their layout
    pub fn violations(&self, node_id: u8) -> u64 {
        lock(&self.state)
            .violations
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for PdoMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The identifier of a PDO communication parameter value (sub 1)
///
/// Bit 29 selects a 29-bit identifier. Bits 30 and 31 are ignored.
pub fn cob_id_from_raw(raw: u32) -> CanId {
    if raw & (1 << 29) != 0 {
        CanId::extended(raw & 0x1FFF_FFFF)
    } else {
        CanId::std((raw & 0x7FF) as u16)
    }
}

/// Read the COB-ID and mapping of TPDO `n` (0 based) from a device
pub async fn read_tpdo_layout<S: AsyncCanSender, R: AsyncCanReceiver>(
    sdo: &mut SdoClient<S, R>,
    n: u8,
) -> Result<PdoLayout, SdoClientError> {
    let comm_index = object_ids::TPDO_COMM_BASE + n as u16;
    let map_index = object_ids::TPDO_MAP_BASE + n as u16;
    let cob_id = cob_id_from_raw(sdo.upload_u32(comm_index, 1).await?);
    let count = sdo.upload_u8(map_index, 0).await?;
    let mut mappings = Vec::with_capacity(count as usize);
    for i in 0..count {
        let raw = sdo.upload_u32(map_index, i + 1).await?;
        mappings.push(ObjectId::from_mapping(raw));
    }
    Ok(PdoLayout::new(cob_id, mappings))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug, Snafu)]
    struct Closed;

    struct ChannelReceiver {
        rx: mpsc::UnboundedReceiver<CanMessage>,
    }

    impl AsyncCanReceiver for ChannelReceiver {
        type Error = Closed;

        fn try_recv(&mut self) -> Result<Option<CanMessage>, Closed> {
            Ok(self.rx.try_recv().ok())
        }

        async fn recv(&mut self) -> Result<CanMessage, Closed> {
            self.rx.recv().await.ok_or(Closed)
        }
    }

    #[test]
    fn test_layout_decode() {
        let layout = PdoLayout::default_tpdo1(32);
        assert_eq!(CanId::std(0x1A0), layout.cob_id);
        let data = [0x37, 0x16, 0x10, 0x27, 0x00, 0x00];
        let values = layout.decode(&data).unwrap();
        assert_eq!((STATUSWORD, &data[0..2]), values[0]);
        assert_eq!((POSITION_ACTUAL, &data[2..6]), values[1]);

        assert_eq!(
            Err(PdoError::LengthMismatch {
                expected: 6,
                actual: 2
            }),
            layout.decode(&data[0..2])
        );
    }

    #[test]
    fn test_layout_encode() {
        let layout = PdoLayout::default_tpdo1(32);
        let data = layout
            .encode(|id| match id {
                STATUSWORD => Some(0x1637u16.to_le_bytes().to_vec()),
                POSITION_ACTUAL => Some((-5i32).to_le_bytes().to_vec()),
                _ => None,
            })
            .unwrap();
        assert_eq!(vec![0x37, 0x16, 0xFB, 0xFF, 0xFF, 0xFF], data);
        assert_eq!(
            Err(PdoError::MissingValue { id: POSITION_ACTUAL }),
            layout.encode(|id| (id == STATUSWORD).then(|| vec![0, 0]))
        );
    }

    #[tokio::test]
    async fn test_monitor_latest_and_violations() {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = PdoMonitor::new(ChannelReceiver { rx });
        monitor.register(32, PdoLayout::default_tpdo1(32)).unwrap();
        assert!(monitor.latest(32).is_none());

        tx.send(CanMessage::new(
            CanId::std(0x1A0),
            &[0x37, 0x16, 0x10, 0x27, 0x00, 0x00],
        ))
        .unwrap();
        tx.send(CanMessage::new(CanId::std(0x1A0), &[0x37])).unwrap();
        // Unregistered node
        tx.send(CanMessage::new(CanId::std(0x1A1), &[0x37, 0x16])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = monitor.latest(32).unwrap();
        assert_eq!(Statusword(0x1637), snapshot.statusword);
        assert_eq!(Some(10000), snapshot.position);
        assert_eq!(1, monitor.violations(32));
        assert!(monitor.latest(33).is_none());
    }

    #[test]
    fn test_cob_id_from_raw() {
        assert_eq!(CanId::std(0x1A0), cob_id_from_raw(0x1A0));
        assert_eq!(CanId::std(0x1A0), cob_id_from_raw(0x8000_01A0));
        assert_eq!(CanId::extended(0x1_2345), cob_id_from_raw(0x2001_2345));
        assert_eq!(CanId::extended(0x1_2345), cob_id_from_raw(0xA001_2345));
    }

    #[tokio::test]
    async fn test_extended_cob_id() {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = PdoMonitor::new(ChannelReceiver { rx });
        let layout = PdoLayout::new(CanId::extended(0x1_2345), vec![(STATUSWORD, 16)]);
        monitor.register(32, layout).unwrap();

        // Same low bits, standard frame
        tx.send(CanMessage::new(CanId::std(0x345), &[0x37, 0x02])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.latest(32).is_none());

        tx.send(CanMessage::new(CanId::extended(0x1_2345), &[0x37, 0x16])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Statusword(0x1637), monitor.latest(32).unwrap().statusword);
    }

    #[tokio::test]
    async fn test_register_rejects_rpdo_range() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let monitor = PdoMonitor::new(ChannelReceiver { rx });
        let layout = PdoLayout::new(CanId::std(0x220), vec![(STATUSWORD, 16)]);
        assert!(matches!(
            monitor.register(32, layout),
            Err(PdoError::CobIdOutOfRange { .. })
        ));
    }
}
