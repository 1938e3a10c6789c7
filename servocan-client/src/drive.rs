//! Per node drive handle and the CiA 402 state machine driver
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use snafu::ResultExt;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use servocan_common::{
    cia402::{
        plan_transition, DriveCommand, DriveState, OperationMode, Statusword, TransitionError,
    },
    constants::{object_ids, values},
    lss::LssIdentity,
    object_dict::{ObjectDictionary, ObjectEntry},
    traits::AsyncCanSender,
    value::ObjectValue,
};

use crate::{
    bus::{SharedReceiverChannel, SharedSender},
    error::*,
    pdo_monitor::PdoMonitor,
    sdo_client::SdoClient,
    settings::ClientSettings,
    CancelToken,
};

/// The SDO client type owned by a [`Drive`]
pub type DriveSdoClient<S> = SdoClient<SharedSender<S>, SharedReceiverChannel>;

/// Handle to one drive on the bus
///
/// Owns the node's SDO transaction slot, so concurrent callers on the same drive are serialized,
/// while different drives run independently. Also caches the last statusword read and the mode
/// of operation set through this handle.
#[derive(Debug)]
pub struct Drive<S: AsyncCanSender> {
    node_id: u8,
    sdo: Mutex<DriveSdoClient<S>>,
    od: Arc<ObjectDictionary>,
    pdo: Option<Arc<PdoMonitor>>,
    settings: ClientSettings,
    last_statusword: StdMutex<Option<Statusword>>,
    control_mode: StdMutex<Option<OperationMode>>,
    last_controlword: AtomicU16,
    motion_busy: AtomicBool,
}

impl<S: AsyncCanSender> Drive<S> {
    /// Create a drive handle
    ///
    /// `receiver` must deliver the SDO responses of `node_id`.
    pub fn new(
        node_id: u8,
        sender: SharedSender<S>,
        receiver: SharedReceiverChannel,
        od: Arc<ObjectDictionary>,
        pdo: Option<Arc<PdoMonitor>>,
        settings: ClientSettings,
    ) -> Self {
        let mut sdo = SdoClient::new_std(node_id, sender, receiver);
        sdo.set_timeout(settings.sdo_timeout());
        Self {
            node_id,
            sdo: Mutex::new(sdo),
            od,
            pdo,
            settings,
            last_statusword: StdMutex::new(None),
            control_mode: StdMutex::new(None),
            last_controlword: AtomicU16::new(0),
            motion_busy: AtomicBool::new(false),
        }
    }

    /// The node ID of the drive
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// The settings used by this handle
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// The object dictionary used to resolve names
    pub fn dictionary(&self) -> &ObjectDictionary {
        &self.od
    }

    /// Lock the drive's SDO client for direct access
    ///
    /// Other operations on this drive wait until the guard is dropped.
    pub async fn sdo_client(&self) -> MutexGuard<'_, DriveSdoClient<S>> {
        self.sdo.lock().await
    }

    /// Read an object by name
    pub async fn read(&self, name: &str) -> Result<ObjectValue, Error> {
        let entry = self.od.resolve(name).context(UnknownObjectSnafu)?;
        self.read_entry(entry).await
    }

    /// Read the object described by `entry`
    pub async fn read_entry(&self, entry: &ObjectEntry) -> Result<ObjectValue, Error> {
        if !entry.access_type.is_readable() {
            return AccessDeniedSnafu {
                name: entry.name.clone(),
                access: entry.access_type,
            }
            .fail();
        }
        let data = self.upload(entry.index, entry.sub).await?;
        ObjectValue::decode(entry.data_type, &data).context(InvalidValueSnafu {
            name: entry.name.clone(),
        })
    }

    /// Write an object by name
    ///
    /// The value is range checked against the object's data type before anything is sent.
    pub async fn configure(&self, name: &str, value: impl Into<ObjectValue>) -> Result<(), Error> {
        let entry = self.od.resolve(name).context(UnknownObjectSnafu)?;
        self.write_entry(entry, &value.into()).await
    }

    /// Write the object described by `entry`
    pub async fn write_entry(&self, entry: &ObjectEntry, value: &ObjectValue) -> Result<(), Error> {
        if !entry.access_type.is_writable() {
            return AccessDeniedSnafu {
                name: entry.name.clone(),
                access: entry.access_type,
            }
            .fail();
        }
        let data = value.encode(entry.data_type).context(InvalidValueSnafu {
            name: entry.name.clone(),
        })?;
        log::debug!("Node {}: {} <- {value}", self.node_id, entry.name);
        self.download(entry.index, entry.sub, &data).await
    }

    /// Raw SDO upload
    pub async fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>, Error> {
        self.sdo
            .lock()
            .await
            .upload(index, sub)
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })
    }

    /// Raw SDO download
    pub async fn download(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), Error> {
        self.sdo
            .lock()
            .await
            .download(index, sub, data)
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })
    }

    /// Read the statusword over SDO
    pub async fn read_statusword(&self) -> Result<Statusword, Error> {
        let raw = self
            .sdo
            .lock()
            .await
            .upload_u16(object_ids::STATUSWORD, 0)
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })?;
        let sw = Statusword(raw);
        self.cache_statusword(sw);
        Ok(sw)
    }

    /// Get a current statusword
    ///
    /// A PDO snapshot is used when it is younger than the configured maximum age, and was
    /// received after `since`. Otherwise the statusword is read over SDO, retrying timeouts.
    pub async fn observe_statusword(
        &self,
        since: Option<std::time::Instant>,
    ) -> Result<Statusword, Error> {
        if let Some(snapshot) = self.pdo.as_ref().and_then(|pdo| pdo.latest(self.node_id)) {
            let fresh = snapshot.received.elapsed() <= self.settings.pdo_max_age();
            let after = since.map_or(true, |since| snapshot.received >= since);
            if fresh && after {
                self.cache_statusword(snapshot.statusword);
                return Ok(snapshot.statusword);
            }
        }
        self.retry_read(move || self.read_statusword()).await
    }

    /// Read the statusword and decode the drive state
    pub async fn drive_state(&self) -> Result<DriveState, Error> {
        let statusword = self.observe_statusword(None).await?;
        statusword.state().ok_or(Error::InvalidStatusword {
            node_id: self.node_id,
            statusword,
        })
    }

    /// The statusword of the latest read, without touching the bus
    pub fn last_statusword(&self) -> Option<Statusword> {
        *lock(&self.last_statusword)
    }

    /// The mode of operation last confirmed through [`set_operation_mode`](Self::set_operation_mode)
    pub fn control_mode(&self) -> Option<OperationMode> {
        *lock(&self.control_mode)
    }

    /// The last value written to the controlword through this handle
    pub fn last_controlword(&self) -> u16 {
        self.last_controlword.load(Ordering::Relaxed)
    }

    /// Write the controlword
    ///
    /// Writes are never retried.
    pub async fn write_controlword(&self, controlword: u16) -> Result<(), Error> {
        log::trace!("Node {}: controlword <- 0x{controlword:04X}", self.node_id);
        self.sdo
            .lock()
            .await
            .download_u16(object_ids::CONTROLWORD, 0, controlword)
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })?;
        self.last_controlword.store(controlword, Ordering::Relaxed);
        Ok(())
    }

    /// Move the drive to `target` through the state machine
    ///
    /// Returns the statusword which confirmed the target state. Each intermediate state must be
    /// reached within the state transition timeout of the settings, and the whole sequence
    /// within `timeout`.
    pub async fn transition_to(
        &self,
        target: DriveState,
        timeout: Duration,
    ) -> Result<Statusword, Error> {
        self.transition_to_with_cancel(target, timeout, &CancelToken::new())
            .await
    }

    /// [`transition_to`](Self::transition_to), stopping early when `cancel` is triggered
    pub async fn transition_to_with_cancel(
        &self,
        target: DriveState,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Statusword, Error> {
        self.transition_until(target, Instant::now() + timeout, cancel)
            .await
    }

    pub(crate) async fn transition_until(
        &self,
        target: DriveState,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Statusword, Error> {
        let node_id = self.node_id;
        let mut statusword = self.observe_statusword(None).await?;
        let from = statusword.state().ok_or(Error::InvalidStatusword {
            node_id,
            statusword,
        })?;
        let plan = plan_transition(from, target).map_err(|e| match e {
            TransitionError::InvalidTarget { .. } => Error::InvalidTransition {
                node_id,
                from,
                to: target,
            },
            TransitionError::Faulted { .. } => Error::DriveFaulted {
                node_id,
                statusword,
            },
        })?;
        if plan.is_empty() {
            log::debug!("Node {node_id}: already in {target}");
            return Ok(statusword);
        }
        log::info!("Node {node_id}: {from} -> {target} in {} steps", plan.len());

        for step in plan {
            let since = std::time::Instant::now();
            if let Some(command) = step.command {
                log::debug!("Node {node_id}: {command:?} to reach {}", step.expected);
                self.write_controlword(command.controlword()).await?;
            }
            let step_deadline = deadline.min(Instant::now() + self.settings.state_transition_timeout());
            statusword = self
                .wait_for_state(step.expected, step_deadline, Some(since), cancel, true)
                .await?;
        }
        Ok(statusword)
    }

    /// Poll the statusword until the drive reports `expected`
    async fn wait_for_state(
        &self,
        expected: DriveState,
        deadline: Instant,
        since: Option<std::time::Instant>,
        cancel: &CancelToken,
        fail_on_fault: bool,
    ) -> Result<Statusword, Error> {
        loop {
            let statusword = self.observe_statusword(since).await?;
            match statusword.state() {
                Some(state) if state == expected => return Ok(statusword),
                Some(state) if fail_on_fault && state.is_fault() => {
                    return DriveFaultedSnafu {
                        node_id: self.node_id,
                        statusword,
                    }
                    .fail();
                }
                _ => (),
            }
            if Instant::now() >= deadline {
                return StateTransitionTimeoutSnafu {
                    node_id: self.node_id,
                    expected,
                    statusword,
                }
                .fail();
            }
            self.poll_delay(cancel).await?;
        }
    }

    /// Clear a fault
    ///
    /// Produces a rising edge on controlword bit 7 and waits for SWITCH ON DISABLED. Does nothing
    /// when the drive is not faulted.
    pub async fn fault_reset(&self, timeout: Duration) -> Result<Statusword, Error> {
        let deadline = Instant::now() + timeout;
        let statusword = self.observe_statusword(None).await?;
        if !statusword.state().is_some_and(|s| s.is_fault()) {
            log::debug!("Node {}: not faulted ({statusword})", self.node_id);
            return Ok(statusword);
        }
        log::info!("Node {}: resetting fault, {statusword}", self.node_id);
        self.write_controlword(DriveCommand::DisableVoltage.controlword())
            .await?;
        let since = std::time::Instant::now();
        self.write_controlword(DriveCommand::FaultReset.controlword())
            .await?;
        let statusword = self
            .wait_for_state(
                DriveState::SwitchOnDisabled,
                deadline,
                Some(since),
                &CancelToken::new(),
                false,
            )
            .await?;
        // Drop bit 7 again so the next reset is an edge too
        self.write_controlword(DriveCommand::DisableVoltage.controlword())
            .await?;
        Ok(statusword)
    }

    /// Read the mode of operation display (0x6061)
    pub async fn read_operation_mode(&self) -> Result<i8, Error> {
        self.retry_read(move || async move {
            self.sdo
                .lock()
                .await
                .upload_i8(object_ids::MODE_OF_OPERATION_DISPLAY, 0)
                .await
                .context(SdoSnafu {
                    node_id: self.node_id,
                })
        })
        .await
    }

    /// Select a mode of operation and wait until the drive reports it
    pub async fn set_operation_mode(
        &self,
        mode: OperationMode,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        self.sdo
            .lock()
            .await
            .download_i8(object_ids::MODE_OF_OPERATION, 0, mode as i8)
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })?;
        let cancel = CancelToken::new();
        loop {
            let actual = self.read_operation_mode().await?;
            if actual == mode as i8 {
                log::info!("Node {}: mode of operation {mode:?}", self.node_id);
                *lock(&self.control_mode) = Some(mode);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return WrongModeSnafu {
                    node_id: self.node_id,
                    expected: mode,
                    actual,
                }
                .fail();
            }
            self.poll_delay(&cancel).await?;
        }
    }

    /// Read the position actual value, retrying timeouts
    pub async fn read_position(&self) -> Result<i32, Error> {
        self.retry_read(move || async move {
            self.sdo
                .lock()
                .await
                .upload_i32(object_ids::POSITION_ACTUAL_VALUE, 0)
                .await
                .context(SdoSnafu {
                    node_id: self.node_id,
                })
        })
        .await
    }

    /// Make the drive store its parameters in non-volatile memory
    pub async fn save_parameters(&self) -> Result<(), Error> {
        log::info!("Node {}: saving parameters", self.node_id);
        self.sdo
            .lock()
            .await
            .download_u32(object_ids::SAVE_OBJECTS, 1, values::SAVE_CMD)
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })
    }

    /// Make the drive restore its default parameters
    ///
    /// The defaults become active after the next reset of the drive.
    pub async fn restore_defaults(&self) -> Result<(), Error> {
        log::info!("Node {}: restoring default parameters", self.node_id);
        self.sdo
            .lock()
            .await
            .download_u32(object_ids::RESTORE_DEFAULTS, 1, values::LOAD_CMD)
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })
    }

    /// Read the identity object
    pub async fn read_identity(&self) -> Result<LssIdentity, Error> {
        self.sdo
            .lock()
            .await
            .read_identity()
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })
    }

    /// Read the device name
    pub async fn read_device_name(&self) -> Result<String, Error> {
        self.sdo
            .lock()
            .await
            .read_device_name()
            .await
            .context(SdoSnafu {
                node_id: self.node_id,
            })
    }

    /// Mark the drive busy with a motion command
    ///
    /// Returns false if another motion command holds it.
    pub(crate) fn try_begin_motion(&self) -> bool {
        self.motion_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_motion(&self) {
        self.motion_busy.store(false, Ordering::Release);
    }

    /// Wait one poll interval, or fail when `cancel` is triggered
    pub(crate) async fn poll_delay(&self, cancel: &CancelToken) -> Result<(), Error> {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval()) => Ok(()),
            _ = cancel.cancelled() => CancelledSnafu { node_id: self.node_id }.fail(),
        }
    }

    /// Run an idempotent read, retrying SDO timeouts up to the configured number of times
    pub(crate) async fn retry_read<T, F, Fut>(&self, mut read: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;
        loop {
            match read().await {
                Err(e) if e.is_sdo_timeout() && attempt < self.settings.read_retries => {
                    attempt += 1;
                    log::warn!(
                        "Node {}: read timed out, retry {attempt}/{}",
                        self.node_id,
                        self.settings.read_retries
                    );
                }
                result => return result,
            }
        }
    }

    fn cache_statusword(&self, statusword: Statusword) {
        *lock(&self.last_statusword) = Some(statusword);
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
