//! Homing and profile position sequences
//!
//! Both sequences hand a set-point to the drive by raising controlword bit 4 and watch
//! statusword bit 12 for the drive's answer. A [`MotionGuard`] owns the node for the duration of
//! the command and drops bit 4 again on every exit path.
use std::{sync::Arc, time::Duration};

use snafu::ResultExt;
use tokio::time::Instant;
use servocan_common::{
    cia402::{DriveState, HomingMethod, OperationMode, Statusword, CW_NEW_SETPOINT},
    constants::object_ids,
    traits::AsyncCanSender,
};

use crate::{drive::Drive, error::*, CancelToken};

/// Controlword keeping the drive enabled with the new set-point bit low
const CW_ENABLED: u16 = 0x0F;

/// Parameters of a homing run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingParams {
    /// Homing method (0x6098)
    pub method: HomingMethod,
    /// Home offset (0x607C)
    pub offset: Option<i32>,
    /// Search speed, written to both homing speeds (0x6099)
    pub speed: Option<u32>,
    /// Homing acceleration (0x609A)
    pub acceleration: Option<u32>,
}

impl HomingParams {
    /// Home with `method`, keeping the drive's other homing parameters
    pub fn new(method: HomingMethod) -> Self {
        Self {
            method,
            offset: None,
            speed: None,
            acceleration: None,
        }
    }
}

/// Profile parameters written before a move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileParams {
    /// Profile velocity (0x6081)
    pub velocity: u32,
    /// Profile acceleration and deceleration (0x6083, 0x6084)
    pub acceleration: u32,
    /// Profile jerk (0x60A4)
    pub jerk: u32,
}

impl ProfileParams {
    fn validate(&self) -> Result<(), Error> {
        for (parameter, value) in [
            ("velocity", self.velocity),
            ("acceleration", self.acceleration),
            ("jerk", self.jerk),
        ] {
            if value == 0 {
                return InvalidProfileSnafu { parameter }.fail();
            }
        }
        Ok(())
    }
}

/// Outcome of a completed motion command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionResult {
    /// The statusword which confirmed completion
    pub statusword: Statusword,
    /// Position actual value read after completion
    pub position: i32,
}

/// Last statusword of a wait
#[derive(Debug, Clone, Copy)]
enum Observed {
    Done(Statusword),
    Expired(Statusword),
}

/// Marks a drive busy with a motion command
///
/// While armed, controlword bit 4 may be high. [`release`](Self::release) lowers it, and
/// dropping an armed guard lowers it from a detached task.
#[derive(Debug)]
pub struct MotionGuard<S: AsyncCanSender + 'static> {
    drive: Arc<Drive<S>>,
    armed: bool,
}

impl<S: AsyncCanSender + 'static> MotionGuard<S> {
    /// Take the drive's motion slot, failing with `MotionInProgress` if it is taken
    pub fn acquire(drive: &Arc<Drive<S>>) -> Result<Self, Error> {
        if !drive.try_begin_motion() {
            return MotionInProgressSnafu {
                node_id: drive.node_id(),
            }
            .fail();
        }
        Ok(Self {
            drive: drive.clone(),
            armed: false,
        })
    }

    /// Raise controlword bit 4
    pub async fn set_new_setpoint(&mut self) -> Result<(), Error> {
        self.armed = true;
        self.drive
            .write_controlword(CW_ENABLED | CW_NEW_SETPOINT)
            .await
    }

    /// Lower controlword bit 4, if it was raised
    pub async fn clear_new_setpoint(&mut self) -> Result<(), Error> {
        if self.armed {
            self.drive.write_controlword(CW_ENABLED).await?;
            self.armed = false;
        }
        Ok(())
    }

    /// Lower bit 4 and free the motion slot
    pub async fn release(mut self) -> Result<(), Error> {
        self.clear_new_setpoint().await
    }
}

impl<S: AsyncCanSender + 'static> Drop for MotionGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            self.drive.end_motion();
            return;
        }
        let drive = self.drive.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = drive.write_controlword(CW_ENABLED).await {
                        log::error!(
                            "Node {}: failed to clear new set-point bit: {e}",
                            drive.node_id()
                        );
                    }
                    drive.end_motion();
                });
            }
            Err(_) => {
                log::error!(
                    "Node {}: motion dropped outside a runtime, new set-point bit left high",
                    drive.node_id()
                );
                drive.end_motion();
            }
        }
    }
}

/// Runs homing and profile position commands on one drive
#[derive(Debug)]
pub struct MotionSequencer<S: AsyncCanSender + 'static> {
    drive: Arc<Drive<S>>,
}

impl<S: AsyncCanSender + 'static> MotionSequencer<S> {
    /// Create a sequencer for `drive`
    pub fn new(drive: Arc<Drive<S>>) -> Self {
        Self { drive }
    }

    /// The drive this sequencer commands
    pub fn drive(&self) -> &Arc<Drive<S>> {
        &self.drive
    }

    /// Run a homing procedure
    ///
    /// Switches the drive to homing mode (leaving OPERATION ENABLED first if needed), writes the
    /// homing parameters, enables operation and starts homing. Fails with `HomingTimeout` if
    /// homing is not attained within `timeout`, and with `HomingFailed` if the drive reports a
    /// homing error.
    pub async fn home(
        &self,
        params: &HomingParams,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<MotionResult, Error> {
        let mut guard = MotionGuard::acquire(&self.drive)?;
        let deadline = Instant::now() + timeout;
        let result = self.run_homing(&mut guard, params, deadline, cancel).await;
        finish(guard, result).await
    }

    async fn run_homing(
        &self,
        guard: &mut MotionGuard<S>,
        params: &HomingParams,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<MotionResult, Error> {
        let drive = &self.drive;
        let node_id = drive.node_id();
        let statusword = self.check_not_faulted().await?;

        let mode = drive.read_operation_mode().await?;
        if mode != OperationMode::Homing as i8 {
            // The mode of operation is only changed while operation is disabled
            if statusword.state() == Some(DriveState::OperationEnabled) {
                drive
                    .transition_until(DriveState::SwitchedOn, deadline, cancel)
                    .await?;
            }
            drive
                .set_operation_mode(OperationMode::Homing, drive.settings().mode_confirm_timeout())
                .await?;
        }

        self.write_homing_params(params).await?;
        drive
            .transition_until(DriveState::OperationEnabled, deadline, cancel)
            .await?;

        log::info!("Node {node_id}: starting homing with method {}", params.method.0);
        guard.set_new_setpoint().await?;
        let since = std::time::Instant::now();

        // Bits 12 and 13 count once homing was seen in progress, or after the settle time
        let settled = Instant::now() + drive.settings().homing_settle();
        let mut started = false;
        let observed = self
            .wait_statusword(since, deadline, cancel, |statusword| {
                let finished = statusword.homing_attained() || statusword.homing_error();
                if !finished {
                    started = true;
                }
                finished && (started || Instant::now() >= settled)
            })
            .await?;
        let statusword = match observed {
            Observed::Done(statusword) if statusword.homing_error() => {
                return HomingFailedSnafu {
                    node_id,
                    statusword,
                }
                .fail();
            }
            Observed::Done(statusword) => statusword,
            Observed::Expired(statusword) => {
                return HomingTimeoutSnafu {
                    node_id,
                    statusword,
                }
                .fail();
            }
        };
        guard.clear_new_setpoint().await?;

        let position = drive.read_position().await?;
        log::info!("Node {node_id}: homing attained at {position}");
        Ok(MotionResult {
            statusword,
            position,
        })
    }

    async fn write_homing_params(&self, params: &HomingParams) -> Result<(), Error> {
        let drive = &self.drive;
        let mut sdo = drive.sdo_client().await;
        let context = SdoSnafu {
            node_id: drive.node_id(),
        };
        sdo.download_i8(object_ids::HOMING_METHOD, 0, params.method.0)
            .await
            .context(context)?;
        if let Some(offset) = params.offset {
            sdo.download_i32(object_ids::HOME_OFFSET, 0, offset)
                .await
                .context(context)?;
        }
        if let Some(speed) = params.speed {
            for sub in [1, 2] {
                sdo.download_u32(object_ids::HOMING_SPEEDS, sub, speed)
                    .await
                    .context(context)?;
            }
        }
        if let Some(acceleration) = params.acceleration {
            sdo.download_u32(object_ids::HOMING_ACCELERATION, 0, acceleration)
                .await
                .context(context)?;
        }
        Ok(())
    }

    /// Move to an absolute position in profile position mode
    ///
    /// The drive must be in OPERATION ENABLED with the profile position mode selected, see
    /// [`prepare_profile_position`](Self::prepare_profile_position). Returns the position read
    /// back after the target was reached.
    pub async fn move_to(
        &self,
        position: i32,
        profile: Option<&ProfileParams>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<MotionResult, Error> {
        if let Some(profile) = profile {
            profile.validate()?;
        }
        let mut guard = MotionGuard::acquire(&self.drive)?;
        let deadline = Instant::now() + timeout;
        let result = self
            .run_move(&mut guard, position, profile, deadline, cancel)
            .await;
        finish(guard, result).await
    }

    async fn run_move(
        &self,
        guard: &mut MotionGuard<S>,
        position: i32,
        profile: Option<&ProfileParams>,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<MotionResult, Error> {
        let drive = &self.drive;
        let node_id = drive.node_id();
        let statusword = self.check_not_faulted().await?;
        if statusword.state() != Some(DriveState::OperationEnabled) {
            return NotOperationalSnafu {
                node_id,
                statusword,
            }
            .fail();
        }
        let mode = drive.read_operation_mode().await?;
        if mode != OperationMode::TRAJECTORY as i8 {
            return WrongModeSnafu {
                node_id,
                expected: OperationMode::TRAJECTORY,
                actual: mode,
            }
            .fail();
        }

        {
            let mut sdo = drive.sdo_client().await;
            let context = SdoSnafu { node_id };
            if let Some(profile) = profile {
                sdo.download_u32(object_ids::PROFILE_VELOCITY, 0, profile.velocity)
                    .await
                    .context(context)?;
                sdo.download_u32(object_ids::PROFILE_ACCELERATION, 0, profile.acceleration)
                    .await
                    .context(context)?;
                sdo.download_u32(object_ids::PROFILE_DECELERATION, 0, profile.acceleration)
                    .await
                    .context(context)?;
                sdo.download_u32(object_ids::PROFILE_JERK, 1, profile.jerk)
                    .await
                    .context(context)?;
            }
            log::info!("Node {node_id}: moving to {position}");
            sdo.download_i32(object_ids::TARGET_POSITION, 0, position)
                .await
                .context(context)?;
        }

        guard.set_new_setpoint().await?;
        let since = std::time::Instant::now();
        let ack_timeout = drive.settings().setpoint_ack_timeout();
        let ack_deadline = deadline.min(Instant::now() + ack_timeout);
        let observed = self
            .wait_statusword(since, ack_deadline, cancel, |statusword| {
                statusword.setpoint_acknowledged()
            })
            .await?;
        if let Observed::Expired(statusword) = observed {
            return SetpointRejectedSnafu {
                node_id,
                statusword,
            }
            .fail();
        }

        // Target reached only belongs to this set-point once the drive has dropped bit 12
        guard.clear_new_setpoint().await?;
        let since = std::time::Instant::now();
        let release_deadline = deadline.min(Instant::now() + ack_timeout);
        let observed = self
            .wait_statusword(since, release_deadline, cancel, |statusword| {
                !statusword.setpoint_acknowledged()
            })
            .await?;
        if let Observed::Expired(statusword) = observed {
            return MotionTimeoutSnafu {
                node_id,
                target: position,
                statusword,
            }
            .fail();
        }

        let statusword = match self
            .wait_statusword(since, deadline, cancel, |statusword| {
                statusword.target_reached()
            })
            .await?
        {
            Observed::Done(statusword) => statusword,
            Observed::Expired(statusword) => {
                return MotionTimeoutSnafu {
                    node_id,
                    target: position,
                    statusword,
                }
                .fail();
            }
        };

        let position = drive.read_position().await?;
        log::info!("Node {node_id}: target reached at {position}");
        Ok(MotionResult {
            statusword,
            position,
        })
    }

    /// Select profile position mode with the given position window and enable operation
    ///
    /// `window` is the position window (0x6067) in position units, `window_time` the time the
    /// position must stay inside it (0x6068) in ms.
    pub async fn prepare_profile_position(
        &self,
        window: u32,
        window_time: u16,
        timeout: Duration,
    ) -> Result<Statusword, Error> {
        let drive = &self.drive;
        let deadline = Instant::now() + timeout;
        let cancel = CancelToken::new();
        let statusword = self.check_not_faulted().await?;
        if statusword.state() != Some(DriveState::SwitchedOn) {
            drive
                .transition_until(DriveState::SwitchedOn, deadline, &cancel)
                .await?;
        }
        drive
            .set_operation_mode(OperationMode::TRAJECTORY, drive.settings().mode_confirm_timeout())
            .await?;
        {
            let mut sdo = drive.sdo_client().await;
            let context = SdoSnafu {
                node_id: drive.node_id(),
            };
            sdo.download_u32(object_ids::POSITION_WINDOW, 0, window)
                .await
                .context(context)?;
            sdo.download_u16(object_ids::POSITION_WINDOW_TIME, 0, window_time)
                .await
                .context(context)?;
        }
        drive
            .transition_until(DriveState::OperationEnabled, deadline, &cancel)
            .await
    }

    /// Observe the statusword until `done` accepts it or `deadline` passes
    ///
    /// Only statuswords received after `since` are considered. Fails with `DriveFaulted` as soon
    /// as the drive reports a fault.
    async fn wait_statusword(
        &self,
        since: std::time::Instant,
        deadline: Instant,
        cancel: &CancelToken,
        mut done: impl FnMut(Statusword) -> bool,
    ) -> Result<Observed, Error> {
        let drive = &self.drive;
        loop {
            let statusword = drive.observe_statusword(Some(since)).await?;
            if statusword.state().is_some_and(|s| s.is_fault()) {
                return DriveFaultedSnafu {
                    node_id: drive.node_id(),
                    statusword,
                }
                .fail();
            }
            if done(statusword) {
                return Ok(Observed::Done(statusword));
            }
            if Instant::now() >= deadline {
                return Ok(Observed::Expired(statusword));
            }
            drive.poll_delay(cancel).await?;
        }
    }

    /// Fail with `DriveFaulted` when the drive reports a fault
    async fn check_not_faulted(&self) -> Result<Statusword, Error> {
        let statusword = self.drive.observe_statusword(None).await?;
        if statusword.state().is_some_and(|s| s.is_fault()) {
            return DriveFaultedSnafu {
                node_id: self.drive.node_id(),
                statusword,
            }
            .fail();
        }
        Ok(statusword)
    }
}

/// Release the guard, keeping the command's error if both fail
async fn finish<S: AsyncCanSender + 'static>(
    guard: MotionGuard<S>,
    result: Result<MotionResult, Error>,
) -> Result<MotionResult, Error> {
    let node_id = guard.drive.node_id();
    match (result, guard.release().await) {
        (Ok(result), Ok(())) => Ok(result),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            log::error!("Node {node_id}: failed to clear new set-point bit: {release_err}");
            Err(e)
        }
    }
}
