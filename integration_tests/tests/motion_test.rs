use std::time::Duration;

use assertables::assert_contains;
use integration_tests::sim_drive::{SimDriveConfig, SimEvent};
use servocan_client::{
    common::cia402::{DriveState, HomingMethod, OperationMode},
    CancelToken, Error, HomingParams, ProfileParams,
};

mod utils;
use utils::{setup, BusLogger};

const NODE: u8 = 32;
const TIMEOUT: Duration = Duration::from_secs(2);

fn position_of(events: &[SimEvent], index: u16, data: &[u8]) -> usize {
    events
        .iter()
        .position(|e| matches!(e, SimEvent::Write { index: i, sub: 0, data: d } if *i == index && d == data))
        .unwrap_or_else(|| panic!("no write of {data:?} to 0x{index:04X}"))
}

#[tokio::test]
#[serial_test::serial]
async fn test_move_to_target() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let _logger = BusLogger::new(bench.bus.new_receiver());
    let network = &bench.network;

    let sw = network.prepare_profile_position(NODE, 10, 5).await.unwrap();
    assert_eq!(Some(DriveState::OperationEnabled), sw.state());
    assert_eq!(
        Some(OperationMode::ProfilePosition),
        network.drive(NODE).unwrap().control_mode()
    );

    let position = network.move_to(NODE, 10000, TIMEOUT).await.unwrap();
    assert_eq!(10000, position);

    let model = bench.drives[0].model();
    assert_eq!(10000, model.position());
    assert_eq!(Some(&10u32.to_le_bytes()[..]), model.object(0x6067, 0));
    assert_eq!(Some(&5u16.to_le_bytes()[..]), model.object(0x6068, 0));
    assert_contains!(model.controlwords(), &0x1F);
    assert_eq!(Some(&0x0F), model.controlwords().last());
}

#[tokio::test]
#[serial_test::serial]
async fn test_move_frame_order() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();
    let start = bench.drives[0].model().events().len();

    assert_eq!(3000, network.move_to(NODE, 3000, TIMEOUT).await.unwrap());

    let model = bench.drives[0].model();
    let events = &model.events()[start..];
    let target = position_of(events, 0x607A, &3000i32.to_le_bytes());
    let set = position_of(events, 0x6040, &[0x1F, 0x00]);
    let clear = position_of(events, 0x6040, &[0x0F, 0x00]);
    assert!(target < set, "{events:?}");
    assert!(set < clear, "{events:?}");

    // The set-point was acknowledged while bit 4 was high
    assert!(events[set..clear]
        .iter()
        .any(|e| matches!(e, SimEvent::StatuswordRead(sw) if sw & 0x1000 != 0)));
    // Target reached was only accepted after the clear, with bit 12 low
    let reached = events
        .iter()
        .rposition(|e| matches!(e, SimEvent::StatuswordRead(_)))
        .unwrap();
    assert!(clear < reached, "{events:?}");
    let SimEvent::StatuswordRead(sw) = events[reached] else {
        unreachable!()
    };
    assert_eq!(0x0400, sw & 0x1400);
    // Nothing but status reads after the target was written
    assert_eq!(
        3,
        events[target..]
            .iter()
            .filter(|e| matches!(e, SimEvent::Write { .. }))
            .count()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_move_waits_for_acknowledge_to_drop() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.motion_time = Duration::ZERO;
    config.status_lag = Duration::from_millis(100);
    let bench = setup(vec![config]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    let result = network
        .move_to_with_profile(NODE, 1200, None, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(1200, result.position);
    assert!(!result.statusword.setpoint_acknowledged());
    assert!(result.statusword.target_reached());
    assert_eq!(0, bench.drives[0].model().statusword() & 0x1000);
}

#[tokio::test]
#[serial_test::serial]
async fn test_back_to_back_moves_with_lagging_status() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.motion_time = Duration::from_millis(20);
    config.status_lag = Duration::from_millis(60);
    let bench = setup(vec![config]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    for target in [500, -500, 2000, 2001] {
        assert_eq!(target, network.move_to(NODE, target, TIMEOUT).await.unwrap());
        assert_eq!(target, bench.drives[0].model().position());
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_move_with_profile() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    let profile = ProfileParams {
        velocity: 1000,
        acceleration: 500,
        jerk: 20,
    };
    let result = network
        .move_to_with_profile(NODE, -2500, Some(&profile), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(-2500, result.position);
    assert!(result.statusword.target_reached());

    let model = bench.drives[0].model();
    assert_eq!(Some(&1000u32.to_le_bytes()[..]), model.object(0x6081, 0));
    assert_eq!(Some(&500u32.to_le_bytes()[..]), model.object(0x6083, 0));
    assert_eq!(Some(&500u32.to_le_bytes()[..]), model.object(0x6084, 0));
    assert_eq!(Some(&20u32.to_le_bytes()[..]), model.object(0x60A4, 1));
}

#[tokio::test]
#[serial_test::serial]
async fn test_invalid_profile_is_rejected_before_sending() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();
    let written = bench.drives[0].model().controlwords().len();

    let profile = ProfileParams {
        velocity: 0,
        acceleration: 500,
        jerk: 20,
    };
    let err = network
        .move_to_with_profile(NODE, 100, Some(&profile), TIMEOUT)
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::InvalidProfile { parameter: "velocity" }),
        "{err:?}"
    );
    assert_eq!(written, bench.drives[0].model().controlwords().len());
}

#[tokio::test]
#[serial_test::serial]
async fn test_unacknowledged_setpoint_clears_bit_4() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.never_ack = true;
    let bench = setup(vec![config]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    let err = network.move_to(NODE, 10000, TIMEOUT).await.unwrap_err();
    assert!(
        matches!(err, Error::SetpointRejected { node_id: NODE, .. }),
        "{err:?}"
    );
    {
        let model = bench.drives[0].model();
        let last = *model.controlwords().last().unwrap();
        assert_eq!(0, last & 0x10);
        assert_eq!(0, model.position());
    }

    // The motion slot was released, so the next command runs
    bench.drives[0].model().set_never_ack(false);
    assert_eq!(10000, network.move_to(NODE, 10000, TIMEOUT).await.unwrap());
}

#[tokio::test]
#[serial_test::serial]
async fn test_move_requires_operation_enabled() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    let err = bench
        .network
        .move_to(NODE, 10000, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotOperational { .. }), "{err:?}");
    assert!(bench.drives[0].model().controlwords().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn test_move_requires_profile_position_mode() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    bench
        .network
        .transition_to(NODE, DriveState::OperationEnabled)
        .await
        .unwrap();

    let err = bench
        .network
        .move_to(NODE, 10000, TIMEOUT)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::WrongMode {
                expected: OperationMode::ProfilePosition,
                actual: 0,
                ..
            }
        ),
        "{err:?}"
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_second_motion_command_is_refused() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    let (first, second) = tokio::join!(
        network.move_to(NODE, 500, TIMEOUT),
        network.move_to(NODE, 600, TIMEOUT),
    );
    assert_eq!(500, first.unwrap());
    let err = second.unwrap_err();
    assert!(
        matches!(err, Error::MotionInProgress { node_id: NODE }),
        "{err:?}"
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_cancelled_move_clears_bit_4() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.motion_time = Duration::from_secs(10);
    let bench = setup(vec![config]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    let sequencer = network.sequencer(NODE).unwrap();
    let cancel = CancelToken::new();
    let (result, _) = tokio::join!(sequencer.move_to(1000, None, TIMEOUT, &cancel), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Cancelled { node_id: NODE }), "{err:?}");
    assert_eq!(
        Some(&0x0F),
        bench.drives[0].model().controlwords().last()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_fault_during_move() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.motion_time = Duration::from_secs(10);
    let bench = setup(vec![config]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    let (result, _) = tokio::join!(network.move_to(NODE, 1000, TIMEOUT), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bench.drives[0].model().inject_fault();
    });
    let err = result.unwrap_err();
    assert!(matches!(err, Error::DriveFaulted { node_id: NODE, .. }), "{err:?}");
    assert_eq!(DriveState::Fault, bench.drives[0].model().state());
}

#[tokio::test]
#[serial_test::serial]
async fn test_move_timeout() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.motion_time = Duration::from_secs(10);
    let bench = setup(vec![config]);
    let network = &bench.network;
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();

    let err = network
        .move_to(NODE, 1000, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::MotionTimeout {
                node_id: NODE,
                target: 1000,
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(
        Some(&0x0F),
        bench.drives[0].model().controlwords().last()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_home_twice() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    let mut params = HomingParams::new(HomingMethod::CURRENT_POSITION);
    params.offset = Some(250);
    params.speed = Some(1000);

    let first = network.home(NODE, &params, TIMEOUT).await.unwrap();
    assert_eq!(250, first.position);
    assert!(first.statusword.homing_attained());

    let second = network.home(NODE, &params, TIMEOUT).await.unwrap();
    assert_eq!(first.position, second.position);

    let model = bench.drives[0].model();
    assert_eq!(OperationMode::Homing as i8, model.mode());
    assert_eq!(DriveState::OperationEnabled, model.state());
    assert_eq!(Some(&[37u8][..]), model.object(0x6098, 0));
    assert_eq!(Some(&1000u32.to_le_bytes()[..]), model.object(0x6099, 1));
    assert_eq!(Some(&1000u32.to_le_bytes()[..]), model.object(0x6099, 2));
    assert_eq!(Some(&0x0F), model.controlwords().last());
}

#[tokio::test]
#[serial_test::serial]
async fn test_home_again_with_lagging_status() {
    // The drive keeps showing the first run's homing attained for a while after the restart
    for homing_time in [Duration::from_millis(150), Duration::from_millis(20)] {
        let mut config = SimDriveConfig::new(NODE, 1);
        config.homing_time = homing_time;
        config.status_lag = Duration::from_millis(60);
        let bench = setup(vec![config]);
        let network = &bench.network;
        let mut params = HomingParams::new(HomingMethod::CURRENT_POSITION);

        params.offset = Some(100);
        let first = network.home(NODE, &params, TIMEOUT).await.unwrap();
        assert_eq!(100, first.position);

        params.offset = Some(-400);
        let second = network.home(NODE, &params, TIMEOUT).await.unwrap();
        assert_eq!(-400, second.position, "{homing_time:?}");
        assert_eq!(-400, bench.drives[0].model().position());
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_home_then_move() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;

    network
        .home(NODE, &HomingParams::new(HomingMethod::NEG_INDEX), TIMEOUT)
        .await
        .unwrap();
    network.prepare_profile_position(NODE, 10, 5).await.unwrap();
    assert_eq!(4000, network.move_to(NODE, 4000, TIMEOUT).await.unwrap());
}

#[tokio::test]
#[serial_test::serial]
async fn test_homing_error() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.homing_fails = true;
    let bench = setup(vec![config]);

    let err = bench
        .network
        .home(NODE, &HomingParams::new(HomingMethod::POS_INDEX), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HomingFailed { node_id: NODE, .. }), "{err:?}");
    assert_eq!(
        Some(&0x0F),
        bench.drives[0].model().controlwords().last()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_homing_timeout() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.homing_time = Duration::from_secs(10);
    let bench = setup(vec![config]);

    let err = bench
        .network
        .home(
            NODE,
            &HomingParams::new(HomingMethod::POS_INDEX),
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HomingTimeout { node_id: NODE, .. }), "{err:?}");
}
