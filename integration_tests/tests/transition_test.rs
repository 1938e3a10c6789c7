use integration_tests::sim_drive::SimDriveConfig;
use servocan_client::{common::cia402::DriveState, Error};

mod utils;
use utils::{setup, BusLogger};

const NODE: u8 = 32;

#[tokio::test]
#[serial_test::serial]
async fn test_enable_operation() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let _logger = BusLogger::new(bench.bus.new_receiver());

    let sw = bench
        .network
        .transition_to(NODE, DriveState::OperationEnabled)
        .await
        .unwrap();
    assert_eq!(Some(DriveState::OperationEnabled), sw.state());
    let model = bench.drives[0].model();
    assert_eq!(DriveState::OperationEnabled, model.state());
    assert_eq!(&[0x06, 0x07, 0x0F], model.controlwords());
}

#[tokio::test]
#[serial_test::serial]
async fn test_transition_table() {
    use DriveState::*;
    #[rustfmt::skip]
    let table: &[(DriveState, DriveState, &[u16])] = &[
        (SwitchOnDisabled, SwitchOnDisabled, &[]),
        (SwitchOnDisabled, ReadyToSwitchOn, &[0x06]),
        (SwitchOnDisabled, SwitchedOn, &[0x06, 0x07]),
        (SwitchOnDisabled, OperationEnabled, &[0x06, 0x07, 0x0F]),
        (SwitchOnDisabled, QuickStopActive, &[0x06, 0x07, 0x0F, 0x02]),
        (ReadyToSwitchOn, SwitchOnDisabled, &[0x00]),
        (ReadyToSwitchOn, ReadyToSwitchOn, &[]),
        (ReadyToSwitchOn, SwitchedOn, &[0x07]),
        (ReadyToSwitchOn, OperationEnabled, &[0x07, 0x0F]),
        (ReadyToSwitchOn, QuickStopActive, &[0x07, 0x0F, 0x02]),
        (SwitchedOn, SwitchOnDisabled, &[0x00]),
        (SwitchedOn, ReadyToSwitchOn, &[0x06]),
        (SwitchedOn, SwitchedOn, &[]),
        (SwitchedOn, OperationEnabled, &[0x0F]),
        (SwitchedOn, QuickStopActive, &[0x0F, 0x02]),
        (OperationEnabled, SwitchOnDisabled, &[0x00]),
        (OperationEnabled, ReadyToSwitchOn, &[0x06]),
        (OperationEnabled, SwitchedOn, &[0x07]),
        (OperationEnabled, OperationEnabled, &[]),
        (OperationEnabled, QuickStopActive, &[0x02]),
        (QuickStopActive, SwitchOnDisabled, &[0x00]),
        (QuickStopActive, ReadyToSwitchOn, &[0x00, 0x06]),
        (QuickStopActive, SwitchedOn, &[0x0F, 0x07]),
        (QuickStopActive, OperationEnabled, &[0x0F]),
        (QuickStopActive, QuickStopActive, &[]),
    ];

    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    for (from, to, expected) in table {
        let written = {
            let mut model = bench.drives[0].model();
            model.force_state(*from);
            model.controlwords().len()
        };
        let sw = bench.network.transition_to(NODE, *to).await.unwrap();
        assert_eq!(Some(*to), sw.state(), "{from} -> {to}");

        let model = bench.drives[0].model();
        assert_eq!(*to, model.state(), "{from} -> {to}");
        assert_eq!(
            *expected,
            &model.controlwords()[written..],
            "{from} -> {to}"
        );
    }

    // States only the drive itself enters are refused without writing anything
    for from in [SwitchOnDisabled, SwitchedOn, OperationEnabled, QuickStopActive] {
        for to in [NotReadyToSwitchOn, Fault, FaultReactionActive] {
            let written = {
                let mut model = bench.drives[0].model();
                model.force_state(from);
                model.controlwords().len()
            };
            let err = bench.network.transition_to(NODE, to).await.unwrap_err();
            assert!(
                matches!(err, Error::InvalidTransition { node_id: NODE, from: f, to: t } if f == from && t == to),
                "{err:?}"
            );
            assert_eq!(written, bench.drives[0].model().controlwords().len());
        }
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_transition_to_current_state_sends_nothing() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    let sw = bench
        .network
        .transition_to(NODE, DriveState::SwitchOnDisabled)
        .await
        .unwrap();
    assert_eq!(Some(DriveState::SwitchOnDisabled), sw.state());
    assert!(bench.drives[0].model().controlwords().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn test_disable_from_operation_enabled() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    bench
        .network
        .transition_to(NODE, DriveState::OperationEnabled)
        .await
        .unwrap();
    bench
        .network
        .transition_to(NODE, DriveState::SwitchedOn)
        .await
        .unwrap();
    assert_eq!(DriveState::SwitchedOn, bench.drives[0].model().state());

    bench
        .network
        .transition_to(NODE, DriveState::SwitchOnDisabled)
        .await
        .unwrap();
    assert_eq!(DriveState::SwitchOnDisabled, bench.drives[0].model().state());
}

#[tokio::test]
#[serial_test::serial]
async fn test_fault_requires_reset() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    bench
        .network
        .transition_to(NODE, DriveState::OperationEnabled)
        .await
        .unwrap();
    bench.drives[0].model().inject_fault();

    let err = bench
        .network
        .transition_to(NODE, DriveState::OperationEnabled)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DriveFaulted { node_id: NODE, .. }), "{err:?}");

    let sw = bench.network.fault_reset(NODE).await.unwrap();
    assert_eq!(Some(DriveState::SwitchOnDisabled), sw.state());
    assert!(bench.drives[0]
        .model()
        .controlwords()
        .ends_with(&[0x00, 0x80, 0x00]));

    bench
        .network
        .transition_to(NODE, DriveState::OperationEnabled)
        .await
        .unwrap();
}

#[tokio::test]
#[serial_test::serial]
async fn test_fault_reset_without_fault() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    let sw = bench.network.fault_reset(NODE).await.unwrap();
    assert_eq!(Some(DriveState::SwitchOnDisabled), sw.state());
    assert!(bench.drives[0].model().controlwords().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn test_fault_is_not_a_valid_target() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    let err = bench
        .network
        .transition_to(NODE, DriveState::Fault)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::InvalidTransition {
                node_id: NODE,
                from: DriveState::SwitchOnDisabled,
                to: DriveState::Fault
            }
        ),
        "{err:?}"
    );
    assert!(bench.drives[0].model().controlwords().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn test_missing_drive_times_out() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    let err = bench
        .network
        .transition_to(NODE + 1, DriveState::OperationEnabled)
        .await
        .unwrap_err();
    assert!(err.is_sdo_timeout(), "{err:?}");
}

#[tokio::test]
#[serial_test::serial]
async fn test_invalid_node_id() {
    let bench = setup(vec![]);

    let err = bench.network.drive(0).unwrap_err();
    assert!(matches!(err, Error::InvalidNodeId { value: 0 }));
    let err = bench.network.drive(128).unwrap_err();
    assert!(matches!(err, Error::InvalidNodeId { value: 128 }));
}
