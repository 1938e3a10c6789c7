use std::time::{Duration, Instant};

use integration_tests::sim_drive::SimDriveConfig;
use servocan_client::{
    common::{messages::NmtState, NodeId},
    Error,
};

mod utils;
use utils::{setup, BusLogger};

const UNCONFIGURED: u8 = NodeId::UNCONFIGURED_RAW;

#[tokio::test]
#[serial_test::serial]
async fn test_assign_node_ids() {
    let serials = [0x40, 0x10, 0x30, 0x20];
    let bench = setup(
        serials
            .iter()
            .map(|serial| SimDriveConfig::new(UNCONFIGURED, *serial))
            .collect(),
    );

    let assigned = bench.network.assign_node_ids(32).await.unwrap();
    let ids: Vec<u8> = assigned.iter().map(|n| n.node_id).collect();
    assert_eq!(vec![32, 33, 34, 35], ids);
    // Fast scan finds the lowest identity first
    let found: Vec<u32> = assigned.iter().map(|n| n.identity.serial).collect();
    assert_eq!(vec![0x10, 0x20, 0x30, 0x40], found);

    for drive in &bench.drives {
        let model = drive.model();
        let expected = 32 + (model.object(0x1018, 4).unwrap()[0] / 0x10) - 1;
        assert_eq!(expected, model.node_id());
        assert_eq!(expected, model.stored_node_id());
        assert_eq!(NmtState::PreOperational, model.nmt_state());
    }

    assert_eq!(
        vec![32, 33, 34, 35],
        bench.network.configured_node_ids().await.unwrap()
    );

    let identity = bench.network.drive(34).unwrap().read_identity().await.unwrap();
    assert_eq!(0x30, identity.serial);
}

#[tokio::test]
#[serial_test::serial]
async fn test_assignment_reconfigures_existing_ids() {
    // Two drives from the factory with the same node ID
    let bench = setup(vec![SimDriveConfig::new(1, 7), SimDriveConfig::new(1, 3)]);
    let _logger = BusLogger::new(bench.bus.new_receiver());

    let assigned = bench.network.assign_node_ids(10).await.unwrap();
    assert_eq!(2, assigned.len());
    assert_eq!(11, bench.drives[0].model().node_id());
    assert_eq!(10, bench.drives[1].model().node_id());
}

#[tokio::test]
#[serial_test::serial]
async fn test_assign_without_drives() {
    let bench = setup(vec![]);

    let assigned = bench.network.assign_node_ids(32).await.unwrap();
    assert!(assigned.is_empty());
    assert!(bench.network.configured_node_ids().await.unwrap().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn test_assign_rejects_invalid_base() {
    let bench = setup(vec![SimDriveConfig::new(UNCONFIGURED, 1)]);

    let err = bench.network.assign_node_ids(0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidNodeId { value: 0 }), "{err:?}");
    assert_eq!(UNCONFIGURED, bench.drives[0].model().pending_node_id());
}

#[tokio::test]
#[serial_test::serial]
async fn test_change_node_id() {
    let bench = setup(vec![SimDriveConfig::new(32, 0xAA), SimDriveConfig::new(33, 0xBB)]);

    let identity = bench.network.change_node_id(32, 40).await.unwrap();
    assert_eq!(0xAA, identity.serial);
    {
        let model = bench.drives[0].model();
        assert_eq!(40, model.node_id());
        assert_eq!(40, model.stored_node_id());
    }
    assert_eq!(33, bench.drives[1].model().node_id());

    assert_eq!(
        vec![33, 40],
        bench.network.configured_node_ids().await.unwrap()
    );
    let identity = bench.network.drive(40).unwrap().read_identity().await.unwrap();
    assert_eq!(0xAA, identity.serial);
}

#[tokio::test]
#[serial_test::serial]
async fn test_change_node_id_of_missing_drive() {
    let bench = setup(vec![SimDriveConfig::new(32, 0xAA)]);

    let err = bench.network.change_node_id(50, 40).await.unwrap_err();
    assert!(err.is_sdo_timeout(), "{err:?}");
    assert_eq!(32, bench.drives[0].model().node_id());

    let err = bench.network.change_node_id(32, 200).await.unwrap_err();
    assert!(matches!(err, Error::InvalidNodeId { value: 200 }), "{err:?}");
    assert_eq!(32, bench.drives[0].model().node_id());
}

#[tokio::test]
#[serial_test::serial]
async fn test_bootup_and_node_list() {
    let bench = setup(vec![SimDriveConfig::new(32, 1), SimDriveConfig::new(33, 2)]);
    let network = &bench.network;

    let since = Instant::now();
    network.nmt_reset_app(0).await.unwrap();
    network
        .wait_for_bootup(32, since, Duration::from_secs(1))
        .await
        .unwrap();
    network
        .wait_for_bootup(33, since, Duration::from_secs(1))
        .await
        .unwrap();

    let nodes = network.node_list();
    let ids: Vec<u8> = nodes.iter().map(|n| n.node_id).collect();
    assert_eq!(vec![32, 33], ids);
    assert!(nodes.iter().all(|n| n.last_bootup.is_some()));

    // A boot-up from before `since` does not count
    let err = network
        .wait_for_bootup(32, Instant::now(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NodeUnreachable { node_id: 32 }), "{err:?}");
}

#[tokio::test]
#[serial_test::serial]
async fn test_nmt_commands() {
    let bench = setup(vec![SimDriveConfig::new(32, 1), SimDriveConfig::new(33, 2)]);
    let network = &bench.network;

    network.nmt_start(32).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(NmtState::Operational, bench.drives[0].model().nmt_state());
    assert_eq!(NmtState::PreOperational, bench.drives[1].model().nmt_state());

    network.nmt_stop(0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(NmtState::Stopped, bench.drives[0].model().nmt_state());
    assert_eq!(NmtState::Stopped, bench.drives[1].model().nmt_state());

    network.nmt_pre_operational(33).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(NmtState::PreOperational, bench.drives[1].model().nmt_state());

    let since = Instant::now();
    network.nmt_reset_comms(32).await.unwrap();
    network
        .wait_for_bootup(32, since, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(NmtState::PreOperational, bench.drives[0].model().nmt_state());
}
