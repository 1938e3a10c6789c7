use std::time::Duration;

use integration_tests::sim_drive::SimDriveConfig;
use servocan_client::{
    common::{cia402::DriveState, objects::ObjectId},
    Error, NodeConfig, PdoLayout,
};

mod utils;
use utils::setup;

const NODE: u8 = 32;

const CONFIG: &str = r#"
[[store]]
name = "Profile velocity"
value = 5000

[[store]]
name = "Homing speeds[1]"
value = 300

[[store]]
index = 0x6067
sub = 0
type = "u32"
value = 20

[tpdo.1]
enabled = true
cob = 0x2A0
transmission_type = 254
event_timer = 10
mappings = [
    { index = 0x6041, sub = 0, size = 16 },
]

[tpdo.2]
enabled = false
cob = 0x3A0
transmission_type = 254
mappings = []
"#;

#[tokio::test]
#[serial_test::serial]
async fn test_apply_config() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let config = NodeConfig::load_from_str(CONFIG).unwrap();

    bench.network.apply_config(NODE, &config).await.unwrap();

    let model = bench.drives[0].model();
    assert_eq!(Some(&5000u32.to_le_bytes()[..]), model.object(0x6081, 0));
    assert_eq!(Some(&300u32.to_le_bytes()[..]), model.object(0x6099, 1));
    assert_eq!(Some(&20u32.to_le_bytes()[..]), model.object(0x6067, 0));

    assert_eq!(Some(&0x2A0u32.to_le_bytes()[..]), model.object(0x1801, 1));
    assert_eq!(Some(&[254u8][..]), model.object(0x1801, 2));
    assert_eq!(Some(&10u16.to_le_bytes()[..]), model.object(0x1801, 5));
    assert_eq!(Some(&[1u8][..]), model.object(0x1A01, 0));
    assert_eq!(
        Some(&ObjectId::new(0x6041, 0).to_mapping(16).to_le_bytes()[..]),
        model.object(0x1A01, 1)
    );

    let disabled = 0x3A0u32 | (1 << 31);
    assert_eq!(Some(&disabled.to_le_bytes()[..]), model.object(0x1802, 1));
    assert_eq!(Some(&[0u8][..]), model.object(0x1A02, 0));
}

#[tokio::test]
#[serial_test::serial]
async fn test_configured_tpdo_feeds_statusword() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    let config = NodeConfig::load_from_str(CONFIG).unwrap();
    network.apply_config(NODE, &config).await.unwrap();
    assert!(network.pdo_monitor().latest(NODE).is_none());

    network.nmt_start(NODE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = network.pdo_monitor().latest(NODE).unwrap();
    assert_eq!(Some(DriveState::SwitchOnDisabled), snapshot.statusword.state());
    assert_eq!(None, snapshot.position);
    assert_eq!(0, network.pdo_monitor().violations(NODE));

    // State changes are observed through the PDO as well
    network
        .transition_to(NODE, DriveState::OperationEnabled)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = network.pdo_monitor().latest(NODE).unwrap();
    assert_eq!(Some(DriveState::OperationEnabled), snapshot.statusword.state());
}

#[tokio::test]
#[serial_test::serial]
async fn test_extended_tpdo_cob_id() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    let config = NodeConfig::load_from_str(
        r#"
        [tpdo.0]
        enabled = false
        cob = 0x1A0
        transmission_type = 254
        mappings = []

        [tpdo.1]
        enabled = true
        cob = 0x12345
        transmission_type = 254
        mappings = [
            { index = 0x6041, sub = 0, size = 16 },
            { index = 0x6064, sub = 0, size = 32 },
        ]
        "#,
    )
    .unwrap();
    network.apply_config(NODE, &config).await.unwrap();

    let raw = 0x12345u32 | (1 << 29);
    assert_eq!(
        Some(&raw.to_le_bytes()[..]),
        bench.drives[0].model().object(0x1801, 1)
    );

    network.nmt_start(NODE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = network.pdo_monitor().latest(NODE).unwrap();
    assert_eq!(Some(DriveState::SwitchOnDisabled), snapshot.statusword.state());
    assert_eq!(Some(0), snapshot.position);
    assert_eq!(0, network.pdo_monitor().violations(NODE));
}

#[tokio::test]
#[serial_test::serial]
async fn test_default_tpdo_drives_motion() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let network = &bench.network;
    network
        .pdo_monitor()
        .register(NODE, PdoLayout::default_tpdo1(NODE))
        .unwrap();
    network.nmt_start(NODE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = network.pdo_monitor().latest(NODE).unwrap();
    assert_eq!(Some(0), snapshot.position);

    network.prepare_profile_position(NODE, 10, 5).await.unwrap();
    assert_eq!(
        -750,
        network
            .move_to(NODE, -750, Duration::from_secs(2))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        Some(-750),
        network.pdo_monitor().latest(NODE).unwrap().position
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_unknown_store_name() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let config = NodeConfig::load_from_str(
        r#"
        [[store]]
        name = "Warp factor"
        value = 9
        "#,
    )
    .unwrap();

    let err = bench.network.apply_config(NODE, &config).await.unwrap_err();
    assert!(matches!(err, Error::UnknownObject { .. }), "{err:?}");
}

#[tokio::test]
#[serial_test::serial]
async fn test_out_of_range_store() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let config = NodeConfig::load_from_str(
        r#"
        [[store]]
        name = "Position window time"
        value = 100000
        "#,
    )
    .unwrap();

    let err = bench.network.apply_config(NODE, &config).await.unwrap_err();
    assert!(matches!(err, Error::InvalidValue { .. }), "{err:?}");
    assert_eq!(
        Some(&0u16.to_le_bytes()[..]),
        bench.drives[0].model().object(0x6068, 0)
    );
}
