use assertables::assert_contains;
use integration_tests::sim_drive::SimDriveConfig;
use servocan_client::{
    common::{sdo::AbortCode, value::ObjectValue},
    Error, ProtocolViolationKind, RawAbortCode, SdoClientError,
};

mod utils;
use utils::{setup, BusLogger};

const NODE: u8 = 32;

#[tokio::test]
#[serial_test::serial]
async fn test_configure_and_read_by_name() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let _logger = BusLogger::new(bench.bus.new_receiver());

    bench
        .network
        .configure(NODE, "Profile velocity", 5000u32)
        .await
        .unwrap();
    assert_eq!(
        Some(&5000u32.to_le_bytes()[..]),
        bench.drives[0].model().object(0x6081, 0)
    );
    let value = bench.network.read(NODE, "profile velocity").await.unwrap();
    assert_eq!(ObjectValue::U32(5000), value);

    bench
        .network
        .configure(NODE, "Homing speeds[2]", 77u32)
        .await
        .unwrap();
    assert_eq!(
        ObjectValue::U32(77),
        bench.network.read(NODE, "Homing speeds[2]").await.unwrap()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_segmented_upload_of_device_name() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.device_name = "XLA-5-LONG-DEVICE-NAME".into();
    let bench = setup(vec![config]);

    let value = bench
        .network
        .read(NODE, "Manufacturer device name")
        .await
        .unwrap();
    assert_eq!(Some("XLA-5-LONG-DEVICE-NAME"), value.as_str());
}

#[tokio::test]
#[serial_test::serial]
async fn test_identity_over_sdo() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 0xBEEF)]);

    let identity = bench.network.drive(NODE).unwrap().read_identity().await.unwrap();
    assert_eq!(0xBEEF, identity.serial);
    assert_eq!(
        ObjectValue::U32(0xBEEF),
        bench
            .network
            .read(NODE, "Identity Object.Serial number")
            .await
            .unwrap()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_local_checks_send_nothing() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let drive = bench.network.drive(NODE).unwrap();

    let err = bench
        .network
        .configure(NODE, "Flux capacitor", 1u32)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownObject { .. }), "{err:?}");

    let err = bench
        .network
        .configure(NODE, "Statusword", 1u32)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }), "{err:?}");

    let err = bench
        .network
        .configure(NODE, "Position window time", 70000u32)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValue { .. }), "{err:?}");
    assert_contains!(err.to_string(), "Position window time");

    // No SDO transfer was started by any of the above
    let sdo = drive.sdo_client().await;
    assert_eq!(0, sdo.sequence());
}

#[tokio::test]
#[serial_test::serial]
async fn test_abort_code_is_surfaced() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);
    let drive = bench.network.drive(NODE).unwrap();

    let err = drive.download(0x2000, 0, &[1, 2, 3, 4]).await.unwrap_err();
    match err {
        Error::Sdo {
            node_id: NODE,
            source:
                SdoClientError::AbortedByDevice {
                    index: 0x2000,
                    sub: 0,
                    code,
                },
        } => {
            assert_eq!(RawAbortCode::Valid(AbortCode::NoSuchObject), code);
            assert_eq!(0x0602_0000, code.raw());
        }
        e => panic!("Unexpected error {e:?}"),
    }

    let err = bench
        .network
        .configure(NODE, "Store Parameter Field[1]", 1234u32)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Sdo {
                source: SdoClientError::AbortedByDevice {
                    code: RawAbortCode::Valid(AbortCode::CantStore),
                    ..
                },
                ..
            }
        ),
        "{err:?}"
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_broken_toggle_is_a_protocol_violation() {
    let mut config = SimDriveConfig::new(NODE, 1);
    config.broken_toggle = true;
    let bench = setup(vec![config]);

    let err = bench
        .network
        .read(NODE, "Manufacturer device name")
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Sdo {
                source: SdoClientError::ProtocolViolation {
                    kind: ProtocolViolationKind::ToggleNotAlternated
                },
                ..
            }
        ),
        "{err:?}"
    );

    // Expedited transfers are unaffected
    bench
        .network
        .configure(NODE, "Position window", 10u32)
        .await
        .unwrap();
}

#[tokio::test]
#[serial_test::serial]
async fn test_save_and_restore() {
    let bench = setup(vec![SimDriveConfig::new(NODE, 1)]);

    bench.network.save_parameters(NODE).await.unwrap();
    bench.network.restore_defaults(NODE).await.unwrap();
    let model = bench.drives[0].model();
    assert_eq!(1, model.saved());
    assert_eq!(1, model.restored());
}

#[tokio::test]
#[serial_test::serial]
async fn test_concurrent_access_to_different_drives() {
    let bench = setup(vec![SimDriveConfig::new(10, 1), SimDriveConfig::new(11, 2)]);

    let (a, b) = tokio::join!(
        bench.network.configure(10, "Target Position", 100i32),
        bench.network.configure(11, "Target Position", -100i32),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(
        Some(&100i32.to_le_bytes()[..]),
        bench.drives[0].model().object(0x607A, 0)
    );
    assert_eq!(
        Some(&(-100i32).to_le_bytes()[..]),
        bench.drives[1].model().object(0x607A, 0)
    );
}
