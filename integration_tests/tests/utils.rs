#![allow(dead_code)]
use integration_tests::{
    sim_bus::{SimBus, SimBusReceiver, SimBusSender},
    sim_drive::{SimDrive, SimDriveConfig},
};
use servocan_client::{common::object_dict::ObjectDictionary, ClientSettings, Network};
use servocan_common::{messages::DriveMessage, traits::AsyncCanReceiver};

/// Settings with short LSS and reset waits, so scans finish quickly on the simulated bus
pub fn test_settings() -> ClientSettings {
    ClientSettings {
        sdo_timeout_ms: 200,
        state_transition_timeout_ms: 1000,
        setpoint_ack_timeout_ms: 300,
        homing_settle_ms: 150,
        lss_response_timeout_ms: 20,
        lss_scan_timeout_ms: 5,
        lss_reset_delay_ms: 50,
        bootup_timeout_ms: 1000,
        ..Default::default()
    }
}

pub struct TestBench {
    pub bus: SimBus,
    pub drives: Vec<SimDrive>,
    pub network: Network<SimBusSender>,
}

/// Start one simulated drive per config, and a network on the same bus
pub fn setup(configs: Vec<SimDriveConfig>) -> TestBench {
    setup_with_settings(configs, test_settings())
}

pub fn setup_with_settings(configs: Vec<SimDriveConfig>, settings: ClientSettings) -> TestBench {
    let bus = SimBus::new();
    let drives = configs
        .into_iter()
        .map(|config| SimDrive::spawn(&bus, config))
        .collect();
    let (sender, receiver) = bus.new_pair();
    let network = Network::new(sender, receiver, ObjectDictionary::cia402(), settings);
    TestBench {
        bus,
        drives,
        network,
    }
}

pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        while let Ok(Some(msg)) = self.rx.try_recv() {
            let parsed_msg: Result<DriveMessage, _> = msg.try_into();

            if let Ok(msg) = parsed_msg {
                println!("{:?}", msg);
            } else {
                println!("{:?}", msg);
            }
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}
