//! Simulated bus and drives for testing the servocan client
pub mod sim_bus;
pub mod sim_drive;
