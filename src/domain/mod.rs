pub mod bms;
pub mod derating;
pub mod inverter;
pub mod types;

pub use bms::{BmsAlarms, BmsReading, BmsSource, CellSample, PackState, SimulatedBms};
pub use inverter::{Inverter, InverterError, InverterState, InverterStatus, SimulatedInverter};
pub use types::{
    CampusTelemetry, ControlAction, ControlCommand, DeliveryOutcome, DeliveryReport,
    NodeCapacity, NodeIdentity, NodeStatus, Setpoint, StatusFlags, TelemetryReport,
};
