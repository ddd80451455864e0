pub mod bms_can;
pub mod modbus;
pub mod sunspec;
