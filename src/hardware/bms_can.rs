#![allow(dead_code)]
//! BMS CAN frame parser
//!
//! Cell-level telemetry arrives as a set of 8-byte CAN frames; the parser
//! accumulates them until a complete `PackState` can be assembled. Values
//! are big-endian; temperatures are signed (0.1 C), voltages unsigned (mV).

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, error, warn};

use crate::domain::bms::{BmsAlarms, CellSample, PackState};

/// Standard CAN message IDs for BMS communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmsFrameId {
    /// Cells 1-4 / 5-8 / 9-12 / 13-16
    CellVoltages1 = 0x100,
    CellVoltages2 = 0x101,
    CellVoltages3 = 0x102,
    CellVoltages4 = 0x103,
    /// Temperature sensors 1-4 / 5-8
    CellTemps1 = 0x110,
    CellTemps2 = 0x111,
    /// Pack voltage, current, SOC, current limits
    PackStatus = 0x120,
    /// Max charge/discharge current
    PackLimits = 0x121,
    /// SOH, cycle count
    PackHealth = 0x122,
    Alarms = 0x130,
}

/// What a frame parsed into, mostly for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedFrame {
    CellVoltages,
    CellTemperatures,
    PackStatus,
    PackHealth,
    Alarms,
}

#[derive(Debug, Clone, Copy, Default)]
struct PartialPack {
    pack_voltage_v: Option<f64>,
    pack_current_a: Option<f64>,
    soc_percent: Option<f64>,
    max_charge_current_a: Option<f64>,
    max_discharge_current_a: Option<f64>,
    soh_percent: Option<f64>,
    cycle_count: Option<u32>,
}

/// Accumulating parser for the BMS frame set
pub struct BmsCanParser {
    num_cells: u16,
    num_temp_sensors: u16,
    cell_voltages: Vec<Option<f64>>,
    cell_temperatures: Vec<Option<f64>>,
    partial: PartialPack,
    alarms: BmsAlarms,
    pack: Option<PackState>,
}

impl BmsCanParser {
    pub fn new(num_cells: u16, num_temp_sensors: u16) -> Self {
        Self {
            num_cells,
            num_temp_sensors,
            cell_voltages: vec![None; num_cells as usize],
            cell_temperatures: vec![None; num_temp_sensors as usize],
            partial: PartialPack::default(),
            alarms: BmsAlarms::default(),
            pack: None,
        }
    }

    /// Parse one CAN frame; returns what it was, or None for unknown ids
    pub fn parse_frame(&mut self, can_id: u32, data: &[u8]) -> Option<ParsedFrame> {
        if data.len() < 8 {
            warn!(can_id, len = data.len(), "short CAN frame dropped");
            return None;
        }
        match can_id {
            0x100 => self.parse_cell_voltages(data, 1),
            0x101 => self.parse_cell_voltages(data, 5),
            0x102 => self.parse_cell_voltages(data, 9),
            0x103 => self.parse_cell_voltages(data, 13),
            0x110 => self.parse_cell_temperatures(data, 1),
            0x111 => self.parse_cell_temperatures(data, 5),
            0x120 => self.parse_pack_status(data),
            0x122 => self.parse_pack_health(data),
            0x130 => self.parse_alarms(data),
            _ => {
                debug!(can_id = format!("0x{can_id:03X}"), "unknown CAN id");
                None
            }
        }
    }

    /// Complete pack data once every frame type has arrived at least once
    pub fn pack(&self) -> Option<&PackState> {
        self.pack.as_ref()
    }

    pub fn alarms(&self) -> BmsAlarms {
        self.alarms
    }

    fn parse_cell_voltages(&mut self, data: &[u8], start_cell: u16) -> Option<ParsedFrame> {
        for i in 0..4u16 {
            let offset = (i * 2) as usize;
            // uint16 millivolts
            let millivolts = BigEndian::read_u16(&data[offset..offset + 2]);
            let cell_id = start_cell + i;
            if cell_id <= self.num_cells {
                self.cell_voltages[(cell_id - 1) as usize] = Some(f64::from(millivolts) / 1000.0);
            }
        }
        self.try_build();
        Some(ParsedFrame::CellVoltages)
    }

    fn parse_cell_temperatures(&mut self, data: &[u8], start_sensor: u16) -> Option<ParsedFrame> {
        for i in 0..4u16 {
            let offset = (i * 2) as usize;
            // int16 in 0.1 C, sign-extended before scaling
            let raw = BigEndian::read_i16(&data[offset..offset + 2]);
            let sensor_id = start_sensor + i;
            if sensor_id <= self.num_temp_sensors {
                self.cell_temperatures[(sensor_id - 1) as usize] = Some(f64::from(raw) / 10.0);
            }
        }
        self.try_build();
        Some(ParsedFrame::CellTemperatures)
    }

    fn parse_pack_status(&mut self, data: &[u8]) -> Option<ParsedFrame> {
        // uint16 0.1 V | int16 0.1 A (positive = charge) | u8 SOC % | u8
        // max charge A | u8 max discharge A
        self.partial.pack_voltage_v = Some(f64::from(BigEndian::read_u16(&data[0..2])) / 10.0);
        self.partial.pack_current_a = Some(f64::from(BigEndian::read_i16(&data[2..4])) / 10.0);
        self.partial.soc_percent = Some(f64::from(data[4]));
        self.partial.max_charge_current_a = Some(f64::from(data[5]));
        self.partial.max_discharge_current_a = Some(f64::from(data[6]));
        self.try_build();
        Some(ParsedFrame::PackStatus)
    }

    fn parse_pack_health(&mut self, data: &[u8]) -> Option<ParsedFrame> {
        // u8 SOH % | uint16 cycle count
        self.partial.soh_percent = Some(f64::from(data[0]));
        self.partial.cycle_count = Some(u32::from(BigEndian::read_u16(&data[1..3])));
        self.try_build();
        Some(ParsedFrame::PackHealth)
    }

    fn parse_alarms(&mut self, data: &[u8]) -> Option<ParsedFrame> {
        let fault_byte = data[0];
        self.alarms.overvoltage_fault = fault_byte & 0x01 != 0;
        self.alarms.undervoltage_fault = fault_byte & 0x02 != 0;
        self.alarms.overcurrent_fault = fault_byte & 0x04 != 0;
        self.alarms.overtemperature_fault = fault_byte & 0x08 != 0;
        self.alarms.short_circuit_fault = fault_byte & 0x10 != 0;

        let warning_byte = data[1];
        self.alarms.high_voltage_warning = warning_byte & 0x01 != 0;
        self.alarms.low_voltage_warning = warning_byte & 0x02 != 0;
        self.alarms.high_current_warning = warning_byte & 0x04 != 0;
        self.alarms.high_temperature_warning = warning_byte & 0x08 != 0;
        self.alarms.cell_imbalance_warning = warning_byte & 0x10 != 0;

        let info_byte = data[2];
        self.alarms.balancing_active = info_byte & 0x01 != 0;

        if self.alarms.has_critical_fault() {
            error!(faults = self.alarms.fault_bitmask(), "BMS critical fault");
        } else if self.alarms.has_warnings() {
            warn!(warnings = self.alarms.warning_bitmask(), "BMS warning");
        }

        self.try_build();
        Some(ParsedFrame::Alarms)
    }

    fn try_build(&mut self) {
        let Some(pack_voltage_v) = self.partial.pack_voltage_v else {
            return;
        };
        let Some(soh_percent) = self.partial.soh_percent else {
            return;
        };

        let cells: Vec<CellSample> = (1..=self.num_cells)
            .map(|cell_id| {
                let voltage = self.cell_voltages[(cell_id - 1) as usize].unwrap_or(0.0);
                // Two cells share one temperature sensor
                let sensor_id = ((cell_id - 1) / 2) as usize;
                let temperature = self
                    .cell_temperatures
                    .get(sensor_id)
                    .copied()
                    .flatten();
                CellSample {
                    index: cell_id,
                    voltage_v: voltage,
                    temperature_c: temperature,
                    balancing: self.alarms.balancing_active,
                }
            })
            .collect();

        let max_cell_temp = cells
            .iter()
            .filter_map(|c| c.temperature_c)
            .reduce(f64::max);

        self.pack = Some(PackState {
            soc_percent: self.partial.soc_percent.unwrap_or(0.0),
            soh_percent,
            pack_voltage_v,
            pack_current_a: self.partial.pack_current_a.unwrap_or(0.0),
            temperature_c: max_cell_temp.unwrap_or(25.0),
            max_charge_current_a: self.partial.max_charge_current_a.unwrap_or(0.0),
            max_discharge_current_a: self.partial.max_discharge_current_a.unwrap_or(0.0),
            cycle_count: self.partial.cycle_count.unwrap_or(0),
            cells,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voltage_frame(millivolts: [u16; 4]) -> [u8; 8] {
        let mut frame = [0u8; 8];
        for (i, mv) in millivolts.iter().enumerate() {
            BigEndian::write_u16(&mut frame[i * 2..i * 2 + 2], *mv);
        }
        frame
    }

    fn temp_frame(tenths: [i16; 4]) -> [u8; 8] {
        let mut frame = [0u8; 8];
        for (i, t) in tenths.iter().enumerate() {
            BigEndian::write_i16(&mut frame[i * 2..i * 2 + 2], *t);
        }
        frame
    }

    fn pack_status_frame(voltage_tenths: u16, current_tenths: i16, soc: u8) -> [u8; 8] {
        let mut frame = [0u8; 8];
        BigEndian::write_u16(&mut frame[0..2], voltage_tenths);
        BigEndian::write_i16(&mut frame[2..4], current_tenths);
        frame[4] = soc;
        frame[5] = 100;
        frame[6] = 100;
        frame
    }

    fn health_frame(soh: u8, cycles: u16) -> [u8; 8] {
        let mut frame = [0u8; 8];
        frame[0] = soh;
        BigEndian::write_u16(&mut frame[1..3], cycles);
        frame
    }

    fn full_parser() -> BmsCanParser {
        let mut parser = BmsCanParser::new(16, 8);
        parser.parse_frame(0x100, &voltage_frame([3650, 3651, 3652, 3653]));
        parser.parse_frame(0x101, &voltage_frame([3648, 3649, 3650, 3651]));
        parser.parse_frame(0x102, &voltage_frame([3650; 4]));
        parser.parse_frame(0x103, &voltage_frame([3650; 4]));
        parser.parse_frame(0x110, &temp_frame([253, 255, 250, 248]));
        parser.parse_frame(0x111, &temp_frame([251, 252, 249, 247]));
        parser.parse_frame(0x120, &pack_status_frame(584, -125, 80));
        parser.parse_frame(0x122, &health_frame(95, 152));
        parser
    }

    #[test]
    fn assembles_complete_pack() {
        let parser = full_parser();
        let pack = parser.pack().expect("pack should be complete");

        assert_eq!(pack.soc_percent, 80.0);
        assert_eq!(pack.soh_percent, 95.0);
        assert_eq!(pack.pack_voltage_v, 58.4);
        assert_eq!(pack.pack_current_a, -12.5);
        assert_eq!(pack.cycle_count, 152);
        assert_eq!(pack.cells.len(), 16);
        assert_eq!(pack.cells[0].voltage_v, 3.65);
        // Cells 1-2 share sensor 1 (25.3 C)
        assert_eq!(pack.cells[0].temperature_c, Some(25.3));
        assert_eq!(pack.cells[1].temperature_c, Some(25.3));
        assert_eq!(pack.cells[2].temperature_c, Some(25.5));
    }

    #[test]
    fn negative_temperature_sign_extends() {
        let mut parser = BmsCanParser::new(4, 4);
        parser.parse_frame(0x110, &temp_frame([-52, 0, 0, 0]));
        parser.parse_frame(0x100, &voltage_frame([3650; 4]));
        parser.parse_frame(0x120, &pack_status_frame(146, 0, 50));
        parser.parse_frame(0x122, &health_frame(100, 0));

        let pack = parser.pack().unwrap();
        assert_eq!(pack.cells[0].temperature_c, Some(-5.2));
    }

    #[test]
    fn incomplete_frame_set_yields_no_pack() {
        let mut parser = BmsCanParser::new(16, 8);
        parser.parse_frame(0x100, &voltage_frame([3650; 4]));
        assert!(parser.pack().is_none());
    }

    #[test]
    fn alarm_bits_decode() {
        let mut parser = BmsCanParser::new(16, 8);
        let mut frame = [0u8; 8];
        frame[0] = 0x11; // overvoltage + short circuit
        frame[1] = 0x04; // high current warning
        frame[2] = 0x01; // balancing
        parser.parse_frame(0x130, &frame);

        let alarms = parser.alarms();
        assert!(alarms.overvoltage_fault);
        assert!(alarms.short_circuit_fault);
        assert!(alarms.high_current_warning);
        assert!(alarms.balancing_active);
        assert!(alarms.has_critical_fault());
    }

    #[test]
    fn unknown_id_ignored() {
        let mut parser = BmsCanParser::new(16, 8);
        assert!(parser.parse_frame(0x999, &[0u8; 8]).is_none());
    }

    #[test]
    fn short_frame_dropped() {
        let mut parser = BmsCanParser::new(16, 8);
        assert!(parser.parse_frame(0x100, &[0u8; 4]).is_none());
    }

    #[test]
    fn max_temperature_feeds_pack_temperature() {
        let parser = full_parser();
        let pack = parser.pack().unwrap();
        // Hottest sensor was 25.5 C
        assert_eq!(pack.temperature_c, 25.5);
    }
}
