#![allow(dead_code)]
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Individual cell measurement, produced per BMS frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSample {
    /// 1-based cell index
    pub index: u16,
    pub voltage_v: f64,
    pub temperature_c: Option<f64>,
    pub balancing: bool,
}

/// Battery pack aggregate state, rebuilt from the latest BMS frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackState {
    pub soc_percent: f64,
    pub soh_percent: f64,
    pub pack_voltage_v: f64,
    /// Signed: positive = charge
    pub pack_current_a: f64,
    pub temperature_c: f64,
    pub max_charge_current_a: f64,
    pub max_discharge_current_a: f64,
    pub cycle_count: u32,
    pub cells: Vec<CellSample>,
}

impl PackState {
    pub fn min_cell_voltage(&self) -> Option<f64> {
        self.cells
            .iter()
            .map(|c| c.voltage_v)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn max_cell_voltage(&self) -> Option<f64> {
        self.cells
            .iter()
            .map(|c| c.voltage_v)
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Cell voltage imbalance (max - min)
    pub fn voltage_delta(&self) -> Option<f64> {
        match (self.min_cell_voltage(), self.max_cell_voltage()) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }

    pub fn max_cell_temperature(&self) -> Option<f64> {
        self.cells
            .iter()
            .filter_map(|c| c.temperature_c)
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Cells are considered balanced below 50 mV spread
    pub fn is_balanced(&self) -> bool {
        self.voltage_delta().map(|d| d < 0.05).unwrap_or(true)
    }
}

/// Decoded BMS alarm and fault flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmsAlarms {
    // Critical faults (require immediate shutdown)
    pub overvoltage_fault: bool,
    pub undervoltage_fault: bool,
    pub overcurrent_fault: bool,
    pub overtemperature_fault: bool,
    pub short_circuit_fault: bool,

    // Warnings (reduce power, alert operator)
    pub high_voltage_warning: bool,
    pub low_voltage_warning: bool,
    pub high_current_warning: bool,
    pub high_temperature_warning: bool,
    pub cell_imbalance_warning: bool,

    pub balancing_active: bool,
}

impl BmsAlarms {
    pub fn has_critical_fault(&self) -> bool {
        self.overvoltage_fault
            || self.undervoltage_fault
            || self.overcurrent_fault
            || self.overtemperature_fault
            || self.short_circuit_fault
    }

    pub fn has_warnings(&self) -> bool {
        self.high_voltage_warning
            || self.low_voltage_warning
            || self.high_current_warning
            || self.high_temperature_warning
            || self.cell_imbalance_warning
    }

    /// Fault bits packed as on the wire (byte 0 of the alarm frame)
    pub fn fault_bitmask(&self) -> u16 {
        let mut mask = 0u16;
        if self.overvoltage_fault {
            mask |= 0x01;
        }
        if self.undervoltage_fault {
            mask |= 0x02;
        }
        if self.overcurrent_fault {
            mask |= 0x04;
        }
        if self.overtemperature_fault {
            mask |= 0x08;
        }
        if self.short_circuit_fault {
            mask |= 0x10;
        }
        mask
    }

    /// Warning bits packed as on the wire (byte 1 of the alarm frame)
    pub fn warning_bitmask(&self) -> u16 {
        let mut mask = 0u16;
        if self.high_voltage_warning {
            mask |= 0x01;
        }
        if self.low_voltage_warning {
            mask |= 0x02;
        }
        if self.high_current_warning {
            mask |= 0x04;
        }
        if self.high_temperature_warning {
            mask |= 0x08;
        }
        if self.cell_imbalance_warning {
            mask |= 0x10;
        }
        mask
    }
}

/// One complete BMS observation with its arrival time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmsReading {
    pub pack: PackState,
    pub alarms: BmsAlarms,
    pub received_at: DateTime<Utc>,
}

/// Source of BMS telemetry (CAN ingestion task, or a simulator)
#[async_trait]
pub trait BmsSource: Send + Sync {
    /// Latest complete reading, or None before the first full frame set
    async fn latest(&self) -> Option<BmsReading>;
}

/// Simulated BMS for running without hardware
///
/// Integrates SOC from the commanded power; cells sit around 3.65 V with a
/// small deterministic spread.
pub struct SimulatedBms {
    inner: Arc<RwLock<SimulatedBmsState>>,
    num_cells: u16,
    capacity_kwh: f64,
}

struct SimulatedBmsState {
    soc_percent: f64,
    power_kw: f64,
    temperature_c: f64,
    alarms: BmsAlarms,
    updated_at: DateTime<Utc>,
}

impl SimulatedBms {
    pub fn new(num_cells: u16, capacity_kwh: f64, initial_soc_percent: f64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SimulatedBmsState {
                soc_percent: initial_soc_percent.clamp(0.0, 100.0),
                power_kw: 0.0,
                temperature_c: 25.0,
                alarms: BmsAlarms::default(),
                updated_at: Utc::now(),
            })),
            num_cells,
            capacity_kwh: capacity_kwh.max(0.1),
        }
    }

    /// Advance the simulation: integrate SOC and warm the pack under load
    pub async fn apply_power(&self, power_kw: f64, dt_s: f64) {
        let mut st = self.inner.write().await;
        st.power_kw = power_kw;

        let delta_kwh = power_kw * dt_s / 3600.0;
        let delta_pct = (delta_kwh / self.capacity_kwh) * 100.0;
        st.soc_percent = (st.soc_percent + delta_pct).clamp(0.0, 100.0);

        let target_temp = 25.0 + power_kw.abs() * 0.05;
        let step = 0.5 * dt_s;
        if st.temperature_c < target_temp {
            st.temperature_c = (st.temperature_c + step).min(target_temp);
        } else {
            st.temperature_c = (st.temperature_c - step).max(target_temp);
        }
        st.updated_at = Utc::now();
    }

    /// Inject alarm flags (test hook)
    pub async fn set_alarms(&self, alarms: BmsAlarms) {
        self.inner.write().await.alarms = alarms;
    }

    /// Force pack temperature (test hook)
    pub async fn set_temperature(&self, temperature_c: f64) {
        self.inner.write().await.temperature_c = temperature_c;
    }

    pub async fn set_soc(&self, soc_percent: f64) {
        self.inner.write().await.soc_percent = soc_percent.clamp(0.0, 100.0);
    }
}

#[async_trait]
impl BmsSource for SimulatedBms {
    async fn latest(&self) -> Option<BmsReading> {
        let st = self.inner.read().await;

        let cells: Vec<CellSample> = (1..=self.num_cells)
            .map(|index| CellSample {
                index,
                // Small deterministic spread per cell position
                voltage_v: 3.65 + ((index % 5) as f64 - 2.0) * 0.005,
                temperature_c: Some(st.temperature_c),
                balancing: st.alarms.balancing_active,
            })
            .collect();

        let pack_voltage_v: f64 = cells.iter().map(|c| c.voltage_v).sum();
        let pack_current_a = if pack_voltage_v > 0.0 {
            st.power_kw * 1000.0 / pack_voltage_v
        } else {
            0.0
        };

        Some(BmsReading {
            pack: PackState {
                soc_percent: st.soc_percent,
                soh_percent: 95.0,
                pack_voltage_v,
                pack_current_a,
                temperature_c: st.temperature_c,
                max_charge_current_a: 100.0,
                max_discharge_current_a: 100.0,
                cycle_count: 150,
                cells,
            },
            alarms: st.alarms,
            received_at: st.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_with_cells(voltages: &[f64]) -> PackState {
        PackState {
            soc_percent: 50.0,
            soh_percent: 100.0,
            pack_voltage_v: voltages.iter().sum(),
            pack_current_a: 0.0,
            temperature_c: 25.0,
            max_charge_current_a: 100.0,
            max_discharge_current_a: 100.0,
            cycle_count: 0,
            cells: voltages
                .iter()
                .enumerate()
                .map(|(i, v)| CellSample {
                    index: (i + 1) as u16,
                    voltage_v: *v,
                    temperature_c: None,
                    balancing: false,
                })
                .collect(),
        }
    }

    #[test]
    fn voltage_delta_from_cells() {
        let pack = pack_with_cells(&[3.60, 3.70, 3.65]);
        assert!((pack.voltage_delta().unwrap() - 0.1).abs() < 1e-9);
        assert!(!pack.is_balanced());
    }

    #[test]
    fn empty_cells_have_no_delta() {
        let pack = pack_with_cells(&[]);
        assert!(pack.voltage_delta().is_none());
        assert!(pack.is_balanced());
    }

    #[test]
    fn alarm_bitmask_round_trip() {
        let alarms = BmsAlarms {
            overvoltage_fault: true,
            short_circuit_fault: true,
            high_current_warning: true,
            ..Default::default()
        };
        assert_eq!(alarms.fault_bitmask(), 0x11);
        assert_eq!(alarms.warning_bitmask(), 0x04);
        assert!(alarms.has_critical_fault());
        assert!(alarms.has_warnings());
    }

    #[tokio::test]
    async fn simulated_bms_integrates_soc() {
        let bms = SimulatedBms::new(16, 200.0, 50.0);
        // Charge at 100 kW for one hour of simulated time
        bms.apply_power(100.0, 3600.0).await;
        let reading = bms.latest().await.unwrap();
        assert!((reading.pack.soc_percent - 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn simulated_bms_current_sign_follows_power() {
        let bms = SimulatedBms::new(16, 200.0, 50.0);
        bms.apply_power(-50.0, 1.0).await;
        let reading = bms.latest().await.unwrap();
        assert!(reading.pack.pack_current_a < 0.0);
    }
}
