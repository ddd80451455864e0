#![allow(dead_code)]
//! Modbus register map and decode for BESS controllers
//!
//! Decode invariants: signed 16-bit values are sign-extended from their
//! two's-complement representation, and scale factors are applied after
//! integer decode, never before. The pure decode functions are independent
//! of the transport so they stay testable without hardware.

use serde::{Deserialize, Serialize};

/// Input registers (function code 4), telemetry
pub mod input {
    /// State of Charge (% * 10)
    pub const SOC: u16 = 0x1000;
    /// State of Health (% * 10)
    pub const SOH: u16 = 0x1001;
    /// Battery voltage (V * 10)
    pub const VOLTAGE: u16 = 0x1002;
    /// Battery current (A * 10, signed, positive = charge)
    pub const CURRENT: u16 = 0x1003;
    /// Battery temperature (C * 10)
    pub const TEMPERATURE: u16 = 0x1004;
    /// Active power (kW * 10, signed)
    pub const POWER: u16 = 0x1005;
    /// Reactive power (kVAR * 10, signed)
    pub const REACTIVE_POWER: u16 = 0x1006;
    /// Grid frequency (Hz * 100)
    pub const FREQUENCY: u16 = 0x1007;
    pub const STATUS_WORD: u16 = 0x1010;
    pub const ALARM_WORD: u16 = 0x1011;
    pub const FAULT_WORD: u16 = 0x1012;
    /// Total capacity (kWh * 10)
    pub const CAPACITY_KWH: u16 = 0x1020;
    /// Max power (kW * 10)
    pub const CAPACITY_KW: u16 = 0x1021;
    pub const CYCLE_COUNT: u16 = 0x1022;
}

/// Holding registers (function codes 3/6/16), control
pub mod holding {
    /// Power setpoint (kW * 10, signed)
    pub const POWER_SETPOINT: u16 = 0x2000;
    /// Reactive power setpoint (kVAR * 10, signed)
    pub const REACTIVE_SETPOINT: u16 = 0x2001;
    /// 0=Off, 1=Charge, 2=Discharge, 3=Auto
    pub const CONTROL_MODE: u16 = 0x2002;
    /// 0=Disable, 1=Enable
    pub const ENABLE: u16 = 0x2003;
    /// Write 1 to reset alarms
    pub const RESET_ALARM: u16 = 0x2004;
}

/// Sign-extend a raw 16-bit register from two's complement
pub fn to_signed(raw: u16) -> i16 {
    raw as i16
}

/// Decode an unsigned register with a decimal scale divisor
pub fn scaled_u16(raw: u16, divisor: f64) -> f64 {
    f64::from(raw) / divisor
}

/// Decode a signed register with a decimal scale divisor
///
/// The sign extension happens on the integer value; the scale is applied
/// afterwards.
pub fn scaled_i16(raw: u16, divisor: f64) -> f64 {
    f64::from(to_signed(raw)) / divisor
}

/// Encode a signed engineering value into a register (inverse of
/// `scaled_i16`), clamping at the i16 range instead of wrapping
pub fn encode_i16(value: f64, multiplier: f64) -> u16 {
    let scaled = (value * multiplier).round();
    let clamped = scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
    clamped as u16
}

/// Decoded telemetry block read in one sweep from the input registers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BessRegisters {
    pub soc_percent: f64,
    pub soh_percent: f64,
    pub voltage_v: f64,
    /// Signed, positive = charge
    pub current_a: f64,
    pub temperature_c: f64,
    pub power_kw: f64,
    pub reactive_power_kvar: f64,
    pub frequency_hz: f64,
    pub status_word: u16,
    pub alarm_word: u16,
    pub fault_word: u16,
    pub capacity_kwh: f64,
    pub max_power_kw: f64,
    pub cycle_count: u32,
}

/// Decode the contiguous input-register block starting at `input::SOC`
///
/// The block spans 0x1000..=0x1022 (35 registers).
pub fn decode_status_block(registers: &[u16]) -> Option<BessRegisters> {
    if registers.len() < 35 {
        return None;
    }
    Some(BessRegisters {
        soc_percent: scaled_u16(registers[0], 10.0),
        soh_percent: scaled_u16(registers[1], 10.0),
        voltage_v: scaled_u16(registers[2], 10.0),
        current_a: scaled_i16(registers[3], 10.0),
        temperature_c: scaled_i16(registers[4], 10.0),
        power_kw: scaled_i16(registers[5], 10.0),
        reactive_power_kvar: scaled_i16(registers[6], 10.0),
        frequency_hz: scaled_u16(registers[7], 100.0),
        status_word: registers[16],
        alarm_word: registers[17],
        fault_word: registers[18],
        capacity_kwh: scaled_u16(registers[32], 10.0),
        max_power_kw: scaled_u16(registers[33], 10.0),
        cycle_count: u32::from(registers[34]),
    })
}

#[cfg(feature = "modbus")]
pub use client::ModbusBessSource;

#[cfg(feature = "modbus")]
mod client {
    use super::*;
    use crate::config::ModbusConfig;
    use crate::domain::bms::{BmsAlarms, BmsReading, BmsSource, PackState};
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_modbus::client::tcp;
    use tokio_modbus::prelude::*;

    /// BMS/BESS telemetry source over Modbus TCP
    ///
    /// Holds a single persistent connection; create once at startup and
    /// reuse, do not reconstruct inside the control loop.
    pub struct ModbusBessSource {
        context: Arc<Mutex<tokio_modbus::client::Context>>,
        timeout: std::time::Duration,
    }

    impl ModbusBessSource {
        pub async fn connect(cfg: &ModbusConfig) -> Result<Self> {
            let addr = format!("{}:{}", cfg.host, cfg.port)
                .parse()
                .context("invalid modbus address")?;
            let mut ctx = tcp::connect(addr).await.context("modbus connect failed")?;
            ctx.set_slave(Slave(cfg.unit_id));
            Ok(Self {
                context: Arc::new(Mutex::new(ctx)),
                timeout: std::time::Duration::from_millis(cfg.timeout_ms),
            })
        }

        async fn read_status(&self) -> Result<BessRegisters> {
            let mut ctx = self.context.lock().await;
            let registers = tokio::time::timeout(
                self.timeout,
                ctx.read_input_registers(input::SOC, 35),
            )
            .await
            .context("modbus read timed out")?
            .context("modbus read failed")?;
            decode_status_block(&registers).context("short register block")
        }

        pub async fn write_power_setpoint(&self, power_kw: f64) -> Result<()> {
            let raw = encode_i16(power_kw, 10.0);
            let mut ctx = self.context.lock().await;
            tokio::time::timeout(
                self.timeout,
                ctx.write_single_register(holding::POWER_SETPOINT, raw),
            )
            .await
            .context("modbus write timed out")?
            .context("modbus write failed")?;
            Ok(())
        }
    }

    #[async_trait]
    impl BmsSource for ModbusBessSource {
        async fn latest(&self) -> Option<BmsReading> {
            let status = self.read_status().await.ok()?;
            Some(BmsReading {
                pack: PackState {
                    soc_percent: status.soc_percent,
                    soh_percent: status.soh_percent,
                    pack_voltage_v: status.voltage_v,
                    pack_current_a: status.current_a,
                    temperature_c: status.temperature_c,
                    max_charge_current_a: 0.0,
                    max_discharge_current_a: 0.0,
                    cycle_count: status.cycle_count,
                    cells: Vec::new(),
                },
                alarms: BmsAlarms {
                    overvoltage_fault: status.fault_word & 0x01 != 0,
                    undervoltage_fault: status.fault_word & 0x02 != 0,
                    overcurrent_fault: status.fault_word & 0x04 != 0,
                    overtemperature_fault: status.fault_word & 0x08 != 0,
                    short_circuit_fault: status.fault_word & 0x10 != 0,
                    ..Default::default()
                },
                received_at: Utc::now(),
            })
        }
    }
}
