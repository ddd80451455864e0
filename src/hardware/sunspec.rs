#![allow(dead_code)]
//! SunSpec inverter access over Modbus TCP
//!
//! Register offsets are relative to the SunSpec base address (40000).
//! The power limit is written as a percentage of rated power scaled to
//! 0-10000 (0.00 % - 100.00 %); the VAR setpoint is written in VAR.

use crate::domain::inverter::{InverterState, InverterStatus};

/// SunSpec base address
pub const BASE_ADDRESS: u16 = 40000;

/// Register offsets from the base address
pub mod offset {
    /// Should read 0x53756E53 ("SunS")
    pub const SUNSPEC_ID: u16 = 0;
    pub const MODEL_ID: u16 = 2;
    /// AC current (A * 10)
    pub const AC_CURRENT: u16 = 4;
    /// AC voltage (V * 10)
    pub const AC_VOLTAGE: u16 = 6;
    /// AC frequency (Hz * 100)
    pub const AC_FREQUENCY: u16 = 12;
    /// AC power (W, signed)
    pub const AC_POWER: u16 = 14;
    /// Rated power (W)
    pub const AC_POWER_MAX: u16 = 16;
    /// DC current (A * 10)
    pub const DC_CURRENT: u16 = 18;
    /// DC voltage (V * 10)
    pub const DC_VOLTAGE: u16 = 20;
    /// Cabinet temperature (C * 10)
    pub const TEMP: u16 = 22;
    /// Operating state enum
    pub const STATUS: u16 = 24;
    /// Active power limit (% of rated * 100)
    pub const POWER_SETPOINT: u16 = 100;
    /// Reactive power setpoint (VAR, signed)
    pub const VAR_SETPOINT: u16 = 102;
}

/// Decode the AC measurement block (offsets 4..=17, 14 registers)
/// plus DC block (18..=21) and status block (22..=24), read as one sweep
/// of 21 registers starting at `offset::AC_CURRENT`.
pub fn decode_inverter_block(registers: &[u16]) -> Option<InverterState> {
    if registers.len() < 21 {
        return None;
    }
    // Indices are (offset - AC_CURRENT)
    let ac_current = f64::from(registers[0]) / 10.0;
    let ac_voltage = f64::from(registers[2]) / 10.0;
    let ac_frequency = f64::from(registers[8]) / 100.0;
    let ac_power_w = f64::from(registers[10] as i16);
    let dc_current = f64::from(registers[14]) / 10.0;
    let dc_voltage = f64::from(registers[16]) / 10.0;
    let temperature = f64::from(registers[18] as i16) / 10.0;
    let status = InverterStatus::from_register(registers[20]);

    let dc_power_w = dc_current * dc_voltage;
    let efficiency = if dc_power_w > 0.0 {
        (ac_power_w.abs() / dc_power_w * 100.0).min(100.0)
    } else {
        0.0
    };

    Some(InverterState {
        ac_power_kw: ac_power_w / 1000.0,
        reactive_power_kvar: 0.0,
        ac_voltage_v: ac_voltage,
        ac_current_a: ac_current,
        ac_frequency_hz: ac_frequency,
        dc_voltage_v: dc_voltage,
        dc_current_a: dc_current,
        temperature_c: temperature,
        status,
        efficiency_percent: efficiency,
    })
}

/// Encode a power limit as the 0-10000 percent register value
pub fn encode_power_limit(power_kw: f64, rated_kw: f64) -> u16 {
    if rated_kw <= 0.0 {
        return 0;
    }
    let percent = (power_kw.abs() / rated_kw * 100.0).clamp(0.0, 100.0);
    (percent * 100.0).round() as u16
}

#[cfg(feature = "modbus")]
pub use client::SunSpecInverter;

#[cfg(feature = "modbus")]
mod client {
    use super::*;
    use crate::config::ModbusConfig;
    use crate::domain::inverter::{Inverter, InverterError};
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_modbus::client::tcp;
    use tokio_modbus::prelude::*;
    use tracing::info;

    /// SunSpec-compliant inverter controller over Modbus TCP
    pub struct SunSpecInverter {
        context: Arc<Mutex<tokio_modbus::client::Context>>,
        timeout: std::time::Duration,
        rated_kw: f64,
    }

    impl SunSpecInverter {
        pub async fn connect(cfg: &ModbusConfig, rated_kw: f64) -> Result<Self> {
            let addr = format!("{}:{}", cfg.host, cfg.port)
                .parse()
                .context("invalid modbus address")?;
            let mut ctx = tcp::connect(addr).await.context("inverter connect failed")?;
            ctx.set_slave(Slave(cfg.unit_id));
            info!(host = %cfg.host, port = cfg.port, "connected to SunSpec inverter");
            Ok(Self {
                context: Arc::new(Mutex::new(ctx)),
                timeout: std::time::Duration::from_millis(cfg.timeout_ms),
                rated_kw,
            })
        }

        async fn write_register(&self, offset: u16, value: u16) -> Result<(), InverterError> {
            let mut ctx = self.context.lock().await;
            tokio::time::timeout(
                self.timeout,
                ctx.write_single_register(BASE_ADDRESS + offset, value),
            )
            .await
            .map_err(|_| InverterError::Communication("write timed out".to_string()))?
            .map_err(|e| InverterError::Communication(e.to_string()))?;
            Ok(())
        }
    }

    #[async_trait]
    impl Inverter for SunSpecInverter {
        async fn read_state(&self) -> Result<InverterState, InverterError> {
            let registers = {
                let mut ctx = self.context.lock().await;
                tokio::time::timeout(
                    self.timeout,
                    ctx.read_holding_registers(BASE_ADDRESS + offset::AC_CURRENT, 21),
                )
                .await
                .map_err(|_| InverterError::Communication("read timed out".to_string()))?
                .map_err(|e| InverterError::Communication(e.to_string()))?
            };
            decode_inverter_block(&registers)
                .ok_or_else(|| InverterError::Communication("short register block".to_string()))
        }

        async fn set_power(&self, power_kw: f64) -> Result<(), InverterError> {
            if !power_kw.is_finite() {
                return Err(InverterError::InvalidCommand(power_kw));
            }
            let limit = encode_power_limit(power_kw, self.rated_kw);
            self.write_register(offset::POWER_SETPOINT, limit).await
        }

        async fn set_reactive_power(&self, power_kvar: f64) -> Result<(), InverterError> {
            if !power_kvar.is_finite() {
                return Err(InverterError::InvalidCommand(power_kvar));
            }
            let var = (power_kvar * 1000.0)
                .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
            self.write_register(offset::VAR_SETPOINT, var as u16).await
        }

        async fn enable(&self) -> Result<(), InverterError> {
            info!("inverter enabled");
            Ok(())
        }

        async fn disable(&self) -> Result<(), InverterError> {
            self.write_register(offset::POWER_SETPOINT, 0).await?;
            info!("inverter disabled");
            Ok(())
        }

        fn rated_kw(&self) -> f64 {
            self.rated_kw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ac_block() {
        let mut registers = vec![0u16; 21];
        registers[0] = 1203; // 120.3 A
        registers[2] = 4150; // 415.0 V
        registers[8] = 4997; // 49.97 Hz
        registers[10] = (-20000i16) as u16; // -20 kW (discharge)
        registers[14] = 850; // 85.0 A DC
        registers[16] = 6000; // 600.0 V DC
        registers[18] = 412; // 41.2 C
        registers[20] = 4; // MPPT

        let state = decode_inverter_block(&registers).unwrap();
        assert_eq!(state.ac_current_a, 120.3);
        assert_eq!(state.ac_voltage_v, 415.0);
        assert_eq!(state.ac_frequency_hz, 49.97);
        assert_eq!(state.ac_power_kw, -20.0);
        assert_eq!(state.dc_voltage_v, 600.0);
        assert_eq!(state.temperature_c, 41.2);
        assert_eq!(state.status, InverterStatus::Mppt);
        assert!(state.efficiency_percent > 0.0);
    }

    #[test]
    fn short_block_rejected() {
        assert!(decode_inverter_block(&[0u16; 5]).is_none());
    }

    #[test]
    fn power_limit_scales_to_centipercent() {
        assert_eq!(encode_power_limit(50.0, 100.0), 5000);
        assert_eq!(encode_power_limit(100.0, 100.0), 10000);
        // Over-rated request clamps at 100.00 %
        assert_eq!(encode_power_limit(150.0, 100.0), 10000);
        // Magnitude only; direction is carried by the control mode
        assert_eq!(encode_power_limit(-25.0, 100.0), 2500);
        assert_eq!(encode_power_limit(10.0, 0.0), 0);
    }
}
