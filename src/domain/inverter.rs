#![allow(dead_code)]
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Inverter-specific errors
#[derive(Debug, Error)]
pub enum InverterError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Inverter in fault state: {0}")]
    Fault(String),
    #[error("Invalid power command: {0} kW")]
    InvalidCommand(f64),
    #[error("Inverter offline or unavailable")]
    Offline,
}

/// Inverter operational status (SunSpec operating states)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InverterStatus {
    Off,
    Sleeping,
    Starting,
    Mppt,
    Throttled,
    ShuttingDown,
    Fault,
    Standby,
}

impl InverterStatus {
    /// Decode the SunSpec operating-state register value
    pub fn from_register(code: u16) -> Self {
        match code {
            1 => InverterStatus::Off,
            2 => InverterStatus::Sleeping,
            3 => InverterStatus::Starting,
            4 => InverterStatus::Mppt,
            5 => InverterStatus::Throttled,
            6 => InverterStatus::ShuttingDown,
            7 => InverterStatus::Fault,
            8 => InverterStatus::Standby,
            _ => InverterStatus::Off,
        }
    }
}

/// Inverter telemetry, sampled per poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterState {
    /// AC active power (kW, signed: positive = charge)
    pub ac_power_kw: f64,
    pub reactive_power_kvar: f64,
    pub ac_voltage_v: f64,
    pub ac_current_a: f64,
    pub ac_frequency_hz: f64,
    pub dc_voltage_v: f64,
    pub dc_current_a: f64,
    pub temperature_c: f64,
    pub status: InverterStatus,
    pub efficiency_percent: f64,
}

/// Inverter hardware seam
///
/// Single-writer: only the node tick task issues power writes.
#[async_trait]
pub trait Inverter: Send + Sync {
    async fn read_state(&self) -> Result<InverterState, InverterError>;
    /// Signed active power setpoint (kW, positive = charge)
    async fn set_power(&self, power_kw: f64) -> Result<(), InverterError>;
    async fn set_reactive_power(&self, power_kvar: f64) -> Result<(), InverterError>;
    async fn enable(&self) -> Result<(), InverterError>;
    async fn disable(&self) -> Result<(), InverterError>;
    fn rated_kw(&self) -> f64;
}

/// Simulated inverter for running without hardware
pub struct SimulatedInverter {
    state: Arc<RwLock<SimState>>,
    rated_kw: f64,
}

struct SimState {
    power_kw: f64,
    reactive_kvar: f64,
    enabled: bool,
    /// Test hook: fail the next N writes
    fail_writes: u32,
}

impl SimulatedInverter {
    pub fn new(rated_kw: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(SimState {
                power_kw: 0.0,
                reactive_kvar: 0.0,
                enabled: false,
                fail_writes: 0,
            })),
            rated_kw,
        }
    }

    pub async fn commanded_power_kw(&self) -> f64 {
        self.state.read().await.power_kw
    }

    /// Make the next `count` power writes fail (test hook)
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.write().await.fail_writes = count;
    }
}

#[async_trait]
impl Inverter for SimulatedInverter {
    async fn read_state(&self) -> Result<InverterState, InverterError> {
        let st = self.state.read().await;
        let dc_voltage_v = 600.0;
        let power_abs = st.power_kw.abs();
        let dc_power_kw = power_abs * 1.05;
        let efficiency = if dc_power_kw > 0.0 {
            power_abs / dc_power_kw * 100.0
        } else {
            0.0
        };

        Ok(InverterState {
            ac_power_kw: st.power_kw,
            reactive_power_kvar: st.reactive_kvar,
            ac_voltage_v: 415.0,
            ac_current_a: if power_abs > 0.0 {
                power_abs / 0.415 / 1.732
            } else {
                0.0
            },
            ac_frequency_hz: 50.0,
            dc_voltage_v,
            dc_current_a: dc_power_kw * 1000.0 / dc_voltage_v,
            temperature_c: 40.0,
            status: if st.enabled {
                InverterStatus::Mppt
            } else {
                InverterStatus::Off
            },
            efficiency_percent: efficiency,
        })
    }

    async fn set_power(&self, power_kw: f64) -> Result<(), InverterError> {
        if !power_kw.is_finite() {
            return Err(InverterError::InvalidCommand(power_kw));
        }
        let mut st = self.state.write().await;
        if st.fail_writes > 0 {
            st.fail_writes -= 1;
            return Err(InverterError::Communication(
                "simulated write failure".to_string(),
            ));
        }
        st.power_kw = power_kw.clamp(-self.rated_kw, self.rated_kw);
        Ok(())
    }

    async fn set_reactive_power(&self, power_kvar: f64) -> Result<(), InverterError> {
        if !power_kvar.is_finite() {
            return Err(InverterError::InvalidCommand(power_kvar));
        }
        self.state.write().await.reactive_kvar = power_kvar;
        Ok(())
    }

    async fn enable(&self) -> Result<(), InverterError> {
        self.state.write().await.enabled = true;
        Ok(())
    }

    async fn disable(&self) -> Result<(), InverterError> {
        let mut st = self.state.write().await;
        st.enabled = false;
        st.power_kw = 0.0;
        Ok(())
    }

    fn rated_kw(&self) -> f64 {
        self.rated_kw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_power_clamps_to_rating() {
        let inv = SimulatedInverter::new(100.0);
        inv.enable().await.unwrap();
        inv.set_power(150.0).await.unwrap();
        assert_eq!(inv.commanded_power_kw().await, 100.0);
        inv.set_power(-150.0).await.unwrap();
        assert_eq!(inv.commanded_power_kw().await, -100.0);
    }

    #[tokio::test]
    async fn non_finite_command_rejected() {
        let inv = SimulatedInverter::new(100.0);
        assert!(inv.set_power(f64::NAN).await.is_err());
    }

    #[tokio::test]
    async fn disable_zeroes_power() {
        let inv = SimulatedInverter::new(100.0);
        inv.enable().await.unwrap();
        inv.set_power(50.0).await.unwrap();
        inv.disable().await.unwrap();
        assert_eq!(inv.commanded_power_kw().await, 0.0);
        let state = inv.read_state().await.unwrap();
        assert_eq!(state.status, InverterStatus::Off);
    }

    #[tokio::test]
    async fn injected_write_failures_surface() {
        let inv = SimulatedInverter::new(100.0);
        inv.fail_next_writes(2).await;
        assert!(inv.set_power(10.0).await.is_err());
        assert!(inv.set_power(10.0).await.is_err());
        assert!(inv.set_power(10.0).await.is_ok());
    }

    #[test]
    fn status_register_decode() {
        assert_eq!(InverterStatus::from_register(4), InverterStatus::Mppt);
        assert_eq!(InverterStatus::from_register(7), InverterStatus::Fault);
        assert_eq!(InverterStatus::from_register(99), InverterStatus::Off);
    }
}
