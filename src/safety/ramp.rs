//! Power ramp limiting (dP/dt constraint)
//!
//! Sudden setpoint steps stress the inverter and can trip protection, so
//! every commanded transition is bounded to a configured kW/s rate. The
//! limiter is fed an explicit time delta by its caller, which keeps the
//! control path deterministic and testable.

/// Rate-limits transitions between power setpoints
#[derive(Debug, Clone)]
pub struct RampLimiter {
    rate_kw_per_s: f64,
    last_kw: f64,
}

impl RampLimiter {
    pub fn new(rate_kw_per_s: f64) -> Self {
        Self {
            rate_kw_per_s: rate_kw_per_s.max(0.0),
            last_kw: 0.0,
        }
    }

    pub fn with_initial(rate_kw_per_s: f64, initial_kw: f64) -> Self {
        Self {
            rate_kw_per_s: rate_kw_per_s.max(0.0),
            last_kw: initial_kw,
        }
    }

    pub fn last_kw(&self) -> f64 {
        self.last_kw
    }

    pub fn rate_kw_per_s(&self) -> f64 {
        self.rate_kw_per_s
    }

    /// Advance one step toward `target_kw`, bounded by rate * dt
    ///
    /// Returns the value to command this step and records it as the new
    /// reference point.
    pub fn step(&mut self, target_kw: f64, dt_s: f64) -> f64 {
        if !target_kw.is_finite() || dt_s <= 0.0 {
            return self.last_kw;
        }

        let max_delta = self.rate_kw_per_s * dt_s;
        let delta = target_kw - self.last_kw;
        let applied = if delta.abs() <= max_delta {
            target_kw
        } else {
            self.last_kw + max_delta * delta.signum()
        };

        self.last_kw = applied;
        applied
    }

    /// Bypass the ramp (emergency transitions)
    pub fn force(&mut self, kw: f64) {
        self.last_kw = kw;
    }

    pub fn reset(&mut self) {
        self.last_kw = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_step_applied_directly() {
        let mut ramp = RampLimiter::new(10.0);
        assert_eq!(ramp.step(5.0, 1.0), 5.0);
    }

    #[test]
    fn large_step_is_rate_limited() {
        let mut ramp = RampLimiter::new(10.0);
        assert_eq!(ramp.step(100.0, 1.0), 10.0);
        assert_eq!(ramp.step(100.0, 1.0), 20.0);
    }

    #[test]
    fn ramp_down_symmetric() {
        let mut ramp = RampLimiter::with_initial(10.0, 50.0);
        assert_eq!(ramp.step(-50.0, 1.0), 40.0);
    }

    #[test]
    fn fractional_dt_scales_step() {
        // 100 kW/s at dt = 0.1 s allows a 10 kW step
        let mut ramp = RampLimiter::new(100.0);
        assert_eq!(ramp.step(56.0, 0.1), 10.0);
        assert_eq!(ramp.step(56.0, 0.1), 20.0);
    }

    #[test]
    fn converges_to_target() {
        let mut ramp = RampLimiter::new(100.0);
        let mut commanded = 0.0;
        for _ in 0..6 {
            commanded = ramp.step(56.0, 0.1);
        }
        assert_eq!(commanded, 56.0);
    }

    #[test]
    fn force_bypasses_rate() {
        let mut ramp = RampLimiter::new(1.0);
        ramp.force(500.0);
        assert_eq!(ramp.last_kw(), 500.0);
    }

    #[test]
    fn non_finite_target_holds_last() {
        let mut ramp = RampLimiter::with_initial(10.0, 5.0);
        assert_eq!(ramp.step(f64::NAN, 1.0), 5.0);
    }
}
