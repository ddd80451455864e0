pub mod manager;
pub mod persist;
pub mod ramp;

pub use manager::{
    ResetRefused, RuntimeState, SafetyAction, SafetyLevel, SafetyManager, SafetySample,
    SafetyViolation,
};
pub use persist::PersistedSafetyState;
pub use ramp::RampLimiter;
