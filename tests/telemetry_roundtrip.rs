//! Telemetry schema round-trip: encoding then decoding yields an object
//! equal field-by-field (floats within 1e-6 relative)

use chrono::Utc;

use vpp_controller::domain::types::{
    BmsTelemetry, InverterTelemetry, SafetyTelemetry, StatusFlags,
};
use vpp_controller::domain::TelemetryReport;
use vpp_controller::safety::{SafetyAction, SafetyLevel, SafetyViolation};

fn close(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= 1e-6 * a.abs().max(b.abs())
}

fn full_report() -> TelemetryReport {
    TelemetryReport {
        node_id: "BESS_DC01_01".to_string(),
        campus_id: "CAMPUS_MUMBAI_ANDHERI".to_string(),
        ts: Utc::now(),
        soc: Some(80.5),
        soh: Some(95.123456),
        voltage: Some(58.4),
        current: Some(-12.5),
        temperature: Some(25.3),
        power_kw: Some(-50.0),
        reactive_power_kvar: Some(0.5),
        frequency: Some(49.98),
        capacity_kwh: 200.0,
        max_power_kw: 100.0,
        cycle_count: Some(152),
        status: StatusFlags {
            enabled: true,
            online: true,
            alarms_bitmask: 0x0003,
            faults_bitmask: 0x0000,
        },
        bms: Some(BmsTelemetry {
            pack_voltage: 58.4,
            pack_current: -12.5,
            min_cell_voltage: 3.648,
            max_cell_voltage: 3.653,
            voltage_delta: 0.005,
            max_cell_temperature: Some(25.5),
            is_balanced: true,
            num_cells: 16,
            critical_fault: false,
            warnings: true,
        }),
        inverter: Some(InverterTelemetry {
            ac_power_kw: -50.0,
            ac_voltage: 415.0,
            ac_current: 69.56,
            ac_frequency: 49.98,
            dc_voltage: 600.0,
            dc_current: 87.5,
            efficiency: 95.2,
            temperature: 41.2,
            status: "mppt".to_string(),
        }),
        safety: SafetyTelemetry {
            emergency_stopped: false,
            power_reduction_factor: 0.5,
            violations: vec![SafetyViolation {
                timestamp: Utc::now(),
                level: SafetyLevel::Warn,
                category: "cell_imbalance".to_string(),
                message: "Cell voltage imbalance: 0.120V > 0.100V".to_string(),
                value: Some(0.12),
                limit: Some(0.1),
                action: SafetyAction::ReducePower,
            }],
        },
    }
}

#[test]
fn report_round_trips_field_by_field() {
    let original = full_report();
    let json = serde_json::to_string(&original).unwrap();
    let decoded: TelemetryReport = serde_json::from_str(&json).unwrap();

    assert_eq!(decoded.node_id, original.node_id);
    assert_eq!(decoded.campus_id, original.campus_id);
    assert_eq!(decoded.ts, original.ts);
    assert!(close(decoded.soc.unwrap(), original.soc.unwrap()));
    assert!(close(decoded.soh.unwrap(), original.soh.unwrap()));
    assert!(close(decoded.current.unwrap(), original.current.unwrap()));
    assert!(close(decoded.power_kw.unwrap(), original.power_kw.unwrap()));
    assert!(close(decoded.frequency.unwrap(), original.frequency.unwrap()));
    assert_eq!(decoded.cycle_count, original.cycle_count);
    assert_eq!(decoded.status, original.status);
    assert_eq!(decoded.bms.as_ref().unwrap(), original.bms.as_ref().unwrap());
    assert_eq!(
        decoded.inverter.as_ref().unwrap(),
        original.inverter.as_ref().unwrap()
    );
    assert_eq!(
        decoded.safety.emergency_stopped,
        original.safety.emergency_stopped
    );
    assert!(close(
        decoded.safety.power_reduction_factor,
        original.safety.power_reduction_factor
    ));
    assert_eq!(decoded.safety.violations.len(), 1);
    assert_eq!(decoded.safety.violations[0].category, "cell_imbalance");
}

#[test]
fn absent_fields_survive_the_round_trip_as_absent() {
    let mut original = full_report();
    original.soc = None;
    original.temperature = None;
    original.bms = None;

    let json = serde_json::to_string(&original).unwrap();
    // Keys remain present with null values
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value.get("soc").unwrap().is_null());
    assert!(value.get("bms").unwrap().is_null());

    let decoded: TelemetryReport = serde_json::from_str(&json).unwrap();
    assert!(decoded.soc.is_none());
    assert!(decoded.temperature.is_none());
    assert!(decoded.bms.is_none());
}

#[test]
fn unknown_extra_fields_are_tolerated() {
    let mut value = serde_json::to_value(full_report()).unwrap();
    value["vendor_extension"] = serde_json::json!({"foo": 1});
    let decoded: Result<TelemetryReport, _> = serde_json::from_value(value);
    assert!(decoded.is_ok());
}

#[test]
fn missing_required_field_is_rejected() {
    let mut value = serde_json::to_value(full_report()).unwrap();
    value.as_object_mut().unwrap().remove("node_id");
    let decoded: Result<TelemetryReport, _> = serde_json::from_value(value);
    assert!(decoded.is_err());
}
