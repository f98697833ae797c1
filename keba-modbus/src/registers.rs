//! The fixed KEBA register map.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

/// Electrical phase of a per-phase measurement register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    /// Value of the `phase` label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::L1 => "1",
            Phase::L2 => "2",
            Phase::L3 => "3",
        }
    }
}

/// Label name used to distinguish per-phase series of one metric.
pub const PHASE_LABEL: &str = "phase";

/// Description of a single holding register and how its raw value maps to a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterSpec {
    /// Register address on the device.
    pub address: u16,
    /// Stable semantic identifier, unique per register.
    pub name: &'static str,
    /// Metric the value is published under. Phase registers share one metric.
    pub metric: &'static str,
    /// Phase label for per-phase registers.
    pub phase: Option<Phase>,
    /// Divisor applied to the raw value before publishing.
    pub scale: u32,
    /// Help text exposed with the metric.
    pub help: &'static str,
}

impl RegisterSpec {
    const fn plain(address: u16, name: &'static str, help: &'static str) -> Self {
        Self {
            address,
            name,
            metric: name,
            phase: None,
            scale: 1,
            help,
        }
    }

    const fn scaled(address: u16, name: &'static str, scale: u32, help: &'static str) -> Self {
        Self {
            address,
            name,
            metric: name,
            phase: None,
            scale,
            help,
        }
    }

    const fn phased(
        address: u16,
        name: &'static str,
        metric: &'static str,
        phase: Phase,
        help: &'static str,
    ) -> Self {
        Self {
            address,
            name,
            metric,
            phase: Some(phase),
            scale: 1,
            help,
        }
    }

    /// Apply the unit scaling to a raw register value.
    pub fn scale_value(&self, raw: i32) -> f64 {
        f64::from(raw) / f64::from(self.scale)
    }

    /// Labels attached to this register's series.
    pub fn labels(&self) -> Vec<(&'static str, &'static str)> {
        match self.phase {
            Some(phase) => vec![(PHASE_LABEL, phase.as_str())],
            None => Vec::new(),
        }
    }
}

const CURRENT_HELP: &str =
    "The register 1008,1010,1012 contains the measured current value on the phase in milliamperes.";
const VOLTAGE_HELP: &str =
    "The register 1040,1042,1044 contains the measured voltage value on the phase in volts.";

/// The KEBA KeContact register map in polling order.
static KEBA_REGISTERS: [RegisterSpec; 18] = [
    RegisterSpec::plain(
        1000,
        "charging_state",
        "The register 1000 contains the state of the charging station.",
    ),
    RegisterSpec::plain(
        1004,
        "cable_state",
        "The register 1004 contains the state of the charging cable.",
    ),
    RegisterSpec::plain(
        1006,
        "error_code",
        "The register 1006 contains the error code of the charging station.",
    ),
    RegisterSpec::plain(
        1014,
        "serial_number",
        "The register 1014 contains the serial number of the charging station.",
    ),
    RegisterSpec::plain(
        1016,
        "product_type_and_features",
        "The register 1016 contains the type and the most important features of the charging station.",
    ),
    RegisterSpec::plain(
        1018,
        "firmware_version",
        "The register 1018 contains the firmware version of the charging station. \
         The value is decimal and has to be converted to hex to read the firmware version.",
    ),
    RegisterSpec::plain(
        1020,
        "active_power_mW",
        "The register 1020 contains the active power in milliwatts.",
    ),
    RegisterSpec::scaled(
        1036,
        "total_energy_counter_Wh",
        10,
        "The register 1036 contains the total energy counter in Wh.",
    ),
    RegisterSpec::plain(
        1046,
        "power_factor_percent",
        "The register 1046 contains the current power factor (cos phi) in 0.1 %.",
    ),
    RegisterSpec::plain(
        1100,
        "max_charging_current_mAh",
        "The register 1100 contains the maximum charging current of the charging station.",
    ),
    RegisterSpec::plain(
        1110,
        "max_supported_current_mAh",
        "The register 1110 contains the maximum current value that can be supported by the hardware \
         of the charging station. This value represents the minimum of the DIP switch settings, \
         cable coding and temperature monitoring function.",
    ),
    RegisterSpec::scaled(
        1502,
        "charged_energy_Wh",
        10,
        "The register 1502 contains the transferred energy of the current charging session.",
    ),
    RegisterSpec::phased(
        1008,
        "charging_current_phase_1_mAh",
        "charging_current_phase_mAh",
        Phase::L1,
        CURRENT_HELP,
    ),
    RegisterSpec::phased(
        1010,
        "charging_current_phase_2_mAh",
        "charging_current_phase_mAh",
        Phase::L2,
        CURRENT_HELP,
    ),
    RegisterSpec::phased(
        1012,
        "charging_current_phase_3_mAh",
        "charging_current_phase_mAh",
        Phase::L3,
        CURRENT_HELP,
    ),
    RegisterSpec::phased(
        1040,
        "voltage_phase_1_V",
        "voltage_phase_V",
        Phase::L1,
        VOLTAGE_HELP,
    ),
    RegisterSpec::phased(
        1042,
        "voltage_phase_2_V",
        "voltage_phase_V",
        Phase::L2,
        VOLTAGE_HELP,
    ),
    RegisterSpec::phased(
        1044,
        "voltage_phase_3_V",
        "voltage_phase_V",
        Phase::L3,
        VOLTAGE_HELP,
    ),
];

/// Errors raised when building a custom register table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterTableError {
    #[error("Register table is empty")]
    Empty,
    #[error("Duplicate register address {0}")]
    DuplicateAddress(u16),
    #[error("Register {0} has a zero scale")]
    ZeroScale(u16),
}

/// A metric published by the table, with the registers feeding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub help: &'static str,
    /// Phases published under this metric; empty for single-series metrics.
    pub phases: Vec<Phase>,
}

/// Immutable, ordered register catalog shared by the engine and the sink.
#[derive(Debug, Clone)]
pub struct RegisterTable {
    specs: Arc<[RegisterSpec]>,
}

impl RegisterTable {
    /// The KEBA register map.
    pub fn keba() -> Self {
        Self {
            specs: Arc::from(&KEBA_REGISTERS[..]),
        }
    }

    /// Build a custom table, rejecting duplicate addresses and zero scales.
    pub fn new(specs: Vec<RegisterSpec>) -> Result<Self, RegisterTableError> {
        if specs.is_empty() {
            return Err(RegisterTableError::Empty);
        }

        let mut seen = HashSet::with_capacity(specs.len());
        for spec in &specs {
            if !seen.insert(spec.address) {
                return Err(RegisterTableError::DuplicateAddress(spec.address));
            }
            if spec.scale == 0 {
                return Err(RegisterTableError::ZeroScale(spec.address));
            }
        }

        Ok(Self {
            specs: Arc::from(specs),
        })
    }

    /// All registers in polling order.
    pub fn list(&self) -> &[RegisterSpec] {
        &self.specs
    }

    /// Find the register at `address`.
    pub fn lookup(&self, address: u16) -> Option<&RegisterSpec> {
        self.specs.iter().find(|spec| spec.address == address)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Distinct metrics in first-appearance order.
    pub fn metrics(&self) -> Vec<MetricDescriptor> {
        let mut metrics: Vec<MetricDescriptor> = Vec::new();

        for spec in self.specs.iter() {
            let index = match metrics.iter().position(|m| m.name == spec.metric) {
                Some(index) => index,
                None => {
                    metrics.push(MetricDescriptor {
                        name: spec.metric,
                        help: spec.help,
                        phases: Vec::new(),
                    });
                    metrics.len() - 1
                }
            };

            if let Some(phase) = spec.phase {
                metrics[index].phases.push(phase);
            }
        }

        metrics
    }
}

impl Default for RegisterTable {
    fn default() -> Self {
        Self::keba()
    }
}
