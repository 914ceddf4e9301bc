//! TOML-based scenario description.
//!
//! This is the parse-only layer: serde structs mirroring the scenario file.
//! [`crate::scenario`] validates the description and builds the runtime
//! state from it; nothing here is consulted again after that.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::components::Cost;
use crate::error::SimResult;

/// Top-level scenario description parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Simulation timing and strategy selection.
    pub simulation: SimulationConfig,
    /// Recurring standing-time window description.
    #[serde(default)]
    pub core_standing_time: Option<CoreStandingTimeConfig>,
    pub grid_connectors: BTreeMap<String, GridConnectorConfig>,
    #[serde(default)]
    pub charging_stations: BTreeMap<String, ChargingStationConfig>,
    #[serde(default)]
    pub vehicle_types: BTreeMap<String, VehicleTypeConfig>,
    #[serde(default)]
    pub vehicles: BTreeMap<String, VehicleConfig>,
    #[serde(default)]
    pub batteries: BTreeMap<String, BatteryConfig>,
    #[serde(default)]
    pub events: EventsConfig,
}

impl ScenarioConfig {
    /// Loads a scenario description from a TOML file.
    pub fn from_toml_file(path: &Path) -> SimResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parses a scenario description from a TOML string.
    pub fn from_toml_str(raw: &str) -> SimResult<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// Simulation timing and strategy selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// First simulated interval (ISO 8601, e.g. `"2026-03-02T21:00:00"`).
    pub start_time: NaiveDateTime,
    /// Interval length in minutes.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: i64,
    /// Number of intervals to simulate.
    pub n_intervals: usize,
    /// Sub-strategy: `"collective"` or `"individual"`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Warn instead of aborting when a vehicle is absent during core
    /// standing time.
    #[serde(default)]
    pub warn_core_standing_time: bool,
}

fn default_interval_minutes() -> i64 {
    15
}

fn default_strategy() -> String {
    "collective".to_owned()
}

/// One daily time window, `"HH:MM"` or `"HH:MM:SS"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeWindowConfig {
    pub start: String,
    pub end: String,
}

/// Standing-time description: daily windows plus whole no-drive weekdays.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreStandingTimeConfig {
    #[serde(default)]
    pub times: Vec<TimeWindowConfig>,
    /// Weekday names, e.g. `["Sat", "Sun"]`.
    #[serde(default)]
    pub no_drive_days: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConnectorConfig {
    /// Hard power cap in kW; omit for an unlimited connector.
    #[serde(default)]
    pub max_power: Option<f64>,
    /// Initial tariff, if known before the first operator signal.
    #[serde(default)]
    pub cost: Option<Cost>,
    /// Initial schedule target in kW.
    #[serde(default)]
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChargingStationConfig {
    pub max_power: f64,
    #[serde(default)]
    pub min_power: f64,
    /// Identifier of the owning grid connector.
    pub parent: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleTypeConfig {
    /// Battery capacity in kWh.
    pub capacity: f64,
    /// `(soc, power_kw)` support points.
    pub charging_curve: Vec<[f64; 2]>,
    #[serde(default)]
    pub min_charging_power: f64,
    #[serde(default)]
    pub v2g: bool,
    #[serde(default = "default_discharge_limit")]
    pub discharge_limit: f64,
    /// Discharge curve; defaults to the charging curve.
    #[serde(default)]
    pub discharge_curve: Option<Vec<[f64; 2]>>,
}

fn default_discharge_limit() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleConfig {
    pub vehicle_type: String,
    /// Initial state of charge.
    #[serde(default)]
    pub soc: f64,
    #[serde(default = "default_desired_soc")]
    pub desired_soc: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    #[serde(default)]
    pub connected_charging_station: Option<String>,
    #[serde(default)]
    pub estimated_time_of_arrival: Option<NaiveDateTime>,
    #[serde(default)]
    pub estimated_time_of_departure: Option<NaiveDateTime>,
    /// Initial per-vehicle schedule value (individual sub-strategy).
    #[serde(default)]
    pub schedule: Option<f64>,
}

fn default_desired_soc() -> f64 {
    1.0
}

fn default_efficiency() -> f64 {
    0.95
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatteryConfig {
    /// Identifier of the owning grid connector.
    pub parent: String,
    pub capacity: f64,
    #[serde(default)]
    pub soc: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    pub charging_curve: Vec<[f64; 2]>,
    #[serde(default)]
    pub discharge_curve: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    pub min_charging_power: f64,
}

/// Event sources of the scenario.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Named fixed-load series (building load, …), causal foresight.
    #[serde(default)]
    pub fixed_load: BTreeMap<String, SeriesConfig>,
    /// Named generation series (PV, …), perfectly foreseeable.
    #[serde(default)]
    pub local_generation: BTreeMap<String, SeriesConfig>,
    /// Inline grid-operator signals.
    #[serde(default)]
    pub grid_operator_signals: Vec<GridSignalConfig>,
    /// Day-ahead price column.
    #[serde(default)]
    pub energy_price_from_csv: Option<PriceCsvConfig>,
    /// Dense schedule table, compressed to change signals.
    #[serde(default)]
    pub schedule_from_csv: Option<ScheduleCsvConfig>,
    /// Inline arrival/departure/schedule events.
    #[serde(default)]
    pub vehicle_events: Vec<VehicleEventConfig>,
}

/// A periodic value series, inline or sourced from a CSV column.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeriesConfig {
    pub start_time: NaiveDateTime,
    pub step_duration_s: f64,
    pub grid_connector_id: String,
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default)]
    pub csv_file: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridSignalConfig {
    pub signal_time: NaiveDateTime,
    pub start_time: NaiveDateTime,
    pub grid_connector_id: String,
    #[serde(default)]
    pub max_power: Option<f64>,
    #[serde(default)]
    pub cost: Option<Cost>,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub window: Option<bool>,
    #[serde(default)]
    pub capacity: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriceCsvConfig {
    pub csv_file: String,
    pub column: String,
    pub start_time: NaiveDateTime,
    pub step_duration_s: f64,
    pub grid_connector_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleCsvConfig {
    pub csv_file: String,
    /// Target column name.
    pub column: String,
    #[serde(default = "default_window_column")]
    pub window_column: String,
    /// Optional; falls back to the first parseable row timestamp.
    #[serde(default)]
    pub start_time: Option<NaiveDateTime>,
    pub step_duration_s: f64,
    pub grid_connector_id: String,
    /// Treat remaining columns as per-vehicle schedule columns.
    #[serde(default)]
    pub individual: bool,
}

fn default_window_column() -> String {
    "charge".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleEventConfig {
    pub signal_time: NaiveDateTime,
    pub start_time: NaiveDateTime,
    pub vehicle_id: String,
    /// `"arrival"`, `"departure"` or `"schedule"`.
    pub event_type: String,
    #[serde(default)]
    pub update: VehicleUpdateFields,
}

/// Field-level update map of a vehicle event. Which fields are required
/// depends on the event type; [`crate::scenario`] validates that.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleUpdateFields {
    #[serde(default)]
    pub connected_charging_station: Option<String>,
    #[serde(default)]
    pub soc_delta: Option<f64>,
    #[serde(default)]
    pub desired_soc: Option<f64>,
    #[serde(default)]
    pub estimated_time_of_arrival: Option<NaiveDateTime>,
    #[serde(default)]
    pub estimated_time_of_departure: Option<NaiveDateTime>,
    #[serde(default)]
    pub schedule: Option<f64>,
}
