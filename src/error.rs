//! Error taxonomy for scenario setup and simulation runs.
//!
//! Fatal conditions terminate the run immediately; there is no partial-result
//! recovery. Soft anomalies (events outside the horizon, absent vehicles with
//! warnings enabled) are logged via `tracing` instead and never appear here.

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid scenario setup, detected before the first step.
    #[error("scenario configuration error: {0}")]
    Config(String),

    /// An event references a grid connector the scenario does not define.
    #[error("unknown grid connector `{0}`")]
    UnknownConnector(String),

    /// An event references a vehicle the scenario does not define.
    #[error("unknown vehicle `{0}`")]
    UnknownVehicle(String),

    /// A vehicle left the charging station below its desired SOC.
    #[error("{time}: vehicle {vehicle} departs below desired SOC ({soc:.3} < {desired:.3})")]
    DepartureBelowDesiredSoc {
        vehicle: String,
        time: NaiveDateTime,
        soc: f64,
        desired: f64,
    },

    /// The consumption en route claimed more energy than the battery held.
    #[error("{time}: vehicle {vehicle} arrives with negative SOC ({soc:.3}, delta {soc_delta:.3})")]
    NegativeSocOnArrival {
        vehicle: String,
        time: NaiveDateTime,
        soc: f64,
        soc_delta: f64,
    },

    /// A connector has no active tariff after event application.
    #[error("{time}: connector {connector} has no associated cost")]
    MissingCost {
        connector: String,
        time: NaiveDateTime,
    },

    /// A vehicle is not connected during core standing time and warnings are
    /// not enabled.
    #[error("{time}: vehicle {vehicle} not available during core standing time")]
    AbsentDuringStandingTime {
        vehicle: String,
        time: NaiveDateTime,
    },

    /// A charging station was commanded above its rated maximum.
    #[error("{time}: station {station} over maximum load ({power:.2} > {max_power:.2} kW)")]
    StationOverMaxPower {
        station: String,
        time: NaiveDateTime,
        power: f64,
        max_power: f64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("scenario file error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type SimResult<T> = Result<T, SimError>;
