//! World-state entities: batteries, curves, connectors, stations, vehicles.

pub mod battery;
pub mod connector;
pub mod curve;
pub mod station;
pub mod vehicle;

pub use battery::{Battery, ChargeResult};
pub use connector::{Cost, GridConnector, WeekProfile};
pub use curve::PowerCurve;
pub use station::ChargingStation;
pub use vehicle::{Vehicle, VehicleType};

/// A depot-side stationary battery attached to a grid connector.
#[derive(Debug, Clone)]
pub struct StationaryBattery {
    /// Identifier of the owning grid connector.
    pub parent: String,
    /// Charge requests below this power are dropped to 0 (kW).
    pub min_charging_power: f64,
    pub battery: Battery,
}

impl StationaryBattery {
    pub fn new(parent: impl Into<String>, min_charging_power: f64, battery: Battery) -> Self {
        assert!(min_charging_power >= 0.0, "min_charging_power must be non-negative");
        Self {
            parent: parent.into(),
            min_charging_power,
            battery,
        }
    }
}
