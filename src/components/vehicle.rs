//! Vehicles and their types.

use chrono::NaiveDateTime;

use crate::components::battery::Battery;
use crate::components::curve::PowerCurve;

/// Static parameters shared by all vehicles of one model.
#[derive(Debug, Clone)]
pub struct VehicleType {
    pub name: String,
    /// Battery capacity in kWh.
    pub capacity: f64,
    /// SOC-dependent maximum charging power.
    pub charging_curve: PowerCurve,
    /// Charging requests below this power collapse to 0 (kW).
    pub min_charging_power: f64,
    /// Whether vehicles of this type may feed power back to the grid.
    pub v2g: bool,
    /// Lowest SOC a V2G discharge may draw the battery down to.
    pub discharge_limit: f64,
    /// SOC-dependent maximum discharging power.
    pub discharge_curve: PowerCurve,
}

impl VehicleType {
    /// # Panics
    ///
    /// Panics if `min_charging_power` exceeds the charging curve's peak or
    /// `discharge_limit` is outside [0, 1].
    pub fn new(
        name: impl Into<String>,
        capacity: f64,
        charging_curve: PowerCurve,
        min_charging_power: f64,
    ) -> Self {
        assert!(
            min_charging_power <= charging_curve.max_power(),
            "min_charging_power above curve peak"
        );
        let discharge_curve = charging_curve.clone();
        Self {
            name: name.into(),
            capacity,
            charging_curve,
            min_charging_power,
            v2g: false,
            discharge_limit: 0.5,
            discharge_curve,
        }
    }

    pub fn with_v2g(mut self, discharge_limit: f64, discharge_curve: Option<PowerCurve>) -> Self {
        assert!((0.0..=1.0).contains(&discharge_limit), "discharge_limit out of range");
        self.v2g = true;
        self.discharge_limit = discharge_limit;
        if let Some(curve) = discharge_curve {
            self.discharge_curve = curve;
        }
        self
    }
}

/// One vehicle of the fleet, with its owned battery.
///
/// Mutated only while connected; the connection itself is driven by arrival
/// and departure events.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub kind: VehicleType,
    /// Station the vehicle is plugged into; `None` while away.
    pub connected_charging_station: Option<String>,
    pub estimated_time_of_arrival: Option<NaiveDateTime>,
    pub estimated_time_of_departure: Option<NaiveDateTime>,
    /// SOC the vehicle must reach before its next departure.
    pub desired_soc: f64,
    /// Per-vehicle target power for the individual sub-strategy (kW).
    pub schedule: Option<f64>,
    pub battery: Battery,
}

impl Vehicle {
    pub fn new(kind: VehicleType, soc: f64, desired_soc: f64, efficiency: f64) -> Self {
        let battery = Battery::new(
            kind.capacity,
            soc,
            efficiency,
            kind.charging_curve.clone(),
            kind.discharge_curve.clone(),
        );
        Self {
            kind,
            connected_charging_station: None,
            estimated_time_of_arrival: None,
            estimated_time_of_departure: None,
            desired_soc,
            schedule: None,
            battery,
        }
    }

    /// SOC still missing to the desired SOC (negative once surpassed).
    pub fn delta_soc(&self) -> f64 {
        self.desired_soc - self.battery.soc
    }
}
