//! Charging stations.

/// A charging point attached to a grid connector.
///
/// `current_power` is transient interval state: reset to 0 at the start of
/// every step and accumulated as the schedule strategy issues commands.
#[derive(Debug, Clone)]
pub struct ChargingStation {
    /// Rated maximum power (kW).
    pub max_power: f64,
    /// Minimum power the station can deliver while active (kW).
    pub min_power: f64,
    /// Identifier of the owning grid connector.
    pub parent: String,
    /// Power committed to this station in the current interval (kW).
    pub current_power: f64,
}

impl ChargingStation {
    /// # Panics
    ///
    /// Panics if `max_power` is not positive or `min_power` is negative or
    /// above `max_power`.
    pub fn new(max_power: f64, min_power: f64, parent: impl Into<String>) -> Self {
        assert!(max_power > 0.0, "max_power must be positive");
        assert!(
            (0.0..=max_power).contains(&min_power),
            "min_power out of range"
        );
        Self {
            max_power,
            min_power,
            parent: parent.into(),
            current_power: 0.0,
        }
    }

    /// Fits a requested power into this station's limits for a vehicle with
    /// the given minimum charging power.
    ///
    /// Requests below the larger of the two minimum powers collapse to 0
    /// (the hardware cannot deliver them); otherwise the request is capped
    /// at the headroom left this interval.
    pub fn clamp_power(&self, power: f64, vehicle_min_power: f64) -> f64 {
        let min_power = self.min_power.max(vehicle_min_power);
        if power < min_power {
            0.0
        } else {
            power.min(self.max_power - self.current_power).max(0.0)
        }
    }
}
