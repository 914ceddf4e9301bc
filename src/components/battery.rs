//! Battery charge/discharge integration.

use chrono::TimeDelta;

use crate::components::curve::PowerCurve;

/// Outcome of one charge or discharge call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeResult {
    /// Grid-side power averaged over the full requested duration (kW,
    /// positive magnitude for both directions).
    pub avg_power: f64,
    /// Signed SOC change (negative when discharging).
    pub soc_delta: f64,
}

/// A battery with SOC-dependent power limits and a single round-trip split
/// efficiency.
///
/// Charging stores `power * efficiency`; discharging drains
/// `power / efficiency` for every kWh delivered, so the energy available at
/// the grid side is `soc * capacity * efficiency`.
///
/// Owned exclusively by its vehicle or stationary-battery wrapper; all
/// mutation happens through [`Battery::load`]-family calls.
#[derive(Debug, Clone)]
pub struct Battery {
    /// Usable capacity in kWh.
    pub capacity: f64,
    /// State of charge, fraction of capacity in [0, 1].
    pub soc: f64,
    /// Charge/discharge efficiency in (0, 1].
    pub efficiency: f64,
    /// Maximum charging power by SOC.
    pub charging_curve: PowerCurve,
    /// Maximum discharging power by SOC.
    pub discharge_curve: PowerCurve,
}

/// Integration substep resolution: one simulated minute.
const SUBSTEP_SECS: i64 = 60;

impl Battery {
    /// Creates a battery.
    ///
    /// # Panics
    ///
    /// Panics if capacity is not positive, SOC is out of [0, 1], or
    /// efficiency is out of (0, 1].
    pub fn new(
        capacity: f64,
        soc: f64,
        efficiency: f64,
        charging_curve: PowerCurve,
        discharge_curve: PowerCurve,
    ) -> Self {
        assert!(capacity > 0.0, "capacity must be positive");
        assert!((0.0..=1.0).contains(&soc), "SOC out of range");
        assert!(
            efficiency > 0.0 && efficiency <= 1.0,
            "efficiency out of range"
        );
        Self {
            capacity,
            soc,
            efficiency,
            charging_curve,
            discharge_curve,
        }
    }

    /// Charges for `dt`, following the charging curve capped at `max_power`,
    /// stopping once `target_soc` is reached.
    pub fn load(&mut self, dt: TimeDelta, max_power: f64, target_soc: f64) -> ChargeResult {
        self.integrate(dt, |curve_power| curve_power.min(max_power), target_soc, true)
    }

    /// Charges for `dt` at a constant `target_power` (still capped by the
    /// charging curve in each substep), up to a full battery.
    pub fn load_constant(&mut self, dt: TimeDelta, target_power: f64) -> ChargeResult {
        self.integrate(dt, |curve_power| curve_power.min(target_power), 1.0, true)
    }

    /// Discharges for `dt`, following the discharge curve capped at
    /// `max_power`, never drawing the SOC below `floor_soc`.
    pub fn unload(&mut self, dt: TimeDelta, max_power: f64, floor_soc: f64) -> ChargeResult {
        self.integrate(dt, |curve_power| curve_power.min(max_power), floor_soc, false)
    }

    /// Discharges for `dt` at a constant `target_power`, down to an empty
    /// battery at most.
    pub fn unload_constant(&mut self, dt: TimeDelta, target_power: f64) -> ChargeResult {
        self.integrate(dt, |curve_power| curve_power.min(target_power), 0.0, false)
    }

    /// Grid-side power this battery could sustain over `dt` if fully
    /// discharged, without mutating it.
    pub fn available_power(&self, dt: TimeDelta) -> f64 {
        let mut sim = self.clone();
        sim.unload(dt, self.discharge_curve.max_power(), 0.0).avg_power
    }

    /// Advances SOC over `dt` in minute-sized substeps. `limit` maps the
    /// curve power of the current substep to the applied power.
    fn integrate(
        &mut self,
        dt: TimeDelta,
        limit: impl Fn(f64) -> f64,
        target_soc: f64,
        charging: bool,
    ) -> ChargeResult {
        let old_soc = self.soc;
        let total_secs = dt.num_seconds();
        if total_secs <= 0 {
            return ChargeResult {
                avg_power: 0.0,
                soc_delta: 0.0,
            };
        }
        let hours = total_secs as f64 / 3600.0;
        let substeps = ((total_secs + SUBSTEP_SECS - 1) / SUBSTEP_SECS).max(1);
        let step_hours = hours / substeps as f64;

        let mut grid_energy = 0.0;
        for _ in 0..substeps {
            let done = if charging {
                self.soc >= target_soc
            } else {
                self.soc <= target_soc
            };
            if done {
                break;
            }
            let curve = if charging {
                &self.charging_curve
            } else {
                &self.discharge_curve
            };
            let power = limit(curve.power_at(self.soc)).max(0.0);
            if power <= 0.0 {
                break;
            }

            let mut energy = power * step_hours;
            if charging {
                // grid energy needed to reach the target exactly
                let room = (target_soc - self.soc) * self.capacity / self.efficiency;
                energy = energy.min(room);
                self.soc += energy * self.efficiency / self.capacity;
            } else {
                // grid energy available above the floor
                let stored = (self.soc - target_soc) * self.capacity * self.efficiency;
                energy = energy.min(stored);
                self.soc -= energy / (self.capacity * self.efficiency);
            }
            grid_energy += energy;
        }
        self.soc = self.soc.clamp(0.0, 1.0);

        ChargeResult {
            avg_power: grid_energy / hours,
            soc_delta: self.soc - old_soc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_battery(capacity: f64, soc: f64, efficiency: f64, power: f64) -> Battery {
        Battery::new(
            capacity,
            soc,
            efficiency,
            PowerCurve::flat(power),
            PowerCurve::flat(power),
        )
    }

    fn hours(h: i64) -> TimeDelta {
        TimeDelta::hours(h)
    }

    #[test]
    fn full_charge_with_perfect_efficiency() {
        let mut battery = flat_battery(10.0, 0.0, 1.0, 10.0);
        let result = battery.load(hours(1), 10.0, 1.0);
        assert!((battery.soc - 1.0).abs() < 1e-9);
        assert!((result.avg_power - 10.0).abs() < 1e-9);
        assert!((result.soc_delta - 1.0).abs() < 1e-9);
    }

    #[test]
    fn charge_applies_efficiency() {
        let mut battery = flat_battery(10.0, 0.0, 0.9, 10.0);
        let result = battery.load(hours(1), 10.0, 1.0);
        // 10 kWh drawn from the grid, 9 kWh stored
        assert!((battery.soc - 0.9).abs() < 1e-9);
        assert!((result.avg_power - 10.0).abs() < 1e-9);
    }

    #[test]
    fn charge_stops_at_target_soc() {
        let mut battery = flat_battery(100.0, 0.5, 1.0, 100.0);
        let result = battery.load(hours(1), 100.0, 0.6);
        assert!((battery.soc - 0.6).abs() < 1e-9);
        // 10 kWh over a one-hour window
        assert!((result.avg_power - 10.0).abs() < 1e-6);
    }

    #[test]
    fn charge_respects_power_cap() {
        let mut battery = flat_battery(100.0, 0.0, 1.0, 50.0);
        let result = battery.load(hours(1), 20.0, 1.0);
        assert!((result.avg_power - 20.0).abs() < 1e-9);
        assert!((battery.soc - 0.2).abs() < 1e-9);
    }

    #[test]
    fn tapering_curve_slows_late_charge() {
        let curve = PowerCurve::new(vec![(0.0, 10.0), (0.8, 10.0), (1.0, 0.0)]);
        let mut battery = Battery::new(10.0, 0.75, 1.0, curve.clone(), curve);
        let result = battery.load(hours(4), 10.0, 1.0);
        // power tapers above 80 %, so the battery never quite reaches full
        assert!(battery.soc > 0.95 && battery.soc < 1.0);
        assert!(result.avg_power < 10.0);
    }

    #[test]
    fn discharge_applies_efficiency() {
        let mut battery = flat_battery(10.0, 1.0, 0.9, 20.0);
        let result = battery.unload(hours(1), 20.0, 0.0);
        // 10 kWh stored delivers 9 kWh to the grid
        assert!(battery.soc.abs() < 1e-9);
        assert!((result.avg_power - 9.0).abs() < 1e-6);
        assert!((result.soc_delta + 1.0).abs() < 1e-9);
    }

    #[test]
    fn discharge_respects_floor() {
        let mut battery = flat_battery(10.0, 0.8, 1.0, 50.0);
        battery.unload(hours(2), 50.0, 0.5);
        assert!((battery.soc - 0.5).abs() < 1e-9);
    }

    #[test]
    fn constant_load_holds_power() {
        let mut battery = flat_battery(100.0, 0.0, 1.0, 50.0);
        let result = battery.load_constant(hours(2), 5.0);
        assert!((result.avg_power - 5.0).abs() < 1e-9);
        assert!((battery.soc - 0.1).abs() < 1e-9);
    }

    #[test]
    fn available_power_does_not_mutate() {
        let battery = flat_battery(10.0, 0.5, 1.0, 100.0);
        let available = battery.available_power(hours(1));
        assert!((available - 5.0).abs() < 1e-6);
        assert!((battery.soc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn zero_duration_is_a_no_op() {
        let mut battery = flat_battery(10.0, 0.5, 1.0, 10.0);
        let result = battery.load(TimeDelta::zero(), 10.0, 1.0);
        assert_eq!(result.avg_power, 0.0);
        assert_eq!(result.soc_delta, 0.0);
    }

    #[test]
    #[should_panic]
    fn rejects_soc_out_of_range() {
        flat_battery(10.0, 1.2, 1.0, 10.0);
    }
}
