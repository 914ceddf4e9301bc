//! Grid connectors: the metered points where the depot meets the grid.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDateTime, TimeDelta, Timelike};
use serde::Deserialize;

/// Tariff descriptor attached to a connector by grid-operator signals.
///
/// The simulation stores and forwards the active tariff; evaluating it
/// against drawn energy is the cost module's job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cost {
    /// Flat price per kWh.
    Fixed { value: f64 },
    /// Price as a polynomial in drawn power, lowest coefficient first.
    Polynomial { value: Vec<f64> },
}

/// Average fixed load per weekday (Monday first) and interval slot.
pub type WeekProfile = Vec<Vec<f64>>;

/// A grid connection point. Aggregates named signed loads (fixed loads,
/// generation, charging stations, stationary batteries) and carries the
/// operator state (tariff, power cap, schedule target, window flag).
#[derive(Debug, Clone)]
pub struct GridConnector {
    /// Hard power cap in kW; `None` means unlimited.
    pub max_power: Option<f64>,
    /// Currently allowed power, adjusted by operator signals. Never above
    /// `max_power`.
    pub cur_max_power: Option<f64>,
    /// Named signed loads (kW). Positive draws, negative feeds in.
    pub current_loads: BTreeMap<String, f64>,
    /// Active tariff. Must be set after event application for every interval.
    pub cost: Option<Cost>,
    /// Desired aggregate power from the operator schedule (kW).
    pub target: Option<f64>,
    /// Last charge-window flag from the operator schedule.
    pub window: Option<bool>,
    /// Last capacity signal (kW), forwarded to the output.
    pub capacity: Option<f64>,
    /// Average fixed load per weekday and slot, used to approximate future
    /// fixed load in forecast intervals.
    avg_fixed_load: Option<WeekProfile>,
}

impl GridConnector {
    pub fn new(max_power: Option<f64>) -> Self {
        Self {
            max_power,
            cur_max_power: max_power,
            current_loads: BTreeMap::new(),
            cost: None,
            target: None,
            window: None,
            capacity: None,
            avg_fixed_load: None,
        }
    }

    /// Adds `value` kW to the named load and returns the updated entry.
    pub fn add_load(&mut self, key: &str, value: f64) -> f64 {
        let entry = self.current_loads.entry(key.to_owned()).or_insert(0.0);
        *entry += value;
        *entry
    }

    /// Sum of all current loads (kW, signed).
    pub fn current_load(&self) -> f64 {
        self.current_loads.values().sum()
    }

    /// Sum of current loads whose name is not in `exclude`.
    pub fn current_load_excluding(&self, exclude: &[&str]) -> f64 {
        self.current_loads
            .iter()
            .filter(|(name, _)| !exclude.contains(&name.as_str()))
            .map(|(_, value)| value)
            .sum()
    }

    /// Currently allowed power; unlimited connectors report infinity.
    pub fn effective_max_power(&self) -> f64 {
        self.cur_max_power.unwrap_or(f64::INFINITY)
    }

    /// Removes all charging-station entries from `current_loads`.
    ///
    /// Station loads are transient: the schedule strategy re-establishes
    /// them from scratch every interval, so the stepper clears them at a
    /// fixed point in the interval lifecycle.
    pub fn reset_station_loads<F>(&mut self, is_station: F)
    where
        F: Fn(&str) -> bool,
    {
        self.current_loads.retain(|name, _| !is_station(name));
    }

    /// Merges a weekday average-load profile into this connector. Multiple
    /// fixed-load series add up slot by slot.
    pub fn merge_avg_fixed_load(&mut self, profile: WeekProfile) {
        match &mut self.avg_fixed_load {
            None => self.avg_fixed_load = Some(profile),
            Some(existing) => {
                for (day, slots) in existing.iter_mut().zip(profile) {
                    for (slot, value) in day.iter_mut().zip(slots) {
                        *slot += value;
                    }
                }
            }
        }
    }

    /// Average fixed load for the slot containing `at`, or 0 when no profile
    /// has been recorded.
    pub fn avg_fixed_load(&self, at: NaiveDateTime, interval: TimeDelta) -> f64 {
        let Some(profile) = &self.avg_fixed_load else {
            return 0.0;
        };
        let weekday = at.weekday().num_days_from_monday() as usize;
        let secs_since_midnight = i64::from(at.time().num_seconds_from_midnight());
        let slot = (secs_since_midnight / interval.num_seconds()) as usize;
        profile[weekday].get(slot).copied().unwrap_or(0.0)
    }
}
