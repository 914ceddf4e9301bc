//! Typed simulation events and per-interval bucketing.
//!
//! Every event carries two timestamps: `signal_time` is the moment its
//! information becomes visible to the simulation, `start_time` the moment it
//! takes effect. The gap between the two models imperfect foresight.

pub mod series;

use chrono::{NaiveDateTime, TimeDelta};
use tracing::warn;

use crate::components::Cost;

/// A timestamped power value for one named load at a connector.
///
/// Used for both fixed loads and local generation; generation is applied to
/// the connector with a negated sign.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadEvent {
    pub signal_time: NaiveDateTime,
    pub start_time: NaiveDateTime,
    /// Load name under which the value lands in `current_loads`.
    pub name: String,
    pub grid_connector_id: String,
    /// Power in kW, positive magnitude.
    pub value: f64,
}

/// A grid-operator update for one connector. Only the present fields affect
/// world state; absent fields leave the connector unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSignalEvent {
    pub signal_time: NaiveDateTime,
    pub start_time: NaiveDateTime,
    pub grid_connector_id: String,
    pub max_power: Option<f64>,
    pub cost: Option<Cost>,
    /// Desired aggregate power (kW) from the operator schedule.
    pub target: Option<f64>,
    /// Charge-window flag from the operator schedule.
    pub window: Option<bool>,
    /// Grid capacity (kW), forwarded to the output.
    pub capacity: Option<f64>,
}

/// State change of one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleEvent {
    pub signal_time: NaiveDateTime,
    pub start_time: NaiveDateTime,
    pub vehicle_id: String,
    pub update: VehicleUpdate,
}

/// Per-kind vehicle-event payload.
///
/// A closed set of variants so the stepper's transition logic is checked
/// exhaustively at compile time.
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleUpdate {
    /// The vehicle returns to the depot and plugs in.
    Arrival {
        connected_charging_station: String,
        /// SOC consumed (negative) or gained en route.
        soc_delta: f64,
        estimated_time_of_departure: Option<NaiveDateTime>,
        desired_soc: Option<f64>,
    },
    /// The vehicle unplugs and leaves.
    Departure {
        estimated_time_of_arrival: Option<NaiveDateTime>,
    },
    /// The per-vehicle schedule value changes (individual sub-strategy).
    Schedule { schedule: f64 },
}

/// Any simulation event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    FixedLoad(LoadEvent),
    LocalGeneration(LoadEvent),
    GridSignal(GridSignalEvent),
    Vehicle(VehicleEvent),
}

impl Event {
    /// When the event's information becomes known.
    pub fn signal_time(&self) -> NaiveDateTime {
        match self {
            Event::FixedLoad(e) | Event::LocalGeneration(e) => e.signal_time,
            Event::GridSignal(e) => e.signal_time,
            Event::Vehicle(e) => e.signal_time,
        }
    }

    /// When the event takes effect.
    pub fn start_time(&self) -> NaiveDateTime {
        match self {
            Event::FixedLoad(e) | Event::LocalGeneration(e) => e.start_time,
            Event::GridSignal(e) => e.start_time,
            Event::Vehicle(e) => e.start_time,
        }
    }
}

/// Events partitioned into one bucket per simulation interval, by the
/// interval in which their information first becomes visible.
#[derive(Debug)]
pub struct EventSteps {
    /// `n_intervals` buckets; bucket `i` is delivered to the stepper when it
    /// enters interval `i`.
    pub steps: Vec<Vec<Event>>,
    /// Events signalled before simulation start, clamped into bucket 0.
    pub clamped: usize,
    /// Events signalled at or after the horizon, dropped.
    pub dropped: usize,
}

impl EventSteps {
    /// Buckets `events` by `ceil((signal_time - start_time) / interval)`.
    ///
    /// Events whose index is negative land in bucket 0, events at or past
    /// `n_intervals` are dropped; both anomalies are counted and surfaced
    /// once as a warning.
    pub fn build(
        events: Vec<Event>,
        start_time: NaiveDateTime,
        n_intervals: usize,
        interval: TimeDelta,
    ) -> Self {
        assert!(interval > TimeDelta::zero(), "interval must be positive");
        let mut steps: Vec<Vec<Event>> = (0..n_intervals).map(|_| Vec::new()).collect();
        let mut clamped = 0;
        let mut dropped = 0;

        let interval_secs = interval.num_seconds();
        for event in events {
            let ahead_secs = (event.signal_time() - start_time).num_seconds();
            // ceiling division: first interval at or after the signal time
            let index = -((-ahead_secs).div_euclid(interval_secs));

            if index < 0 {
                clamped += 1;
                steps[0].push(event);
            } else if index as usize >= n_intervals {
                dropped += 1;
            } else {
                steps[index as usize].push(event);
            }
        }

        if clamped > 0 {
            warn!(count = clamped, "events before scenario start, moved to first interval");
        }
        if dropped > 0 {
            warn!(count = dropped, "events after scenario end, ignored");
        }

        Self {
            steps,
            clamped,
            dropped,
        }
    }
}
