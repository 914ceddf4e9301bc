//! Periodic value series and CSV-derived signal streams.

use std::path::Path;

use chrono::{Datelike, NaiveDateTime, TimeDelta, Timelike};

use crate::components::connector::WeekProfile;
use crate::components::Cost;
use crate::error::{SimError, SimResult};
use crate::events::{Event, GridSignalEvent, LoadEvent, VehicleEvent, VehicleUpdate};

/// Which event kind a value series produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    FixedLoad,
    LocalGeneration,
}

/// A periodic sequence of power samples for one connector.
#[derive(Debug, Clone)]
pub struct EnergySeries {
    pub start_time: NaiveDateTime,
    /// Stride between samples.
    pub step: TimeDelta,
    pub grid_connector_id: String,
    /// Power samples in kW.
    pub values: Vec<f64>,
    /// Scale applied to every sample.
    pub factor: f64,
}

impl EnergySeries {
    /// Expands the series into one event per sample, plus a trailing
    /// zero-value event one step after the last sample (the series ends and
    /// its load drops out).
    ///
    /// With `perfect_foresight` every `signal_time` is pinned to the series
    /// start; otherwise each event is only known at its own start time.
    pub fn events(&self, name: &str, kind: SeriesKind, perfect_foresight: bool) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.values.len() + 1);
        for (idx, value) in self.values.iter().chain(std::iter::once(&0.0)).enumerate() {
            let start_time = self.start_time + self.step * idx as i32;
            let load = LoadEvent {
                signal_time: if perfect_foresight {
                    self.start_time
                } else {
                    start_time
                },
                start_time,
                name: name.to_owned(),
                grid_connector_id: self.grid_connector_id.clone(),
                value: value * self.factor,
            };
            events.push(match kind {
                SeriesKind::FixedLoad => Event::FixedLoad(load),
                SeriesKind::LocalGeneration => Event::LocalGeneration(load),
            });
        }
        events
    }

    /// Average sample value per weekday and interval slot.
    ///
    /// Walks the simulation intervals across the series, carrying the last
    /// sample at or before each interval (series stride and simulation
    /// interval need not be in sync), and averages per slot.
    pub fn average_week_profile(&self, interval: TimeDelta) -> WeekProfile {
        let slots_per_day = (TimeDelta::hours(24).num_seconds() / interval.num_seconds()) as usize;
        let mut sums: WeekProfile = vec![vec![0.0; slots_per_day]; 7];
        let mut counts = vec![vec![0u32; slots_per_day]; 7];

        let mut samples: std::collections::VecDeque<(NaiveDateTime, f64)> = self
            .values
            .iter()
            .chain(std::iter::once(&0.0))
            .enumerate()
            .map(|(idx, value)| (self.start_time + self.step * idx as i32, value * self.factor))
            .collect();

        let mut cur_time = self.start_time - interval;
        let mut cur_value: Option<f64> = None;
        loop {
            cur_time += interval;
            if samples.is_empty() {
                break;
            }
            while samples.front().is_some_and(|(t, _)| *t <= cur_time) {
                cur_value = samples.pop_front().map(|(_, v)| v);
            }
            if let Some(value) = cur_value {
                let weekday = cur_time.weekday().num_days_from_monday() as usize;
                let secs = i64::from(cur_time.time().num_seconds_from_midnight());
                let slot = (secs / interval.num_seconds()) as usize;
                sums[weekday][slot] += value;
                counts[weekday][slot] += 1;
            }
        }

        for (day_sums, day_counts) in sums.iter_mut().zip(&counts) {
            for (sum, count) in day_sums.iter_mut().zip(day_counts) {
                if *count > 0 {
                    *sum /= f64::from(*count);
                }
            }
        }
        sums
    }
}

/// Reads one numeric column from a CSV file.
pub fn column_values(path: &Path, column: &str) -> SimResult<Vec<f64>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let col_idx = headers
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| {
            SimError::Config(format!("'{}' is not a column of {}", column, path.display()))
        })?;

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        let raw = record.get(col_idx).unwrap_or("").trim();
        let value = raw.parse::<f64>().map_err(|_| {
            SimError::Config(format!(
                "bad value '{raw}' in column '{column}' of {}",
                path.display()
            ))
        })?;
        values.push(value);
    }
    Ok(values)
}

/// Expands a price series into one cost signal per sample.
///
/// Prices are published a day ahead: each signal is known one day before it
/// takes effect, but never before the series start.
pub fn energy_price_events(
    start: NaiveDateTime,
    step: TimeDelta,
    grid_connector_id: &str,
    prices: &[f64],
) -> Vec<Event> {
    prices
        .iter()
        .enumerate()
        .map(|(idx, price)| {
            let start_time = start + step * idx as i32;
            Event::GridSignal(GridSignalEvent {
                signal_time: (start_time - TimeDelta::days(1)).max(start),
                start_time,
                grid_connector_id: grid_connector_id.to_owned(),
                max_power: None,
                cost: Some(Cost::Fixed { value: *price }),
                target: None,
                window: None,
                capacity: None,
            })
        })
        .collect()
}

/// Convention for operator schedules: sent at 09:00, one day ahead for
/// afternoon validity, two days ahead when valid before noon.
fn schedule_signal_time(start_time: NaiveDateTime, series_start: NaiveDateTime) -> NaiveDateTime {
    let days_ahead = if start_time.hour() < 12 { 2 } else { 1 };
    let signal = (start_time - TimeDelta::days(days_ahead))
        .date()
        .and_hms_opt(9, 0, 0)
        .expect("09:00 is a valid time");
    signal.max(series_start)
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M"))
        .ok()
}

/// Derives sparse operator signals from a dense schedule table.
///
/// A row only produces a [`GridSignalEvent`] when its target value or window
/// flag differs from the previous row. With `individual`, every column other
/// than the leading timestamp, the target column and the window column is
/// treated as a per-vehicle schedule column and produces a
/// [`VehicleUpdate::Schedule`] event on change, with the same signal dating.
pub fn schedule_events_from_csv(
    path: &Path,
    column: &str,
    window_column: &str,
    start_time: Option<NaiveDateTime>,
    step: TimeDelta,
    grid_connector_id: &str,
    individual: bool,
) -> SimResult<Vec<Event>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_owned())
        .collect();
    let col_idx = headers.iter().position(|h| h == column).ok_or_else(|| {
        SimError::Config(format!("'{}' is not a column of {}", column, path.display()))
    })?;
    let window_idx = headers.iter().position(|h| h == window_column);

    let vehicle_columns: Vec<(usize, String)> = if individual {
        headers
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(idx, _)| *idx != col_idx && Some(*idx) != window_idx)
            .map(|(idx, name)| (idx, name.clone()))
            .collect()
    } else {
        Vec::new()
    };
    let mut vehicle_schedules: Vec<Option<f64>> = vec![None; vehicle_columns.len()];

    let mut events = Vec::new();
    let mut series_start = start_time;
    let mut last_target: Option<f64> = None;
    let mut last_window: Option<bool> = None;

    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let target: f64 = record
            .get(col_idx)
            .unwrap_or("")
            .trim()
            .parse()
            .map_err(|_| {
                SimError::Config(format!("bad target in row {} of {}", idx + 1, path.display()))
            })?;
        let window = window_idx.map(|w| record.get(w).unwrap_or("").trim() == "1");

        // row time: from the first column if parseable, else by position
        let row_time = match record.get(0).and_then(parse_timestamp) {
            Some(parsed) => {
                series_start.get_or_insert(parsed);
                parsed
            }
            None => {
                let start = series_start.ok_or_else(|| {
                    SimError::Config(format!(
                        "{}: no start_time given and row {} has no timestamp",
                        path.display(),
                        idx + 1
                    ))
                })?;
                start + step * idx as i32
            }
        };
        let signal_time = schedule_signal_time(row_time, series_start.unwrap_or(row_time));
        if signal_time > row_time {
            return Err(SimError::Config(format!(
                "{}: schedule signal in row {} starts before being sent (check your dates)",
                path.display(),
                idx + 1
            )));
        }

        if last_target != Some(target) || last_window != window {
            last_target = Some(target);
            last_window = window;
            events.push(Event::GridSignal(GridSignalEvent {
                signal_time,
                start_time: row_time,
                grid_connector_id: grid_connector_id.to_owned(),
                max_power: None,
                cost: None,
                target: Some(target),
                window,
                capacity: None,
            }));
        }

        for ((vehicle_idx, vehicle_id), known) in
            vehicle_columns.iter().zip(vehicle_schedules.iter_mut())
        {
            let value: f64 = record
                .get(*vehicle_idx)
                .unwrap_or("")
                .trim()
                .parse()
                .map_err(|_| {
                    SimError::Config(format!(
                        "bad schedule for '{vehicle_id}' in row {} of {}",
                        idx + 1,
                        path.display()
                    ))
                })?;
            if *known != Some(value) {
                *known = Some(value);
                events.push(Event::Vehicle(VehicleEvent {
                    signal_time,
                    start_time: row_time,
                    vehicle_id: vehicle_id.clone(),
                    update: VehicleUpdate::Schedule { schedule: value },
                }));
            }
        }
    }
    Ok(events)
}
