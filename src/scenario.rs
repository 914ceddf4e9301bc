//! Scenario build: validates the parsed description and constructs the
//! mutable runtime state from it, once. The configuration is consumed and
//! never re-read afterwards.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime, TimeDelta, Weekday};

use crate::components::{
    Battery, ChargingStation, GridConnector, PowerCurve, StationaryBattery, Vehicle, VehicleType,
};
use crate::config::{ScenarioConfig, SeriesConfig, VehicleEventConfig};
use crate::error::{SimError, SimResult};
use crate::events::series::{
    column_values, energy_price_events, schedule_events_from_csv, EnergySeries, SeriesKind,
};
use crate::events::{Event, EventSteps, GridSignalEvent, VehicleEvent, VehicleUpdate};
use crate::sim::stepper::WorldState;
use crate::sim::window::{CoreStandingTime, TimeWindow};
use crate::sim::{ScheduleStrategy, SubStrategy};

/// Timing and strategy parameters of one run.
#[derive(Debug, Clone, Copy)]
pub struct SimParams {
    pub start_time: NaiveDateTime,
    pub interval: TimeDelta,
    pub n_intervals: usize,
    pub sub_strategy: SubStrategy,
    pub warn_core_standing_time: bool,
}

/// A fully validated scenario, ready to run.
#[derive(Debug)]
pub struct Scenario {
    pub params: SimParams,
    pub world: WorldState,
    pub core_standing_time: Option<CoreStandingTime>,
    pub event_steps: EventSteps,
}

impl Scenario {
    /// Loads and builds a scenario from a TOML file. CSV paths inside the
    /// description are resolved relative to the file's directory.
    pub fn load(path: &Path) -> SimResult<Self> {
        let config = ScenarioConfig::from_toml_file(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_config(config, dir)
    }

    /// Builds the runtime state from a parsed description.
    pub fn from_config(config: ScenarioConfig, dir: &Path) -> SimResult<Self> {
        let sim = &config.simulation;
        if sim.interval_minutes <= 0 {
            return Err(SimError::Config("interval_minutes must be positive".into()));
        }
        if sim.n_intervals == 0 {
            return Err(SimError::Config("n_intervals must be positive".into()));
        }
        let interval = TimeDelta::minutes(sim.interval_minutes);
        let sub_strategy = match sim.strategy.as_str() {
            "collective" => SubStrategy::Collective,
            "individual" => SubStrategy::Individual,
            other => {
                return Err(SimError::Config(format!(
                    "unknown strategy `{other}` (expected `collective` or `individual`)"
                )));
            }
        };
        let params = SimParams {
            start_time: sim.start_time,
            interval,
            n_intervals: sim.n_intervals,
            sub_strategy,
            warn_core_standing_time: sim.warn_core_standing_time,
        };

        let core_standing_time = config
            .core_standing_time
            .as_ref()
            .map(build_core_standing_time)
            .transpose()?;

        let mut world = WorldState::default();

        for (gc_id, gc_config) in &config.grid_connectors {
            let mut connector = GridConnector::new(gc_config.max_power);
            connector.cost = gc_config.cost.clone();
            connector.target = gc_config.target;
            world.grid_connectors.insert(gc_id.clone(), connector);
        }

        for (cs_id, cs_config) in &config.charging_stations {
            if !world.grid_connectors.contains_key(&cs_config.parent) {
                return Err(SimError::Config(format!(
                    "charging station {cs_id}: unknown parent connector `{}`",
                    cs_config.parent
                )));
            }
            if cs_config.max_power <= 0.0
                || !(0.0..=cs_config.max_power).contains(&cs_config.min_power)
            {
                return Err(SimError::Config(format!(
                    "charging station {cs_id}: invalid power range"
                )));
            }
            world.charging_stations.insert(
                cs_id.clone(),
                ChargingStation::new(cs_config.max_power, cs_config.min_power, &cs_config.parent),
            );
        }

        let mut vehicle_types = std::collections::BTreeMap::new();
        for (type_id, type_config) in &config.vehicle_types {
            if type_config.capacity <= 0.0 {
                return Err(SimError::Config(format!(
                    "vehicle type {type_id}: capacity must be positive"
                )));
            }
            let charging_curve =
                build_curve(&type_config.charging_curve, &format!("vehicle type {type_id}"))?;
            if type_config.min_charging_power > charging_curve.max_power() {
                return Err(SimError::Config(format!(
                    "vehicle type {type_id}: min_charging_power above curve peak"
                )));
            }
            let mut kind = VehicleType::new(
                type_id.clone(),
                type_config.capacity,
                charging_curve,
                type_config.min_charging_power,
            );
            if type_config.v2g {
                if !(0.0..=1.0).contains(&type_config.discharge_limit) {
                    return Err(SimError::Config(format!(
                        "vehicle type {type_id}: discharge_limit out of range"
                    )));
                }
                let discharge_curve = type_config
                    .discharge_curve
                    .as_ref()
                    .map(|points| build_curve(points, &format!("vehicle type {type_id}")))
                    .transpose()?;
                kind = kind.with_v2g(type_config.discharge_limit, discharge_curve);
            }
            vehicle_types.insert(type_id.clone(), kind);
        }

        for (vehicle_id, vehicle_config) in &config.vehicles {
            let kind = vehicle_types
                .get(&vehicle_config.vehicle_type)
                .cloned()
                .ok_or_else(|| {
                    SimError::Config(format!(
                        "vehicle {vehicle_id}: unknown vehicle type `{}`",
                        vehicle_config.vehicle_type
                    ))
                })?;
            if !(0.0..=1.0).contains(&vehicle_config.soc)
                || !(0.0..=1.0).contains(&vehicle_config.desired_soc)
            {
                return Err(SimError::Config(format!(
                    "vehicle {vehicle_id}: SOC out of range"
                )));
            }
            if vehicle_config.efficiency <= 0.0 || vehicle_config.efficiency > 1.0 {
                return Err(SimError::Config(format!(
                    "vehicle {vehicle_id}: efficiency out of range"
                )));
            }
            if let Some(cs_id) = &vehicle_config.connected_charging_station {
                if !world.charging_stations.contains_key(cs_id) {
                    return Err(SimError::Config(format!(
                        "vehicle {vehicle_id}: unknown charging station `{cs_id}`"
                    )));
                }
            }
            let mut vehicle = Vehicle::new(
                kind,
                vehicle_config.soc,
                vehicle_config.desired_soc,
                vehicle_config.efficiency,
            );
            vehicle.connected_charging_station = vehicle_config.connected_charging_station.clone();
            vehicle.estimated_time_of_arrival = vehicle_config.estimated_time_of_arrival;
            vehicle.estimated_time_of_departure = vehicle_config.estimated_time_of_departure;
            vehicle.schedule = vehicle_config.schedule;
            world.vehicles.insert(vehicle_id.clone(), vehicle);
        }

        for (battery_id, battery_config) in &config.batteries {
            if !world.grid_connectors.contains_key(&battery_config.parent) {
                return Err(SimError::Config(format!(
                    "battery {battery_id}: unknown parent connector `{}`",
                    battery_config.parent
                )));
            }
            if battery_config.capacity <= 0.0
                || !(0.0..=1.0).contains(&battery_config.soc)
                || battery_config.efficiency <= 0.0
                || battery_config.efficiency > 1.0
                || battery_config.min_charging_power < 0.0
            {
                return Err(SimError::Config(format!(
                    "battery {battery_id}: invalid parameters"
                )));
            }
            let charging_curve =
                build_curve(&battery_config.charging_curve, &format!("battery {battery_id}"))?;
            let discharge_curve = match &battery_config.discharge_curve {
                Some(points) => build_curve(points, &format!("battery {battery_id}"))?,
                None => charging_curve.clone(),
            };
            let battery = Battery::new(
                battery_config.capacity,
                battery_config.soc,
                battery_config.efficiency,
                charging_curve,
                discharge_curve,
            );
            world.batteries.insert(
                battery_id.clone(),
                StationaryBattery::new(
                    &battery_config.parent,
                    battery_config.min_charging_power,
                    battery,
                ),
            );
        }

        // assemble the event stream
        let mut all_events = Vec::new();

        for event_config in &config.events.vehicle_events {
            if !world.vehicles.contains_key(&event_config.vehicle_id) {
                return Err(SimError::UnknownVehicle(event_config.vehicle_id.clone()));
            }
            all_events.push(Event::Vehicle(build_vehicle_event(event_config)?));
        }

        for signal in &config.events.grid_operator_signals {
            if !world.grid_connectors.contains_key(&signal.grid_connector_id) {
                return Err(SimError::UnknownConnector(signal.grid_connector_id.clone()));
            }
            all_events.push(Event::GridSignal(GridSignalEvent {
                signal_time: signal.signal_time,
                start_time: signal.start_time,
                grid_connector_id: signal.grid_connector_id.clone(),
                max_power: signal.max_power,
                cost: signal.cost.clone(),
                target: signal.target,
                window: signal.window,
                capacity: signal.capacity,
            }));
        }

        for (name, series_config) in &config.events.fixed_load {
            let series = build_series(series_config, dir, name)?;
            let connector = world
                .grid_connectors
                .get_mut(&series.grid_connector_id)
                .ok_or_else(|| SimError::UnknownConnector(series.grid_connector_id.clone()))?;
            // the schedule lookahead approximates future fixed load from
            // this weekday profile
            connector.merge_avg_fixed_load(series.average_week_profile(interval));
            all_events.extend(series.events(name, SeriesKind::FixedLoad, false));
        }

        for (name, series_config) in &config.events.local_generation {
            let series = build_series(series_config, dir, name)?;
            if !world.grid_connectors.contains_key(&series.grid_connector_id) {
                return Err(SimError::UnknownConnector(series.grid_connector_id.clone()));
            }
            // generation forecasts are treated as perfectly foreseeable
            all_events.extend(series.events(name, SeriesKind::LocalGeneration, true));
        }

        if let Some(price) = &config.events.energy_price_from_csv {
            if !world.grid_connectors.contains_key(&price.grid_connector_id) {
                return Err(SimError::UnknownConnector(price.grid_connector_id.clone()));
            }
            let prices = column_values(&resolve(dir, &price.csv_file), &price.column)?;
            all_events.extend(energy_price_events(
                price.start_time,
                delta_from_seconds(price.step_duration_s)?,
                &price.grid_connector_id,
                &prices,
            ));
        }

        if let Some(schedule) = &config.events.schedule_from_csv {
            if !world
                .grid_connectors
                .contains_key(&schedule.grid_connector_id)
            {
                return Err(SimError::UnknownConnector(
                    schedule.grid_connector_id.clone(),
                ));
            }
            all_events.extend(schedule_events_from_csv(
                &resolve(dir, &schedule.csv_file),
                &schedule.column,
                &schedule.window_column,
                schedule.start_time,
                delta_from_seconds(schedule.step_duration_s)?,
                &schedule.grid_connector_id,
                schedule.individual,
            )?);
        }

        let event_steps = EventSteps::build(
            all_events,
            params.start_time,
            params.n_intervals,
            params.interval,
        );

        Ok(Self {
            params,
            world,
            core_standing_time,
            event_steps,
        })
    }

    /// Hands the world over to a schedule strategy, together with the
    /// per-interval event buckets to feed it.
    pub fn into_strategy(self) -> SimResult<(ScheduleStrategy, Vec<Vec<Event>>)> {
        let strategy = ScheduleStrategy::new(
            self.world,
            self.params.start_time,
            self.params.interval,
            self.params.sub_strategy,
            self.core_standing_time,
            self.params.warn_core_standing_time,
        )?;
        Ok((strategy, self.event_steps.steps))
    }
}

fn resolve(dir: &Path, file: &str) -> PathBuf {
    dir.join(file)
}

fn delta_from_seconds(seconds: f64) -> SimResult<TimeDelta> {
    if seconds <= 0.0 {
        return Err(SimError::Config("step_duration_s must be positive".into()));
    }
    Ok(TimeDelta::milliseconds((seconds * 1000.0) as i64))
}

fn build_curve(points: &[[f64; 2]], what: &str) -> SimResult<PowerCurve> {
    if points.is_empty() {
        return Err(SimError::Config(format!("{what}: empty power curve")));
    }
    for [soc, power] in points {
        if !(0.0..=1.0).contains(soc) || *power < 0.0 {
            return Err(SimError::Config(format!(
                "{what}: curve point ({soc}, {power}) out of range"
            )));
        }
    }
    Ok(PowerCurve::new(
        points.iter().map(|[soc, power]| (*soc, *power)).collect(),
    ))
}

fn build_core_standing_time(
    config: &crate::config::CoreStandingTimeConfig,
) -> SimResult<CoreStandingTime> {
    let mut windows = Vec::new();
    for window in &config.times {
        windows.push(TimeWindow {
            start: parse_time(&window.start)?,
            end: parse_time(&window.end)?,
        });
    }
    let mut full_days = Vec::new();
    for day in &config.no_drive_days {
        full_days.push(
            Weekday::from_str(day)
                .map_err(|_| SimError::Config(format!("unknown weekday `{day}`")))?,
        );
    }
    if windows.is_empty() && full_days.is_empty() {
        return Err(SimError::Config(
            "core_standing_time needs at least one window or day".into(),
        ));
    }
    Ok(CoreStandingTime { windows, full_days })
}

fn parse_time(raw: &str) -> SimResult<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| SimError::Config(format!("invalid time of day `{raw}`")))
}

fn build_series(config: &SeriesConfig, dir: &Path, name: &str) -> SimResult<EnergySeries> {
    let values = match (&config.csv_file, config.values.is_empty()) {
        (Some(_), false) => {
            return Err(SimError::Config(format!(
                "series {name}: either values or csv_file, not both"
            )));
        }
        (Some(csv_file), true) => {
            let column = config.column.as_ref().ok_or_else(|| {
                SimError::Config(format!("series {name}: csv_file requires a column"))
            })?;
            column_values(&resolve(dir, csv_file), column)?
        }
        (None, false) => config.values.clone(),
        (None, true) => {
            return Err(SimError::Config(format!(
                "series {name}: no values and no csv_file"
            )));
        }
    };
    Ok(EnergySeries {
        start_time: config.start_time,
        step: delta_from_seconds(config.step_duration_s)?,
        grid_connector_id: config.grid_connector_id.clone(),
        values,
        factor: config.factor,
    })
}

fn build_vehicle_event(config: &VehicleEventConfig) -> SimResult<VehicleEvent> {
    let update = &config.update;
    let built = match config.event_type.as_str() {
        "arrival" => {
            let connected_charging_station =
                update.connected_charging_station.clone().ok_or_else(|| {
                    SimError::Config(format!(
                        "arrival of {} without connected_charging_station",
                        config.vehicle_id
                    ))
                })?;
            let soc_delta = update.soc_delta.ok_or_else(|| {
                SimError::Config(format!("arrival of {} without soc_delta", config.vehicle_id))
            })?;
            VehicleUpdate::Arrival {
                connected_charging_station,
                soc_delta,
                estimated_time_of_departure: update.estimated_time_of_departure,
                desired_soc: update.desired_soc,
            }
        }
        "departure" => VehicleUpdate::Departure {
            estimated_time_of_arrival: update.estimated_time_of_arrival,
        },
        "schedule" => {
            let schedule = update.schedule.ok_or_else(|| {
                SimError::Config(format!(
                    "schedule event of {} without schedule value",
                    config.vehicle_id
                ))
            })?;
            VehicleUpdate::Schedule { schedule }
        }
        other => {
            return Err(SimError::Config(format!(
                "unknown vehicle event type `{other}`"
            )));
        }
    };
    Ok(VehicleEvent {
        signal_time: config.signal_time,
        start_time: config.start_time,
        vehicle_id: config.vehicle_id.clone(),
        update: built,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;

    fn build(raw: &str) -> SimResult<Scenario> {
        let config = ScenarioConfig::from_toml_str(raw)?;
        Scenario::from_config(config, Path::new("."))
    }

    const BASE: &str = r#"
        [simulation]
        start_time = "2026-03-02T21:00:00"
        interval_minutes = 60
        n_intervals = 12

        [core_standing_time]
        [[core_standing_time.times]]
        start = "22:00"
        end = "06:00"

        [grid_connectors.GC1]
        max_power = 100.0
        cost = { type = "fixed", value = 0.3 }

        [charging_stations.CS1]
        max_power = 22.0
        parent = "GC1"

        [vehicle_types.van]
        capacity = 50.0
        charging_curve = [[0.0, 22.0], [1.0, 22.0]]

        [vehicles.V1]
        vehicle_type = "van"
        soc = 0.2
        desired_soc = 0.8
        connected_charging_station = "CS1"
    "#;

    #[test]
    fn base_scenario_builds() {
        let scenario = build(BASE).expect("build");
        assert_eq!(scenario.params.n_intervals, 12);
        assert_eq!(scenario.params.interval, TimeDelta::hours(1));
        assert_eq!(scenario.world.vehicles["V1"].kind.capacity, 50.0);
        assert!(scenario.core_standing_time.is_some());
        assert_eq!(scenario.event_steps.steps.len(), 12);
    }

    #[test]
    fn unknown_station_parent_is_config_error() {
        let raw = BASE.replace("parent = \"GC1\"", "parent = \"GC9\"");
        assert!(matches!(build(&raw), Err(SimError::Config(_))));
    }

    #[test]
    fn unknown_vehicle_type_is_config_error() {
        let raw = BASE.replace("vehicle_type = \"van\"", "vehicle_type = \"bus\"");
        assert!(matches!(build(&raw), Err(SimError::Config(_))));
    }

    #[test]
    fn arrival_event_requires_station_and_soc_delta() {
        let raw = format!(
            "{BASE}
            [[events.vehicle_events]]
            signal_time = \"2026-03-02T21:00:00\"
            start_time = \"2026-03-02T23:00:00\"
            vehicle_id = \"V1\"
            event_type = \"arrival\"
            update = {{ soc_delta = -0.1 }}
            "
        );
        assert!(matches!(build(&raw), Err(SimError::Config(_))));
    }

    #[test]
    fn vehicle_events_are_bucketed_by_signal_time() {
        let raw = format!(
            "{BASE}
            [[events.vehicle_events]]
            signal_time = \"2026-03-02T23:00:00\"
            start_time = \"2026-03-03T04:00:00\"
            vehicle_id = \"V1\"
            event_type = \"departure\"
            "
        );
        let scenario = build(&raw).expect("build");
        // 23:00 is two intervals after the 21:00 start
        assert_eq!(scenario.event_steps.steps[2].len(), 1);
        assert!(matches!(
            scenario.event_steps.steps[2][0],
            Event::Vehicle(_)
        ));
    }

    #[test]
    fn inline_series_expand_with_trailing_zero() {
        let raw = format!(
            "{BASE}
            [events.fixed_load.building]
            start_time = \"2026-03-02T21:00:00\"
            step_duration_s = 3600.0
            grid_connector_id = \"GC1\"
            values = [10.0, 12.0]
            "
        );
        let scenario = build(&raw).expect("build");
        let total: usize = scenario.event_steps.steps.iter().map(Vec::len).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn series_with_values_and_csv_is_rejected() {
        let raw = format!(
            "{BASE}
            [events.fixed_load.building]
            start_time = \"2026-03-02T21:00:00\"
            step_duration_s = 3600.0
            grid_connector_id = \"GC1\"
            values = [10.0]
            csv_file = \"load.csv\"
            column = \"kw\"
            "
        );
        assert!(matches!(build(&raw), Err(SimError::Config(_))));
    }

    #[test]
    fn into_strategy_checks_collective_invariants() {
        let scenario = build(BASE).expect("build");
        assert!(scenario.into_strategy().is_ok());

        let without_cst = BASE.replace(
            "[core_standing_time]",
            "[core_standing_time_disabled_]",
        );
        // removing the window makes the collective strategy unbuildable
        assert!(build(&without_cst).is_err());
    }

    #[test]
    fn bad_weekday_is_config_error() {
        let raw = BASE.replace(
            "[[core_standing_time.times]]",
            "no_drive_days = [\"Funday\"]\n        [[core_standing_time.times]]",
        );
        assert!(matches!(build(&raw), Err(SimError::Config(_))));
    }
}
