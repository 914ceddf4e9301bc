//! Shared fixtures for integration tests.

use depot_sim::config::ScenarioConfig;
use depot_sim::error::SimResult;
use depot_sim::scenario::Scenario;
use depot_sim::sim::{ScheduleStrategy, StepOutput};
use std::path::Path;

/// Overnight depot scenario: one 100 kW connector, one 22 kW station, one
/// 50 kWh vehicle arriving at SOC 0.2 with desired SOC 0.8, standing time
/// 22:00–06:00, schedule target 20 kW for the first 6 in-window hours, and a
/// 100 kWh stationary battery. The vehicle departs at 07:00.
pub const OVERNIGHT_SCENARIO: &str = r#"
    [simulation]
    start_time = "2026-03-02T21:00:00"
    interval_minutes = 60
    n_intervals = 12
    strategy = "collective"

    [core_standing_time]
    [[core_standing_time.times]]
    start = "22:00"
    end = "06:00"

    [grid_connectors.GC1]
    max_power = 100.0
    cost = { type = "fixed", value = 0.30 }

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
    efficiency = 1.0
    connected_charging_station = "CS1"
    estimated_time_of_departure = "2026-03-03T07:00:00"

    [batteries.BAT1]
    parent = "GC1"
    capacity = 100.0
    soc = 0.5
    efficiency = 1.0
    charging_curve = [[0.0, 50.0], [1.0, 50.0]]

    [[events.grid_operator_signals]]
    signal_time = "2026-03-02T21:00:00"
    start_time = "2026-03-02T21:00:00"
    grid_connector_id = "GC1"
    target = 0.0
    window = false

    [[events.grid_operator_signals]]
    signal_time = "2026-03-02T21:00:00"
    start_time = "2026-03-02T22:00:00"
    grid_connector_id = "GC1"
    target = 20.0
    window = true

    [[events.grid_operator_signals]]
    signal_time = "2026-03-02T21:00:00"
    start_time = "2026-03-03T04:00:00"
    grid_connector_id = "GC1"
    target = 0.0
    window = false

    [[events.vehicle_events]]
    signal_time = "2026-03-03T07:00:00"
    start_time = "2026-03-03T07:00:00"
    vehicle_id = "V1"
    event_type = "departure"
"#;

/// Builds a scenario from a TOML string (no CSV sources involved).
pub fn build_scenario(raw: &str) -> SimResult<Scenario> {
    let config = ScenarioConfig::from_toml_str(raw)?;
    Scenario::from_config(config, Path::new("."))
}

/// Runs every interval of a scenario and returns the strategy (for world
/// inspection) together with all step outputs.
pub fn run_scenario(raw: &str) -> SimResult<(ScheduleStrategy, Vec<StepOutput>)> {
    let scenario = build_scenario(raw)?;
    let (mut strategy, event_steps) = scenario.into_strategy()?;
    let mut results = Vec::with_capacity(event_steps.len());
    for events in event_steps {
        results.push(strategy.step(events)?);
    }
    Ok((strategy, results))
}
