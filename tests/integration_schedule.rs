//! End-to-end properties of the schedule strategy.

mod common;

use common::{build_scenario, run_scenario, OVERNIGHT_SCENARIO};
use depot_sim::error::SimError;

#[test]
fn overnight_scenario_charges_vehicle_on_schedule() {
    let (strategy, results) = run_scenario(OVERNIGHT_SCENARIO).expect("run");
    assert_eq!(results.len(), 12);

    // schedule energy (20 kW x 6 h = 120 kWh) far exceeds the vehicle's need
    // (0.6 x 50 kWh = 30 kWh): the vehicle reaches its desired SOC in-window
    // and the departure at 07:00 passes the infeasibility check
    let vehicle = &strategy.world().vehicles["V1"];
    assert!(vehicle.battery.soc >= 0.8 - 1e-9);
    assert!(vehicle.connected_charging_station.is_none());
    assert!(!strategy.overcharge_necessary());

    // vehicle charging happens only inside the window (22:00 to 04:00:
    // steps 1 through 6)
    for (idx, result) in results.iter().enumerate() {
        let command = result.commands.get("CS1").copied().unwrap_or(0.0);
        if (1..=6).contains(&idx) {
            assert!(command > 0.0, "expected charging at step {idx}");
        } else {
            assert!(command.abs() < 1e-9, "unexpected command at step {idx}");
        }
    }
}

#[test]
fn overnight_scenario_never_draws_down_the_battery() {
    let (strategy, _) = run_scenario(OVERNIGHT_SCENARIO).expect("run");
    // the schedule covers the fleet: the stationary battery only absorbs
    // surplus headroom, it is never discharged below its initial SOC
    let battery = &strategy.world().batteries["BAT1"];
    assert!(battery.battery.soc >= 0.5);
}

#[test]
fn connector_limits_hold_in_every_interval() {
    let (_, results) = run_scenario(OVERNIGHT_SCENARIO).expect("run");
    for result in &results {
        assert!(result.connectors["GC1"].grid_supply <= 100.0 + 1e-9);
    }
}

#[test]
fn soc_stays_in_unit_range_throughout() {
    let scenario = build_scenario(OVERNIGHT_SCENARIO).expect("build");
    let (mut strategy, event_steps) = scenario.into_strategy().expect("strategy");
    for events in event_steps {
        strategy.step(events).expect("step");
        for vehicle in strategy.world().vehicles.values() {
            assert!((0.0..=1.0).contains(&vehicle.battery.soc));
        }
        for battery in strategy.world().batteries.values() {
            assert!((0.0..=1.0).contains(&battery.battery.soc));
        }
    }
}

#[test]
fn identical_runs_produce_identical_commands() {
    let (_, first) = run_scenario(OVERNIGHT_SCENARIO).expect("first run");
    let (_, second) = run_scenario(OVERNIGHT_SCENARIO).expect("second run");

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.current_time, b.current_time);
        assert_eq!(a.commands, b.commands);
    }
}

#[test]
fn undersized_station_triggers_departure_infeasibility() {
    // a 2 kW station can deliver at most 20 kWh before the 07:00 departure,
    // far short of the 30 kWh need
    let raw = OVERNIGHT_SCENARIO.replace("max_power = 22.0", "max_power = 2.0");
    let result = run_scenario(&raw);
    assert!(matches!(
        result,
        Err(SimError::DepartureBelowDesiredSoc { .. })
    ));
}

#[test]
fn early_signals_are_clamped_into_the_first_interval() {
    let raw = OVERNIGHT_SCENARIO.replace(
        "signal_time = \"2026-03-02T21:00:00\"\n    start_time = \"2026-03-02T21:00:00\"",
        "signal_time = \"2026-03-02T18:00:00\"\n    start_time = \"2026-03-02T21:00:00\"",
    );
    let scenario = build_scenario(&raw).expect("build");
    assert_eq!(scenario.event_steps.clamped, 1);
    assert!(!scenario.event_steps.steps[0].is_empty());
}

#[test]
fn events_beyond_the_horizon_are_dropped_and_counted() {
    let raw = format!(
        "{OVERNIGHT_SCENARIO}
        [[events.grid_operator_signals]]
        signal_time = \"2026-03-04T12:00:00\"
        start_time = \"2026-03-04T13:00:00\"
        grid_connector_id = \"GC1\"
        target = 5.0
        "
    );
    let scenario = build_scenario(&raw).expect("build");
    assert_eq!(scenario.event_steps.dropped, 1);
}

#[test]
fn individual_strategy_follows_per_vehicle_schedule() {
    let raw = r#"
        [simulation]
        start_time = "2026-03-02T12:00:00"
        interval_minutes = 60
        n_intervals = 3
        strategy = "individual"

        [grid_connectors.GC1]
        max_power = 100.0
        cost = { type = "fixed", value = 0.25 }

        [charging_stations.CS1]
        max_power = 22.0
        parent = "GC1"

        [vehicle_types.van]
        capacity = 50.0
        charging_curve = [[0.0, 22.0], [1.0, 22.0]]

        [vehicles.V1]
        vehicle_type = "van"
        soc = 0.3
        desired_soc = 0.8
        efficiency = 1.0
        connected_charging_station = "CS1"
        schedule = 5.0
    "#;
    let (strategy, results) = run_scenario(raw).expect("run");
    for result in &results {
        assert!((result.commands["CS1"] - 5.0).abs() < 1e-6);
    }
    // 3 h at 5 kW = 15 kWh = 0.3 SOC
    let soc = strategy.world().vehicles["V1"].battery.soc;
    assert!((soc - 0.6).abs() < 1e-6);
}

#[test]
fn individual_strategy_requires_a_schedule_value() {
    let raw = r#"
        [simulation]
        start_time = "2026-03-02T12:00:00"
        interval_minutes = 60
        n_intervals = 1
        strategy = "individual"

        [grid_connectors.GC1]
        cost = { type = "fixed", value = 0.25 }

        [charging_stations.CS1]
        max_power = 22.0
        parent = "GC1"

        [vehicle_types.van]
        capacity = 50.0
        charging_curve = [[0.0, 22.0], [1.0, 22.0]]

        [vehicles.V1]
        vehicle_type = "van"
        soc = 0.3
        connected_charging_station = "CS1"
    "#;
    assert!(matches!(run_scenario(raw), Err(SimError::Config(_))));
}
