//! World state and the event-applying stepper.
//!
//! The stepper is a single-state machine: each `step` advances the clock by
//! one interval, merges newly revealed events into the pending queue and
//! applies everything due by the new current time. Events further out stay
//! queued — the schedule strategy reads them for lookahead but they do not
//! touch world state yet.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeDelta};

use crate::components::{ChargingStation, GridConnector, StationaryBattery, Vehicle};
use crate::error::{SimError, SimResult};
use crate::events::{Event, VehicleUpdate};

/// Departure tolerance: a vehicle may leave up to this fraction short of its
/// desired SOC before the run is infeasible.
pub const DEPARTURE_SOC_MARGIN: f64 = 0.05;

/// All mutable simulation state. Constructed once from the scenario
/// description and then exclusively owned by the strategy for the whole run.
#[derive(Debug, Clone, Default)]
pub struct WorldState {
    pub grid_connectors: BTreeMap<String, GridConnector>,
    pub charging_stations: BTreeMap<String, ChargingStation>,
    pub vehicles: BTreeMap<String, Vehicle>,
    pub batteries: BTreeMap<String, StationaryBattery>,
    /// Pending events, sorted by `start_time` after every merge. Events not
    /// yet due remain here and are visible to lookahead.
    pub future_events: Vec<Event>,
}

/// Advances the world state interval by interval.
#[derive(Debug)]
pub struct Stepper {
    pub world: WorldState,
    pub current_time: NaiveDateTime,
    pub interval: TimeDelta,
}

impl Stepper {
    /// Starts one interval *before* `start_time`, so the first `step` lands
    /// exactly on it.
    pub fn new(world: WorldState, start_time: NaiveDateTime, interval: TimeDelta) -> Self {
        assert!(interval > TimeDelta::zero(), "interval must be positive");
        Self {
            world,
            current_time: start_time - interval,
            interval,
        }
    }

    /// Advances one interval: merge `new_events`, apply everything due, then
    /// clear transient charging-station loads and check that every connector
    /// has an active tariff.
    pub fn step(&mut self, new_events: Vec<Event>) -> SimResult<()> {
        self.current_time += self.interval;

        self.world.future_events.extend(new_events);
        // stable: preserves arrival order between same-start events
        self.world.future_events.sort_by_key(Event::start_time);

        while self
            .world
            .future_events
            .first()
            .is_some_and(|e| e.start_time() <= self.current_time)
        {
            let event = self.world.future_events.remove(0);
            self.apply_event(event)?;
        }

        let WorldState {
            grid_connectors,
            charging_stations,
            batteries,
            ..
        } = &mut self.world;
        for (name, connector) in grid_connectors.iter_mut() {
            // station and battery loads are re-established fresh every
            // interval by the strategy
            connector.reset_station_loads(|load| {
                charging_stations.contains_key(load) || batteries.contains_key(load)
            });
            if connector.cost.is_none() {
                return Err(SimError::MissingCost {
                    connector: name.clone(),
                    time: self.current_time,
                });
            }
        }
        Ok(())
    }

    fn connector_mut(&mut self, id: &str) -> SimResult<&mut GridConnector> {
        self.world
            .grid_connectors
            .get_mut(id)
            .ok_or_else(|| SimError::UnknownConnector(id.to_owned()))
    }

    fn apply_event(&mut self, event: Event) -> SimResult<()> {
        match event {
            Event::FixedLoad(load) => {
                // persists until overwritten by the next sample
                self.connector_mut(&load.grid_connector_id)?
                    .current_loads
                    .insert(load.name, load.value);
            }
            Event::LocalGeneration(generation) => {
                // generation is negative load
                self.connector_mut(&generation.grid_connector_id)?
                    .current_loads
                    .insert(generation.name, -generation.value);
            }
            Event::GridSignal(signal) => {
                let connector = self.connector_mut(&signal.grid_connector_id)?;
                if let Some(cost) = signal.cost {
                    connector.cost = Some(cost);
                }
                connector.cur_max_power = match (connector.max_power, signal.max_power) {
                    (Some(hard), Some(signalled)) => Some(hard.min(signalled)),
                    // signal without max power resets to the hard cap
                    (Some(hard), None) => Some(hard),
                    (None, signalled) => signalled,
                };
                if let Some(target) = signal.target {
                    connector.target = Some(target);
                }
                if let Some(window) = signal.window {
                    connector.window = Some(window);
                }
                if let Some(capacity) = signal.capacity {
                    connector.capacity = Some(capacity);
                }
            }
            Event::Vehicle(vehicle_event) => {
                let time = self.current_time;
                let vehicle = self
                    .world
                    .vehicles
                    .get_mut(&vehicle_event.vehicle_id)
                    .ok_or_else(|| SimError::UnknownVehicle(vehicle_event.vehicle_id.clone()))?;
                apply_vehicle_update(vehicle, &vehicle_event.vehicle_id, vehicle_event.update, time)?;
            }
        }
        Ok(())
    }
}

fn apply_vehicle_update(
    vehicle: &mut Vehicle,
    vehicle_id: &str,
    update: VehicleUpdate,
    time: NaiveDateTime,
) -> SimResult<()> {
    match update {
        VehicleUpdate::Arrival {
            connected_charging_station,
            soc_delta,
            estimated_time_of_departure,
            desired_soc,
        } => {
            vehicle.connected_charging_station = Some(connected_charging_station);
            if let Some(departure) = estimated_time_of_departure {
                vehicle.estimated_time_of_departure = Some(departure);
            }
            if let Some(desired) = desired_soc {
                vehicle.desired_soc = desired;
            }
            vehicle.battery.soc += soc_delta;
            if vehicle.battery.soc < 0.0 {
                return Err(SimError::NegativeSocOnArrival {
                    vehicle: vehicle_id.to_owned(),
                    time,
                    soc: vehicle.battery.soc,
                    soc_delta,
                });
            }
        }
        VehicleUpdate::Departure {
            estimated_time_of_arrival,
        } => {
            vehicle.connected_charging_station = None;
            if let Some(arrival) = estimated_time_of_arrival {
                vehicle.estimated_time_of_arrival = Some(arrival);
            }
            if vehicle.battery.soc < (1.0 - DEPARTURE_SOC_MARGIN) * vehicle.desired_soc {
                return Err(SimError::DepartureBelowDesiredSoc {
                    vehicle: vehicle_id.to_owned(),
                    time,
                    soc: vehicle.battery.soc,
                    desired: vehicle.desired_soc,
                });
            }
        }
        VehicleUpdate::Schedule { schedule } => {
            vehicle.schedule = Some(schedule);
        }
    }
    Ok(())
}
