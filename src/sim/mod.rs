//! Simulation core: world stepper, standing-time windows, and the schedule
//! strategy.

pub mod schedule;
pub mod stepper;
pub mod window;

pub use schedule::{ScheduleStrategy, StepOutput, SubStrategy};
pub use stepper::{Stepper, WorldState};
pub use window::{CoreStandingTime, TimeWindow};
