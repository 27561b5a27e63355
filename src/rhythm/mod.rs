//! Circadian rhythm scheduling
//!
//! - `phase`: wall-clock hour to circadian phase
//! - `types`: rhythm classes, cycle metrics, clock
//! - `scheduler`: eligibility, execution loop and deferred-cycle replay
//! - `command`: processor that shells out to a transformation tool
//! - `state`: last-run timestamps persisted between invocations

pub mod command;
pub mod phase;
pub mod scheduler;
pub mod state;
pub mod types;

pub use command::CommandProcessor;
pub use phase::{phase, CircadianPhase};
pub use scheduler::{
    CycleOutcome, Processor, RhythmScheduler, RhythmStatus, SchedulerStatus, TickReport,
};
pub use state::SchedulerState;
pub use types::{Clock, CycleMetrics, RhythmType, SystemClock};
