//! Database models (SQLx).

pub mod attempt;
pub mod run;
pub mod schedule;
pub mod target;

pub use attempt::{Attempt, ErrorClass};
pub use run::{Run, RunStatus};
pub use schedule::{Schedule, ScheduleStatus, ScheduleType};
pub use target::{HttpMethod, Target};
