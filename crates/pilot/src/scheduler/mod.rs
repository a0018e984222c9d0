//! Scheduler module
//!
//! Split planning, chunk migration and the balancer loop

mod balancer;
mod migration;
mod split;

pub use balancer::{Balancer, RoundReport};
pub use migration::{MigrationCoordinator, MigrationError, MigrationPhase, MigrationTicket};
pub use split::{median_split_point, SplitError, SplitOutcome, SplitPlanner, SplitRequest};
