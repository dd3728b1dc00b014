//! Services - use cases driving the tracking domain
//!
//! - `reconciler` - fetch, map, merge, persist and publish for one code
//! - `registration` - start tracking a code or reactivate an inactive one
//! - `scheduler` - periodic batch reconciliation and daily maintenance

pub mod reconciler;
pub mod registration;
pub mod scheduler;

pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
pub use registration::{RegisterError, Registration, RegistrationService};
pub use scheduler::{Scheduler, SchedulerOptions, TickReport};
