//! Domain models - tracking aggregate and the values around it
//!
//! - `types` - carrier, tracking code value, canonical status
//! - `status_map` - carrier wording to canonical status
//! - `interval` - adaptive polling interval
//! - `tracking` - the `TrackingCode` aggregate and its events
//! - `error` - validation errors

pub mod error;
pub mod interval;
pub mod status_map;
pub mod tracking;
pub mod types;

pub use error::ValidationError;
pub use tracking::{TrackingCode, TrackingEvent, TrackingMetadata};
pub use types::{Carrier, TrackingCodeValue, TrackingStatus};
