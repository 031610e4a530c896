pub mod clock;
pub mod document;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use document::Document;
pub use error::{Result, StateError};
pub use types::{EntityKey, Platform, SchemaVersion};
