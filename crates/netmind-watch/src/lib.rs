//! Reactive monitoring: snapshot diffing and the watch scheduler.
//!
//! [`detector::ChangeDetector`] canonicalizes and scores snapshot pairs;
//! [`manager::WatchManager`] owns the rule table on a single task, polls
//! targets at service-tuned cadence, persists snapshot/change chains and
//! emits change events back toward the conversation.

pub mod detector;
pub mod error;
pub mod manager;
pub mod probe;
pub mod types;

pub use detector::ChangeDetector;
pub use error::{Result, WatchError};
pub use manager::{WatchDeps, WatchHandle, WatchManager};
pub use probe::{Observation, PluginProbe, WatchProbe};
pub use types::{ChangeEvent, RuleState};
