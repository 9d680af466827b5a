//! The conversation control plane: plugin dispatch, the turn lifecycle,
//! auto-watch integration and quick-action resolution.

pub mod autowatch;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod quick_actions;
pub mod render;
pub mod summary;

pub use autowatch::AutoWatchIntegrator;
pub use dispatcher::Dispatcher;
pub use error::{ChatError, Result};
pub use orchestrator::{ChatOrchestrator, OrchestratorDeps, TurnOutcome};
pub use quick_actions::{QuickAction, QuickActionKind};
pub use render::{PlainTextAdapter, PresentationAdapter, RenderedMessage};
