//! Intent router: rule-based recognition first, optional LLM classifier
//! second, entity extraction always.

pub mod classifier;
pub mod entities;
pub mod router;
pub mod rules;

pub use classifier::{Classifier, ClassifierVerdict};
pub use router::{Classification, IntentRouter};
