//! Plugin contract and registry.
//!
//! Probe implementations (ICMP, ONVIF, HTTP fetch, MQTT, SSH, …) live
//! outside this workspace and are consumed through the [`Plugin`] trait.
//! This crate defines that contract, the explicit service bundle threaded
//! into every execution, and the registry that maps intents to capable
//! plugins.

pub mod context;
pub mod contract;
pub mod error;
pub mod llm;
pub mod registry;

pub use context::{ExecutionContext, NativeBridge, PluginContext, PluginServices};
pub use contract::{ContentBlock, DispatchResult, ExecutionOutput, ExecutionStatus, Plugin, ResultMetadata};
pub use error::{ExecutionError, Result};
pub use llm::{CompletionRequest, CompletionResponse, HttpLlmClient, LlmClient, LlmError};
pub use registry::PluginRegistry;
