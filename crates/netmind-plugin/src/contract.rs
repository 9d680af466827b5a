use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use netmind_core::types::IntentKind;

use crate::context::{ExecutionContext, PluginContext};
use crate::error::ExecutionError;

/// Rendered payload unit inside an assistant message. Tagged so the
/// presentation layer can pick a renderer without inspecting the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Live camera stream reference (data = stream URL).
    CameraLive {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Still image (data = base64 or a fetchable reference).
    Image {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Tabular results (data = rendered text, payload = structured rows).
    Table {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// The plugin needs configuration (credentials, endpoint) before it
    /// can proceed; data describes what is missing.
    ConfigPrompt {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(data: impl Into<String>) -> Self {
        ContentBlock::Text {
            data: data.into(),
            title: None,
            summary: None,
        }
    }

    pub fn config_prompt(data: impl Into<String>) -> Self {
        ContentBlock::ConfigPrompt {
            data: data.into(),
            title: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::CameraLive { .. } => "camera_live",
            ContentBlock::Image { .. } => "image",
            ContentBlock::Table { .. } => "table",
            ContentBlock::ConfigPrompt { .. } => "config_prompt",
        }
    }

    pub fn data(&self) -> &str {
        match self {
            ContentBlock::Text { data, .. }
            | ContentBlock::CameraLive { data, .. }
            | ContentBlock::Image { data, .. }
            | ContentBlock::Table { data, .. }
            | ContentBlock::ConfigPrompt { data, .. } => data,
        }
    }
}

/// Execution outcome class. Partial results are surfaced as-is, never
/// retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Error,
}

/// Side-band facts about an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Wall-clock execution time, filled by the dispatcher.
    pub duration_ms: u64,
    /// True when this result was served from an in-flight duplicate.
    pub cached: bool,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_count: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What a plugin returns from `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub status: ExecutionStatus,
    pub blocks: Vec<ContentBlock>,
    #[serde(default)]
    pub metadata: ResultMetadata,
}

impl ExecutionOutput {
    pub fn success(blocks: Vec<ContentBlock>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            blocks,
            metadata: ResultMetadata::default(),
        }
    }

    pub fn partial(blocks: Vec<ContentBlock>) -> Self {
        Self {
            status: ExecutionStatus::Partial,
            blocks,
            metadata: ResultMetadata::default(),
        }
    }

    /// Concatenated text of all text-bearing blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.data())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A completed dispatch: which plugin ran and what it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub plugin_id: String,
    pub output: ExecutionOutput,
}

/// The plugin contract.
///
/// `can_handle` must be cheap and side-effect free; `execute` may
/// perform I/O and must observe the context's cancellation token at
/// every suspension point.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable unique id, also the unit of scope filtering.
    fn id(&self) -> &str;

    fn supported_intents(&self) -> &[IntentKind];

    /// Higher wins ties during selection.
    fn priority(&self) -> i32 {
        0
    }

    /// False forces the privileged runtime.
    fn browser_compatible(&self) -> bool {
        true
    }

    /// Keyword hints fed to the LLM classifier.
    fn keyword_hints(&self) -> &[&str] {
        &[]
    }

    fn can_handle(&self, _text: &str, _ctx: &PluginContext) -> bool {
        true
    }

    async fn initialize(&self, _ctx: &PluginContext) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn execute(
        &self,
        text: &str,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError>;

    async fn dispose(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_serializes_with_type_tag() {
        let block = ContentBlock::text("hello");
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains(r#""type":"text""#));
        assert!(json.contains(r#""data":"hello""#));
        // absent optionals are omitted entirely
        assert!(!json.contains("title"));
    }

    #[test]
    fn config_prompt_round_trips() {
        let json = r#"{"type":"config_prompt","data":"rtsp credentials missing"}"#;
        let block: ContentBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.type_name(), "config_prompt");
        assert_eq!(block.data(), "rtsp credentials missing");
    }

    #[test]
    fn output_text_joins_blocks() {
        let out = ExecutionOutput::success(vec![
            ContentBlock::text("line one"),
            ContentBlock::text("line two"),
        ]);
        assert_eq!(out.text(), "line one\nline two");
    }
}
