//! Presentation seam: results become message bodies here, so channel
//! frontends (chat UI, CLI, TTS) only deal with rendered text plus the
//! original blocks.

use netmind_plugin::{ContentBlock, DispatchResult};

#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub text: String,
    pub blocks: Vec<ContentBlock>,
}

pub trait PresentationAdapter: Send + Sync {
    fn render(&self, result: &DispatchResult) -> RenderedMessage;
}

/// Default renderer: plain text, one line per block.
pub struct PlainTextAdapter;

impl PresentationAdapter for PlainTextAdapter {
    fn render(&self, result: &DispatchResult) -> RenderedMessage {
        let mut lines = Vec::new();
        for block in &result.output.blocks {
            match block {
                ContentBlock::Text { data, title, .. } => {
                    if let Some(title) = title {
                        lines.push(format!("{title}: {data}"));
                    } else {
                        lines.push(data.clone());
                    }
                }
                ContentBlock::Table { data, title, .. } => {
                    if let Some(title) = title {
                        lines.push(title.clone());
                    }
                    lines.push(data.clone());
                }
                ContentBlock::CameraLive { data, .. } => {
                    lines.push(format!("[podgląd na żywo] {data}"));
                }
                ContentBlock::Image { title, .. } => {
                    lines.push(format!("[obraz] {}", title.as_deref().unwrap_or("")));
                }
                ContentBlock::ConfigPrompt { data, .. } => {
                    lines.push(format!("[wymagana konfiguracja] {data}"));
                }
            }
        }
        RenderedMessage {
            text: lines.join("\n").trim().to_string(),
            blocks: result.output.blocks.clone(),
        }
    }
}
