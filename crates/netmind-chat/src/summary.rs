//! TTS-friendly summaries of bulk results.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use netmind_plugin::{CompletionRequest, LlmClient};

/// Results shorter than this are already speakable.
pub const BULK_TEXT_THRESHOLD: usize = 600;

const SUMMARY_TIMEOUT: Duration = Duration::from_secs(10);

/// Summarize a bulk result for speech output. Returns `None` on any
/// failure; the caller simply skips the summary.
pub async fn summarize_for_speech(llm: &Arc<dyn LlmClient>, text: &str) -> Option<String> {
    let request = CompletionRequest::new(
        "Streść poniższy wynik w maksymalnie dwóch zdaniach, po polsku, \
         tak aby nadawał się do odczytania na głos. Bez list i bez adresów URL.",
        text.to_string(),
    );
    match tokio::time::timeout(SUMMARY_TIMEOUT, llm.complete(&request)).await {
        Ok(Ok(response)) => Some(response.content.trim().to_string()),
        Ok(Err(e)) => {
            warn!("summary generation failed: {e}");
            None
        }
        Err(_) => {
            warn!("summary generation timed out");
            None
        }
    }
}
