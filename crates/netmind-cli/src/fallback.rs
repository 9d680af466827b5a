//! Built-in conversational plugin so a bare process still answers.

use async_trait::async_trait;

use netmind_core::types::IntentKind;
use netmind_plugin::{
    CompletionRequest, ContentBlock, ExecutionContext, ExecutionError, ExecutionOutput, Plugin,
};

const WELCOME: &str = "Jestem asystentem sieciowym. Spróbuj: 'skanuj sieć', \
    'ping 192.168.1.1' albo '? <zapytanie>'.";

pub struct ChatPlugin;

#[async_trait]
impl Plugin for ChatPlugin {
    fn id(&self) -> &str {
        "chat"
    }

    fn supported_intents(&self) -> &[IntentKind] {
        &[IntentKind::ChatAsk, IntentKind::ChatFallback]
    }

    fn keyword_hints(&self) -> &[&str] {
        &["pytanie", "question", "help", "pomoc"]
    }

    async fn execute(
        &self,
        text: &str,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let Some(llm) = ctx.plugin.services.llm.clone() else {
            return Ok(ExecutionOutput::success(vec![ContentBlock::text(WELCOME)]));
        };

        ctx.check_cancelled()?;
        let request = CompletionRequest::new(
            "Jesteś asystentem operacji sieciowych. Odpowiadaj krótko, po polsku lub po \
             angielsku, zależnie od języka pytania.",
            text.to_string(),
        );
        match llm.complete(&request).await {
            Ok(response) => Ok(ExecutionOutput::success(vec![ContentBlock::text(
                response.content,
            )])),
            Err(e) => Err(ExecutionError::Upstream {
                service: "llm".to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
