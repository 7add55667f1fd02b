//! Production [`LanguageModel`] port, backed by the Claude Messages API via
//! tool use: the Action Catalog's JSON Schema is offered as a single forced
//! tool, and the model's `tool_use` input block *is* the decoded action,
//! with no free-text parsing in between.

use crate::ports::{LanguageModel, PortError};
use composable_rust_anthropic::types::{ContentBlock, Message, Tool};
use composable_rust_anthropic::{AnthropicClient, MessagesRequest};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const DECODE_TOOL_NAME: &str = "decode_action";

/// Adapts [`AnthropicClient`] to this crate's [`LanguageModel`] port.
pub struct AnthropicLanguageModel {
    client: AnthropicClient,
    model: String,
    max_tokens: u32,
}

impl AnthropicLanguageModel {
    /// Wraps `client`, calling `model` (e.g. `claude-sonnet-4-5-20250929`)
    /// for every decode.
    #[must_use]
    pub fn new(client: AnthropicClient, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
        }
    }
}

impl LanguageModel for AnthropicLanguageModel {
    fn complete(&self, prompt: &str, schema: &serde_json::Value, deadline: Duration) -> BoxFuture<'_, Result<serde_json::Value, PortError>> {
        let prompt = prompt.to_string();
        let schema = schema.clone();
        Box::pin(async move {
            let request = MessagesRequest::new(vec![Message::user(prompt)])
                .with_model(self.model.clone())
                .with_max_tokens(self.max_tokens)
                .with_tools(vec![Tool {
                    name: DECODE_TOOL_NAME.to_string(),
                    description: "Decode the user's message into exactly one structured shopping action.".to_string(),
                    input_schema: schema,
                }]);

            let response = tokio::time::timeout(deadline, self.client.messages(request))
                .await
                .map_err(|_| PortError::Timeout)?
                .map_err(|error| PortError::Other(error.to_string()))?;

            response
                .content
                .into_iter()
                .find_map(|block| match block {
                    ContentBlock::ToolUse { name, input, .. } if name == DECODE_TOOL_NAME => Some(input),
                    _ => None,
                })
                .ok_or_else(|| PortError::Other("model did not call the decode tool".to_string()))
        })
    }
}
