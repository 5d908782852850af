use kproxy_protocol::openai::{
    ChatCompletionRequest, ChatContent, ChatMessage, CompletionRequest,
};
use serde_json::Value;

use crate::TransformError;

/// Legacy text completions ride the chat endpoint upstream: the prompt
/// becomes a single user turn.
pub fn chat(body: &Value) -> Result<Value, TransformError> {
    let req: CompletionRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let out = ChatCompletionRequest {
        model: req.model,
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: Some(ChatContent::Text(req.prompt)),
            name: None,
        }],
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        n: None,
        stop: req.stop,
        stream: req.stream,
        presence_penalty: None,
        frequency_penalty: None,
        logit_bias: None,
        user: None,
        extra: serde_json::Map::new(),
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}
