use kproxy_protocol::mistral;
use serde_json::Value;

use crate::TransformError;

/// Bedrock-hosted Mistral models take a raw `[INST]`-tagged prompt instead of
/// a message list.
pub fn text(body: &Value) -> Result<Value, TransformError> {
    let req: mistral::ChatRequest =
        serde_json::from_value(body.clone()).map_err(TransformError::decode)?;

    let mut prompt = String::from("<s>");
    let mut inst: Vec<&str> = Vec::new();
    for message in &req.messages {
        match message.role.as_str() {
            "assistant" => {
                prompt.push_str("[INST] ");
                prompt.push_str(&inst.join("\n"));
                prompt.push_str(" [/INST] ");
                inst.clear();
                prompt.push_str(&message.content);
                prompt.push_str("</s>");
            }
            _ => inst.push(&message.content),
        }
    }
    prompt.push_str("[INST] ");
    prompt.push_str(&inst.join("\n"));
    prompt.push_str(" [/INST]");

    let mut stop = req.stop.unwrap_or_default();
    if !stop.iter().any(|s| s == "</s>") {
        stop.push("</s>".to_string());
    }

    let out = mistral::TextRequest {
        prompt,
        max_tokens: req.max_tokens,
        stop: Some(stop),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
    };
    serde_json::to_value(out).map_err(TransformError::decode)
}
