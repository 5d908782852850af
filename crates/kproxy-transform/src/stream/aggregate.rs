use kproxy_common::ApiFormat;
use kproxy_protocol::openai::{self, ChatCompletionChunk, Usage};
use kproxy_protocol::{anthropic, google, mistral};
use serde_json::Value;

use crate::{TransformError, map_openai_finish_reason};

/// Collects internal chunks into a canonical final response so post-stream
/// middleware (usage accounting, event sinks) can see a fully assembled body.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    id: String,
    model: String,
    created: i64,
    content: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    events: usize,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &ChatCompletionChunk) {
        self.events += 1;
        if self.id.is_empty() {
            self.id = chunk.id.clone();
            self.model = chunk.model.clone();
            self.created = chunk.created;
        }
        if let Some(text) = chunk.first_content() {
            self.content.push_str(text);
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
    }

    /// Number of chunks aggregated so far. Zero means the stream died before
    /// producing anything usable.
    pub fn events_seen(&self) -> usize {
        self.events
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn completion_tokens(&self) -> Option<u32> {
        self.usage.map(|usage| usage.completion_tokens)
    }

    /// Render the assembled response in the client's requested format.
    pub fn finish(&self, format: ApiFormat) -> Result<Value, TransformError> {
        match format {
            ApiFormat::OpenAi | ApiFormat::OpenAiImage => self.finish_openai_chat(),
            ApiFormat::OpenAiText => self.finish_openai_text(),
            ApiFormat::AnthropicChat => self.finish_anthropic_chat(),
            ApiFormat::AnthropicText => self.finish_anthropic_text(),
            ApiFormat::GoogleAi => self.finish_google(),
            ApiFormat::Mistral => self.finish_mistral_chat(),
            ApiFormat::MistralText => self.finish_mistral_text(),
        }
    }

    fn finish_openai_chat(&self) -> Result<Value, TransformError> {
        let out = openai::ChatCompletionResponse {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::ChatChoice {
                index: 0,
                message: openai::ChatResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(self.content.clone()),
                },
                finish_reason: self.finish_reason.clone(),
            }],
            usage: self.usage,
        };
        serde_json::to_value(out).map_err(TransformError::decode)
    }

    fn finish_openai_text(&self) -> Result<Value, TransformError> {
        let out = openai::CompletionResponse {
            id: self.id.clone(),
            object: "text_completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::CompletionChoice {
                index: 0,
                text: self.content.clone(),
                finish_reason: self.finish_reason.clone(),
            }],
            usage: self.usage,
        };
        serde_json::to_value(out).map_err(TransformError::decode)
    }

    fn finish_anthropic_chat(&self) -> Result<Value, TransformError> {
        let out = anthropic::MessagesResponse {
            id: self.id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![anthropic::ContentBlock::Text {
                text: self.content.clone(),
            }],
            model: self.model.clone(),
            stop_reason: self
                .finish_reason
                .as_deref()
                .map(|reason| map_openai_finish_reason(reason).to_string()),
            stop_sequence: None,
            usage: anthropic::MessagesUsage {
                input_tokens: self.usage.map(|u| u.prompt_tokens).unwrap_or(0),
                output_tokens: self.usage.map(|u| u.completion_tokens).unwrap_or(0),
            },
        };
        serde_json::to_value(out).map_err(TransformError::decode)
    }

    fn finish_anthropic_text(&self) -> Result<Value, TransformError> {
        let out = anthropic::CompleteResponse {
            completion: self.content.clone(),
            stop_reason: self
                .finish_reason
                .as_deref()
                .map(|reason| map_openai_finish_reason(reason).to_string()),
            model: Some(self.model.clone()),
        };
        serde_json::to_value(out).map_err(TransformError::decode)
    }

    fn finish_google(&self) -> Result<Value, TransformError> {
        let finish = self.finish_reason.as_deref().map(|reason| match reason {
            "length" => "MAX_TOKENS".to_string(),
            "content_filter" => "SAFETY".to_string(),
            _ => "STOP".to_string(),
        });
        let out = google::GenerateContentResponse {
            candidates: vec![google::Candidate {
                content: Some(google::Content {
                    role: Some("model".to_string()),
                    parts: vec![google::Part::Text {
                        text: self.content.clone(),
                    }],
                }),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: self.usage.map(|usage| google::UsageMetadata {
                prompt_token_count: usage.prompt_tokens,
                candidates_token_count: usage.completion_tokens,
                total_token_count: usage.total_tokens,
            }),
            prompt_feedback: None,
        };
        serde_json::to_value(out).map_err(TransformError::decode)
    }

    fn finish_mistral_chat(&self) -> Result<Value, TransformError> {
        let out = mistral::ChatResponse {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![mistral::ChatChoice {
                index: 0,
                message: mistral::ChatMessage {
                    role: "assistant".to_string(),
                    content: self.content.clone(),
                },
                finish_reason: self.finish_reason.clone(),
            }],
            usage: self.usage.map(|usage| mistral::Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        };
        serde_json::to_value(out).map_err(TransformError::decode)
    }

    fn finish_mistral_text(&self) -> Result<Value, TransformError> {
        let out = mistral::TextResponse {
            outputs: vec![mistral::TextOutput {
                text: self.content.clone(),
                stop_reason: self.finish_reason.clone(),
            }],
        };
        serde_json::to_value(out).map_err(TransformError::decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kproxy_protocol::openai::ChunkDelta;

    fn feed(aggregator: &mut StreamAggregator) {
        let base = ChatCompletionChunk::new("chatcmpl-1", "gpt-4o", 7);
        aggregator.push(&base.clone().with_delta(ChunkDelta::role("assistant"), None));
        aggregator.push(&base.clone().with_delta(ChunkDelta::text("hel"), None));
        aggregator.push(&base.clone().with_delta(ChunkDelta::text("lo"), None));
        let mut last = base.with_delta(ChunkDelta::default(), Some("stop".to_string()));
        last.usage = Some(Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        });
        aggregator.push(&last);
    }

    #[test]
    fn openai_final_response_assembles() {
        let mut aggregator = StreamAggregator::new();
        feed(&mut aggregator);
        assert_eq!(aggregator.events_seen(), 4);
        let out = aggregator.finish(ApiFormat::OpenAi).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hello");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["completion_tokens"], 2);
    }

    #[test]
    fn anthropic_final_response_maps_stop_reason() {
        let mut aggregator = StreamAggregator::new();
        feed(&mut aggregator);
        let out = aggregator.finish(ApiFormat::AnthropicChat).unwrap();
        assert_eq!(out["content"][0]["text"], "hello");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["output_tokens"], 2);
    }
}
