use kproxy_common::ApiFormat;
use kproxy_protocol::openai::ChatCompletionChunk;
use kproxy_protocol::sse::SseFrame;
use kproxy_protocol::{anthropic, google, mistral};

use crate::map_openai_finish_reason;

/// Renders internal chunks as SSE frames in the client's declared format.
///
/// When the client's format equals the upstream format the core pipeline
/// passes original frames through and never constructs an emitter.
#[derive(Debug)]
pub struct StreamEmitter {
    format: ApiFormat,
    started: bool,
    block_open: bool,
    finished: bool,
    output_tokens: u32,
}

impl StreamEmitter {
    pub fn new(format: ApiFormat) -> Self {
        Self {
            format,
            started: false,
            block_open: false,
            finished: false,
            output_tokens: 0,
        }
    }

    pub fn emit(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseFrame> {
        if let Some(usage) = &chunk.usage {
            self.output_tokens = usage.completion_tokens;
        }
        match self.format {
            ApiFormat::OpenAi | ApiFormat::OpenAiImage => vec![data_frame(chunk)],
            ApiFormat::OpenAiText => self.emit_openai_text(chunk),
            ApiFormat::AnthropicChat => self.emit_anthropic_chat(chunk),
            ApiFormat::AnthropicText => self.emit_anthropic_text(chunk),
            ApiFormat::GoogleAi => self.emit_google(chunk),
            ApiFormat::Mistral | ApiFormat::MistralText => self.emit_mistral(chunk),
        }
    }

    /// Trailing frames once the upstream stream ends.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        match self.format {
            ApiFormat::OpenAi | ApiFormat::OpenAiText | ApiFormat::OpenAiImage => {
                vec![done_frame()]
            }
            ApiFormat::AnthropicChat => {
                let mut frames = Vec::new();
                if self.block_open {
                    self.block_open = false;
                    frames.push(named_frame(&anthropic::StreamEvent::ContentBlockStop {
                        index: 0,
                    }));
                }
                if !self.finished {
                    self.finished = true;
                    frames.push(named_frame(&anthropic::StreamEvent::MessageDelta {
                        delta: anthropic::MessageDelta {
                            stop_reason: Some("end_turn".to_string()),
                            stop_sequence: None,
                        },
                        usage: Some(anthropic::DeltaUsage {
                            output_tokens: self.output_tokens,
                        }),
                    }));
                }
                frames.push(named_frame(&anthropic::StreamEvent::MessageStop));
                frames
            }
            ApiFormat::AnthropicText => Vec::new(),
            ApiFormat::GoogleAi => Vec::new(),
            ApiFormat::Mistral | ApiFormat::MistralText => vec![done_frame()],
        }
    }

    fn emit_openai_text(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseFrame> {
        let text = chunk.first_content().unwrap_or_default();
        let finish = chunk.finish_reason();
        if text.is_empty() && finish.is_none() {
            return Vec::new();
        }
        let body = serde_json::json!({
            "id": chunk.id,
            "object": "text_completion",
            "created": chunk.created,
            "model": chunk.model,
            "choices": [{"index": 0, "text": text, "finish_reason": finish}],
        });
        vec![json_frame(None, &body)]
    }

    fn emit_anthropic_chat(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.started {
            self.started = true;
            let message = anthropic::MessagesResponse {
                id: chunk.id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: chunk.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: anthropic::MessagesUsage {
                    input_tokens: chunk.usage.map(|u| u.prompt_tokens).unwrap_or(0),
                    output_tokens: 0,
                },
            };
            frames.push(named_frame(&anthropic::StreamEvent::MessageStart { message }));
            frames.push(named_frame(&anthropic::StreamEvent::ContentBlockStart {
                index: 0,
                content_block: anthropic::ContentBlock::Text {
                    text: String::new(),
                },
            }));
            self.block_open = true;
        }
        if let Some(text) = chunk.first_content().filter(|t| !t.is_empty()) {
            frames.push(named_frame(&anthropic::StreamEvent::ContentBlockDelta {
                index: 0,
                delta: anthropic::ContentDelta::TextDelta {
                    text: text.to_string(),
                },
            }));
        }
        if let Some(reason) = chunk.finish_reason() {
            if self.block_open {
                self.block_open = false;
                frames.push(named_frame(&anthropic::StreamEvent::ContentBlockStop {
                    index: 0,
                }));
            }
            self.finished = true;
            frames.push(named_frame(&anthropic::StreamEvent::MessageDelta {
                delta: anthropic::MessageDelta {
                    stop_reason: Some(map_openai_finish_reason(reason).to_string()),
                    stop_sequence: None,
                },
                usage: Some(anthropic::DeltaUsage {
                    output_tokens: self.output_tokens,
                }),
            }));
        }
        frames
    }

    fn emit_anthropic_text(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseFrame> {
        let completion = chunk.first_content().unwrap_or_default().to_string();
        let stop_reason = chunk
            .finish_reason()
            .map(|reason| map_openai_finish_reason(reason).to_string());
        if completion.is_empty() && stop_reason.is_none() {
            return Vec::new();
        }
        let body = anthropic::CompleteResponse {
            completion,
            stop_reason,
            model: Some(chunk.model.clone()),
        };
        vec![json_frame(Some("completion"), &body)]
    }

    fn emit_google(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseFrame> {
        let text = chunk.first_content().unwrap_or_default();
        let finish = chunk.finish_reason().map(|reason| match reason {
            "length" => "MAX_TOKENS".to_string(),
            "content_filter" => "SAFETY".to_string(),
            _ => "STOP".to_string(),
        });
        if text.is_empty() && finish.is_none() {
            return Vec::new();
        }
        let element = google::GenerateContentResponse {
            candidates: vec![google::Candidate {
                content: Some(google::Content {
                    role: Some("model".to_string()),
                    parts: vec![google::Part::Text {
                        text: text.to_string(),
                    }],
                }),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: chunk.usage.map(|usage| google::UsageMetadata {
                prompt_token_count: usage.prompt_tokens,
                candidates_token_count: usage.completion_tokens,
                total_token_count: usage.total_tokens,
            }),
            prompt_feedback: None,
        };
        vec![json_frame(None, &element)]
    }

    fn emit_mistral(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseFrame> {
        let out = mistral::ChatChunk {
            id: chunk.id.clone(),
            model: chunk.model.clone(),
            choices: chunk
                .choices
                .iter()
                .map(|choice| mistral::ChunkChoice {
                    index: choice.index,
                    delta: mistral::ChunkDelta {
                        role: choice.delta.role.clone(),
                        content: choice.delta.content.clone(),
                    },
                    finish_reason: choice.finish_reason.clone(),
                })
                .collect(),
            usage: chunk.usage.map(|usage| mistral::Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        };
        vec![json_frame(None, &out)]
    }
}

fn data_frame(chunk: &ChatCompletionChunk) -> SseFrame {
    json_frame(None, chunk)
}

fn json_frame<T: serde::Serialize>(event: Option<&str>, body: &T) -> SseFrame {
    SseFrame {
        event: event.map(|name| name.to_string()),
        // Serialization of these shapes cannot fail; fall back to an empty
        // object rather than poisoning the stream.
        data: serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string()),
    }
}

fn done_frame() -> SseFrame {
    SseFrame {
        event: None,
        data: "[DONE]".to_string(),
    }
}

fn named_frame(event: &anthropic::StreamEvent) -> SseFrame {
    SseFrame {
        event: Some(event.event_name().to_string()),
        data: serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kproxy_protocol::openai::ChunkDelta;

    fn chunk(content: Option<&str>, finish: Option<&str>) -> ChatCompletionChunk {
        let delta = match content {
            Some(text) => ChunkDelta::text(text),
            None => ChunkDelta::role("assistant"),
        };
        ChatCompletionChunk::new("chatcmpl-1", "gpt-4o", 1)
            .with_delta(delta, finish.map(|f| f.to_string()))
    }

    #[test]
    fn anthropic_chat_emits_full_event_sequence() {
        let mut emitter = StreamEmitter::new(ApiFormat::AnthropicChat);
        let mut names: Vec<String> = Vec::new();
        for frame in emitter.emit(&chunk(None, None)) {
            names.push(frame.event.clone().unwrap());
        }
        for frame in emitter.emit(&chunk(Some("hi"), None)) {
            names.push(frame.event.clone().unwrap());
        }
        for frame in emitter.emit(&chunk(None, Some("stop"))) {
            names.push(frame.event.clone().unwrap());
        }
        for frame in emitter.finish() {
            names.push(frame.event.clone().unwrap());
        }
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn openai_passthrough_terminates_with_done() {
        let mut emitter = StreamEmitter::new(ApiFormat::OpenAi);
        let frames = emitter.emit(&chunk(Some("x"), None));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.contains("\"content\":\"x\""));
        let frames = emitter.finish();
        assert_eq!(frames[0].data, "[DONE]");
    }

    #[test]
    fn google_chunks_map_finish_reasons() {
        let mut emitter = StreamEmitter::new(ApiFormat::GoogleAi);
        let frames = emitter.emit(&chunk(Some("x"), Some("length")));
        assert!(frames[0].data.contains("MAX_TOKENS"));
    }
}
