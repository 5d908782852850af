use kproxy_common::ApiFormat;
use kproxy_protocol::openai::{ChatCompletionChunk, ChunkDelta, Usage};
use kproxy_protocol::{anthropic, google, mistral, openai};

use super::StreamItem;
use crate::{TransformError, map_anthropic_stop_reason, map_google_finish_reason};

/// Converts provider streaming events into internal chunks. One adapter per
/// upstream call; it carries the message identity discovered mid-stream.
#[derive(Debug)]
pub struct StreamAdapter {
    format: ApiFormat,
    id: String,
    model: String,
    created: i64,
    prompt_tokens: u32,
    output_tokens: u32,
    role_emitted: bool,
}

impl StreamAdapter {
    pub fn new(format: ApiFormat, model: &str) -> Self {
        Self {
            format,
            id: format!("chatcmpl-{model}"),
            model: model.to_string(),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
            prompt_tokens: 0,
            output_tokens: 0,
            role_emitted: false,
        }
    }

    /// Feed one event payload (the `data` of an SSE frame, or the inner JSON
    /// of an AWS event-stream frame).
    pub fn adapt(&mut self, data: &str) -> Result<Vec<StreamItem>, TransformError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(vec![StreamItem::Done]);
        }
        match self.format {
            ApiFormat::OpenAi | ApiFormat::OpenAiText | ApiFormat::OpenAiImage => {
                self.adapt_openai(data)
            }
            ApiFormat::AnthropicChat => self.adapt_anthropic_chat(data),
            ApiFormat::AnthropicText => self.adapt_anthropic_text(data),
            ApiFormat::GoogleAi => self.adapt_google(data),
            ApiFormat::Mistral => self.adapt_mistral_chat(data),
            ApiFormat::MistralText => self.adapt_mistral_text(data),
        }
    }

    fn adapt_openai(&mut self, data: &str) -> Result<Vec<StreamItem>, TransformError> {
        if let Ok(err) = serde_json::from_str::<openai::ErrorResponse>(data)
            && !err.error.message.is_empty()
        {
            return Ok(vec![StreamItem::UpstreamError {
                error_type: err.error.error_type,
                message: err.error.message,
            }]);
        }
        let chunk: ChatCompletionChunk =
            serde_json::from_str(data).map_err(TransformError::decode)?;
        Ok(vec![StreamItem::Chunk(chunk)])
    }

    fn adapt_anthropic_chat(&mut self, data: &str) -> Result<Vec<StreamItem>, TransformError> {
        let event: anthropic::StreamEvent =
            serde_json::from_str(data).map_err(TransformError::decode)?;
        let mut items = Vec::new();
        match event {
            anthropic::StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.prompt_tokens = message.usage.input_tokens;
                self.role_emitted = true;
                items.push(StreamItem::Chunk(
                    self.chunk().with_delta(ChunkDelta::role("assistant"), None),
                ));
            }
            anthropic::StreamEvent::ContentBlockStart { content_block, .. } => {
                if let anthropic::ContentBlock::Text { text } = content_block
                    && !text.is_empty()
                {
                    items.push(StreamItem::Chunk(
                        self.chunk().with_delta(ChunkDelta::text(text), None),
                    ));
                }
            }
            anthropic::StreamEvent::ContentBlockDelta { delta, .. } => {
                if let anthropic::ContentDelta::TextDelta { text } = delta {
                    items.push(StreamItem::Chunk(
                        self.chunk().with_delta(ChunkDelta::text(text), None),
                    ));
                }
            }
            anthropic::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.output_tokens = usage.output_tokens;
                }
                if let Some(stop_reason) = delta.stop_reason {
                    let mut chunk = self.chunk().with_delta(
                        ChunkDelta::default(),
                        Some(map_anthropic_stop_reason(&stop_reason).to_string()),
                    );
                    chunk.usage = Some(self.usage());
                    items.push(StreamItem::Chunk(chunk));
                }
            }
            anthropic::StreamEvent::MessageStop => items.push(StreamItem::Done),
            anthropic::StreamEvent::Error { error } => items.push(StreamItem::UpstreamError {
                error_type: error.error_type,
                message: error.message,
            }),
            anthropic::StreamEvent::ContentBlockStop { .. }
            | anthropic::StreamEvent::Ping
            | anthropic::StreamEvent::Unknown(_) => {}
        }
        Ok(items)
    }

    fn adapt_anthropic_text(&mut self, data: &str) -> Result<Vec<StreamItem>, TransformError> {
        if let Ok(err) = serde_json::from_str::<anthropic::ErrorResponse>(data)
            && err.response_type == "error"
        {
            return Ok(vec![StreamItem::UpstreamError {
                error_type: err.error.error_type,
                message: err.error.message,
            }]);
        }
        let event: anthropic::CompleteResponse =
            serde_json::from_str(data).map_err(TransformError::decode)?;
        let mut items = Vec::new();
        if !self.role_emitted {
            self.role_emitted = true;
            items.push(StreamItem::Chunk(
                self.chunk().with_delta(ChunkDelta::role("assistant"), None),
            ));
        }
        let finish = event
            .stop_reason
            .as_deref()
            .map(|reason| map_anthropic_stop_reason(reason).to_string());
        if !event.completion.is_empty() || finish.is_some() {
            let delta = if event.completion.is_empty() {
                ChunkDelta::default()
            } else {
                ChunkDelta::text(event.completion)
            };
            items.push(StreamItem::Chunk(self.chunk().with_delta(delta, finish)));
        }
        Ok(items)
    }

    fn adapt_google(&mut self, data: &str) -> Result<Vec<StreamItem>, TransformError> {
        let element: google::GenerateContentResponse =
            serde_json::from_str(data).map_err(TransformError::decode)?;
        if let Some(meta) = element.usage_metadata {
            self.prompt_tokens = meta.prompt_token_count;
            self.output_tokens = meta.candidates_token_count;
        }
        let mut items = Vec::new();
        if !self.role_emitted {
            self.role_emitted = true;
            items.push(StreamItem::Chunk(
                self.chunk().with_delta(ChunkDelta::role("assistant"), None),
            ));
        }
        let text = element.first_candidate_text();
        let finish = element
            .finish_reason()
            .map(|reason| map_google_finish_reason(reason).to_string());
        if !text.is_empty() || finish.is_some() {
            let delta = if text.is_empty() {
                ChunkDelta::default()
            } else {
                ChunkDelta::text(text)
            };
            let mut chunk = self.chunk().with_delta(delta, finish.clone());
            if finish.is_some() {
                chunk.usage = Some(self.usage());
            }
            items.push(StreamItem::Chunk(chunk));
        }
        Ok(items)
    }

    fn adapt_mistral_chat(&mut self, data: &str) -> Result<Vec<StreamItem>, TransformError> {
        let chunk: mistral::ChatChunk =
            serde_json::from_str(data).map_err(TransformError::decode)?;
        if let Some(usage) = chunk.usage {
            self.prompt_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }
        let mut out = self.chunk();
        for choice in chunk.choices {
            out.choices.push(openai::ChunkChoice {
                index: choice.index,
                delta: ChunkDelta {
                    role: choice.delta.role,
                    content: choice.delta.content,
                },
                finish_reason: choice.finish_reason,
            });
        }
        if out.choices.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![StreamItem::Chunk(out)])
    }

    fn adapt_mistral_text(&mut self, data: &str) -> Result<Vec<StreamItem>, TransformError> {
        let element: mistral::TextResponse =
            serde_json::from_str(data).map_err(TransformError::decode)?;
        let mut items = Vec::new();
        if !self.role_emitted {
            self.role_emitted = true;
            items.push(StreamItem::Chunk(
                self.chunk().with_delta(ChunkDelta::role("assistant"), None),
            ));
        }
        for output in element.outputs {
            let finish = output.stop_reason.clone();
            items.push(StreamItem::Chunk(
                self.chunk().with_delta(ChunkDelta::text(output.text), finish),
            ));
        }
        Ok(items)
    }

    fn chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::new(self.id.clone(), self.model.clone(), self.created)
    }

    fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.prompt_tokens + self.output_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_chat_events_become_chunks() {
        let mut adapter = StreamAdapter::new(ApiFormat::AnthropicChat, "claude-3-5-sonnet");
        let start = r#"{"type":"message_start","message":{"id":"msg_01","type":"message","role":"assistant","model":"claude-3-5-sonnet-20240620","content":[],"usage":{"input_tokens":9,"output_tokens":0}}}"#;
        let items = adapter.adapt(start).unwrap();
        assert_eq!(items.len(), 1);
        match &items[0] {
            StreamItem::Chunk(chunk) => {
                assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));
                assert_eq!(chunk.model, "claude-3-5-sonnet-20240620");
            }
            other => panic!("unexpected item: {other:?}"),
        }

        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#;
        let items = adapter.adapt(delta).unwrap();
        assert!(matches!(&items[0], StreamItem::Chunk(c) if c.first_content() == Some("hi")));

        let stop = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#;
        let items = adapter.adapt(stop).unwrap();
        match &items[0] {
            StreamItem::Chunk(chunk) => {
                assert_eq!(chunk.finish_reason(), Some("stop"));
                assert_eq!(chunk.usage.unwrap().completion_tokens, 4);
                assert_eq!(chunk.usage.unwrap().prompt_tokens, 9);
            }
            other => panic!("unexpected item: {other:?}"),
        }

        let items = adapter.adapt(r#"{"type":"message_stop"}"#).unwrap();
        assert!(matches!(items[0], StreamItem::Done));
    }

    #[test]
    fn anthropic_error_event_surfaces() {
        let mut adapter = StreamAdapter::new(ApiFormat::AnthropicChat, "claude-3-5-sonnet");
        let raw = r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#;
        let items = adapter.adapt(raw).unwrap();
        assert!(matches!(
            &items[0],
            StreamItem::UpstreamError { error_type, .. } if error_type == "overloaded_error"
        ));
    }

    #[test]
    fn google_stream_elements_become_chunks() {
        let mut adapter = StreamAdapter::new(ApiFormat::GoogleAi, "gemini-1.5-pro");
        let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hey"}]},"finishReason":"STOP"}]}"#;
        let items = adapter.adapt(raw).unwrap();
        // Role chunk then content chunk.
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], StreamItem::Chunk(c) if c.first_content() == Some("hey")));
        assert!(matches!(&items[1], StreamItem::Chunk(c) if c.finish_reason() == Some("stop")));
    }

    #[test]
    fn done_sentinel_passes_through() {
        let mut adapter = StreamAdapter::new(ApiFormat::OpenAi, "gpt-4o");
        let items = adapter.adapt("[DONE]").unwrap();
        assert!(matches!(items[0], StreamItem::Done));
    }
}
