use serde::{Deserialize, Serialize};

/// Upstream provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    OpenAi,
    Anthropic,
    Aws,
    Gcp,
    Azure,
    GoogleAi,
    Mistral,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::OpenAi => "openai",
            Service::Anthropic => "anthropic",
            Service::Aws => "aws",
            Service::Gcp => "gcp",
            Service::Azure => "azure",
            Service::GoogleAi => "google-ai",
            Service::Mistral => "mistral",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(Service::OpenAi),
            "anthropic" => Some(Service::Anthropic),
            "aws" => Some(Service::Aws),
            "gcp" => Some(Service::Gcp),
            "azure" => Some(Service::Azure),
            "google-ai" => Some(Service::GoogleAi),
            "mistral" => Some(Service::Mistral),
            _ => None,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse model class used for rate-limit partitioning and quota accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Turbo,
    Gpt4,
    Gpt432k,
    Gpt4Turbo,
    Gpt4o,
    O1,
    DallE,
    Claude,
    ClaudeOpus,
    AwsClaude,
    AwsClaudeOpus,
    AwsMistralTiny,
    AwsMistralSmall,
    AwsMistralMedium,
    AwsMistralLarge,
    GcpClaude,
    GcpClaudeOpus,
    AzureTurbo,
    AzureGpt4,
    AzureGpt4o,
    AzureDallE,
    GeminiFlash,
    GeminiPro,
    GeminiUltra,
    MistralTiny,
    MistralSmall,
    MistralMedium,
    MistralLarge,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt432k => "gpt4-32k",
            ModelFamily::Gpt4Turbo => "gpt4-turbo",
            ModelFamily::Gpt4o => "gpt4o",
            ModelFamily::O1 => "o1",
            ModelFamily::DallE => "dall-e",
            ModelFamily::Claude => "claude",
            ModelFamily::ClaudeOpus => "claude-opus",
            ModelFamily::AwsClaude => "aws-claude",
            ModelFamily::AwsClaudeOpus => "aws-claude-opus",
            ModelFamily::AwsMistralTiny => "aws-mistral-tiny",
            ModelFamily::AwsMistralSmall => "aws-mistral-small",
            ModelFamily::AwsMistralMedium => "aws-mistral-medium",
            ModelFamily::AwsMistralLarge => "aws-mistral-large",
            ModelFamily::GcpClaude => "gcp-claude",
            ModelFamily::GcpClaudeOpus => "gcp-claude-opus",
            ModelFamily::AzureTurbo => "azure-turbo",
            ModelFamily::AzureGpt4 => "azure-gpt4",
            ModelFamily::AzureGpt4o => "azure-gpt4o",
            ModelFamily::AzureDallE => "azure-dall-e",
            ModelFamily::GeminiFlash => "gemini-flash",
            ModelFamily::GeminiPro => "gemini-pro",
            ModelFamily::GeminiUltra => "gemini-ultra",
            ModelFamily::MistralTiny => "mistral-tiny",
            ModelFamily::MistralSmall => "mistral-small",
            ModelFamily::MistralMedium => "mistral-medium",
            ModelFamily::MistralLarge => "mistral-large",
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API schema spoken at either end of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiFormat {
    /// OpenAI `/v1/chat/completions`.
    OpenAi,
    /// OpenAI legacy `/v1/completions`.
    OpenAiText,
    /// OpenAI `/v1/images/generations`.
    OpenAiImage,
    /// Anthropic `/v1/messages`.
    AnthropicChat,
    /// Anthropic legacy `/v1/complete`.
    AnthropicText,
    /// Google AI `:generateContent` / `:streamGenerateContent`.
    GoogleAi,
    /// Mistral `/v1/chat/completions`.
    Mistral,
    /// Mistral raw-prompt completion (used for Bedrock Mistral).
    MistralText,
}

/// Map a model string to its family, given the service the route targets.
///
/// The service hint is required because the same Claude snapshot name is valid
/// on Anthropic, Bedrock, and Vertex; only the route knows which pool to hit.
pub fn model_family(service: Service, model: &str) -> Option<ModelFamily> {
    match service {
        Service::OpenAi => openai_family(model),
        Service::Anthropic => {
            if is_claude_opus(model) {
                Some(ModelFamily::ClaudeOpus)
            } else if model.starts_with("claude-") {
                Some(ModelFamily::Claude)
            } else {
                None
            }
        }
        Service::Aws => aws_family(model),
        Service::Gcp => {
            let bare = model.split('@').next().unwrap_or(model);
            if is_claude_opus(bare) {
                Some(ModelFamily::GcpClaudeOpus)
            } else if bare.starts_with("claude-") {
                Some(ModelFamily::GcpClaude)
            } else {
                None
            }
        }
        Service::Azure => match openai_family(model)? {
            ModelFamily::Turbo => Some(ModelFamily::AzureTurbo),
            ModelFamily::Gpt4 | ModelFamily::Gpt432k | ModelFamily::Gpt4Turbo => {
                Some(ModelFamily::AzureGpt4)
            }
            ModelFamily::Gpt4o => Some(ModelFamily::AzureGpt4o),
            ModelFamily::DallE => Some(ModelFamily::AzureDallE),
            _ => None,
        },
        Service::GoogleAi => gemini_family(model),
        Service::Mistral => mistral_family(model),
    }
}

fn openai_family(model: &str) -> Option<ModelFamily> {
    if model.starts_with("gpt-4o") || model.starts_with("chatgpt-4o") {
        Some(ModelFamily::Gpt4o)
    } else if model.starts_with("gpt-4-32k") {
        Some(ModelFamily::Gpt432k)
    } else if model.starts_with("gpt-4-turbo")
        || model.starts_with("gpt-4-1106")
        || model.starts_with("gpt-4-0125")
    {
        Some(ModelFamily::Gpt4Turbo)
    } else if model.starts_with("gpt-4") {
        Some(ModelFamily::Gpt4)
    } else if model.starts_with("gpt-3.5")
        // Azure deployments drop the dot.
        || model.starts_with("gpt-35")
        || model.starts_with("text-davinci")
    {
        Some(ModelFamily::Turbo)
    } else if model.starts_with("o1") {
        Some(ModelFamily::O1)
    } else if model.starts_with("dall-e") {
        Some(ModelFamily::DallE)
    } else {
        None
    }
}

fn aws_family(model: &str) -> Option<ModelFamily> {
    // Inference profile ids carry a region prefix ("us.", "eu.", ...).
    let model = model
        .split_once('.')
        .filter(|(prefix, _)| prefix.len() == 2)
        .map(|(_, rest)| rest)
        .unwrap_or(model);
    if let Some(rest) = model.strip_prefix("anthropic.") {
        if is_claude_opus(rest) {
            Some(ModelFamily::AwsClaudeOpus)
        } else if rest.starts_with("claude") {
            Some(ModelFamily::AwsClaude)
        } else {
            None
        }
    } else if let Some(rest) = model.strip_prefix("mistral.") {
        if rest.starts_with("mistral-7b") {
            Some(ModelFamily::AwsMistralTiny)
        } else if rest.starts_with("mixtral-8x7b") || rest.starts_with("mistral-small") {
            Some(ModelFamily::AwsMistralSmall)
        } else if rest.starts_with("mistral-medium") {
            Some(ModelFamily::AwsMistralMedium)
        } else if rest.starts_with("mistral-large") {
            Some(ModelFamily::AwsMistralLarge)
        } else {
            None
        }
    } else {
        None
    }
}

fn gemini_family(model: &str) -> Option<ModelFamily> {
    let model = model.strip_prefix("models/").unwrap_or(model);
    if !model.starts_with("gemini") {
        return None;
    }
    if model.contains("flash") {
        Some(ModelFamily::GeminiFlash)
    } else if model.contains("ultra") {
        Some(ModelFamily::GeminiUltra)
    } else {
        Some(ModelFamily::GeminiPro)
    }
}

fn mistral_family(model: &str) -> Option<ModelFamily> {
    if model.starts_with("mistral-tiny") || model.starts_with("open-mistral-7b") {
        Some(ModelFamily::MistralTiny)
    } else if model.starts_with("mistral-small") || model.starts_with("open-mixtral-8x7b") {
        Some(ModelFamily::MistralSmall)
    } else if model.starts_with("mistral-medium") || model.starts_with("open-mixtral-8x22b") {
        Some(ModelFamily::MistralMedium)
    } else if model.starts_with("mistral-large") {
        Some(ModelFamily::MistralLarge)
    } else {
        None
    }
}

fn is_claude_opus(model: &str) -> bool {
    model.starts_with("claude-3-opus") || model.starts_with("claude-opus")
}

/// Deterministic model-pattern table used when no route hint is available.
pub fn service_for_model(model: &str) -> Option<Service> {
    if aws_family(model).is_some() {
        Some(Service::Aws)
    } else if model.contains('@') {
        Some(Service::Gcp)
    } else if gemini_family(model).is_some() {
        Some(Service::GoogleAi)
    } else if openai_family(model).is_some() {
        Some(Service::OpenAi)
    } else if model.starts_with("claude-") {
        Some(Service::Anthropic)
    } else if mistral_family(model).is_some() {
        Some(Service::Mistral)
    } else {
        None
    }
}

pub fn service_for_family(family: ModelFamily) -> Service {
    match family {
        ModelFamily::Turbo
        | ModelFamily::Gpt4
        | ModelFamily::Gpt432k
        | ModelFamily::Gpt4Turbo
        | ModelFamily::Gpt4o
        | ModelFamily::O1
        | ModelFamily::DallE => Service::OpenAi,
        ModelFamily::Claude | ModelFamily::ClaudeOpus => Service::Anthropic,
        ModelFamily::AwsClaude
        | ModelFamily::AwsClaudeOpus
        | ModelFamily::AwsMistralTiny
        | ModelFamily::AwsMistralSmall
        | ModelFamily::AwsMistralMedium
        | ModelFamily::AwsMistralLarge => Service::Aws,
        ModelFamily::GcpClaude | ModelFamily::GcpClaudeOpus => Service::Gcp,
        ModelFamily::AzureTurbo
        | ModelFamily::AzureGpt4
        | ModelFamily::AzureGpt4o
        | ModelFamily::AzureDallE => Service::Azure,
        ModelFamily::GeminiFlash | ModelFamily::GeminiPro | ModelFamily::GeminiUltra => {
            Service::GoogleAi
        }
        ModelFamily::MistralTiny
        | ModelFamily::MistralSmall
        | ModelFamily::MistralMedium
        | ModelFamily::MistralLarge => Service::Mistral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_snapshot_models_map() {
        assert_eq!(
            model_family(Service::OpenAi, "gpt-4o-2024-05-13"),
            Some(ModelFamily::Gpt4o)
        );
        assert_eq!(
            model_family(Service::OpenAi, "gpt-4-32k-0613"),
            Some(ModelFamily::Gpt432k)
        );
        assert_eq!(
            model_family(Service::OpenAi, "gpt-3.5-turbo-0125"),
            Some(ModelFamily::Turbo)
        );
        assert_eq!(model_family(Service::OpenAi, "claude-3-opus"), None);
    }

    #[test]
    fn claude_snapshot_depends_on_service() {
        let model = "claude-3-5-sonnet-20240620";
        assert_eq!(
            model_family(Service::Anthropic, model),
            Some(ModelFamily::Claude)
        );
        assert_eq!(
            model_family(Service::Gcp, "claude-3-5-sonnet@20240620"),
            Some(ModelFamily::GcpClaude)
        );
        assert_eq!(
            model_family(Service::Aws, "anthropic.claude-3-5-sonnet-20240620-v1:0"),
            Some(ModelFamily::AwsClaude)
        );
    }

    #[test]
    fn aws_inference_profile_prefix_is_stripped() {
        assert_eq!(
            model_family(Service::Aws, "us.anthropic.claude-3-5-sonnet-20240620-v1:0"),
            Some(ModelFamily::AwsClaude)
        );
        assert_eq!(
            model_family(Service::Aws, "anthropic.claude-3-opus-20240229-v1:0"),
            Some(ModelFamily::AwsClaudeOpus)
        );
    }

    #[test]
    fn pattern_table_resolves_service() {
        assert_eq!(
            service_for_model("anthropic.claude-3-5-sonnet-20240620-v1:0"),
            Some(Service::Aws)
        );
        assert_eq!(
            service_for_model("claude-3-5-sonnet@20240620"),
            Some(Service::Gcp)
        );
        assert_eq!(service_for_model("gemini-1.5-flash"), Some(Service::GoogleAi));
        assert_eq!(service_for_model("gpt-4o-2024-05-13"), Some(Service::OpenAi));
        assert_eq!(service_for_model("mistral-large-2402"), Some(Service::Mistral));
        assert_eq!(service_for_model("llama-3-70b"), None);
    }

    #[test]
    fn family_round_trips_to_service() {
        for family in [
            ModelFamily::Gpt4o,
            ModelFamily::ClaudeOpus,
            ModelFamily::AwsClaude,
            ModelFamily::GcpClaude,
            ModelFamily::AzureGpt4o,
            ModelFamily::GeminiFlash,
            ModelFamily::MistralLarge,
        ] {
            let service = service_for_family(family);
            assert!(matches!(
                service,
                Service::OpenAi
                    | Service::Anthropic
                    | Service::Aws
                    | Service::Gcp
                    | Service::Azure
                    | Service::GoogleAi
                    | Service::Mistral
            ));
        }
    }
}
