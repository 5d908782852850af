use clap::Parser;
use kproxy_common::ProxyConfigPatch;

/// Multi-tenant key-pooling LLM reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "kproxy", version, about)]
pub struct Cli {
    /// Listen address.
    #[arg(long, env = "KPROXY_HOST")]
    pub host: Option<String>,

    /// Listen port.
    #[arg(long, env = "KPROXY_PORT")]
    pub port: Option<u16>,

    /// Comma-separated OpenAI API keys.
    #[arg(long, env = "OPENAI_KEY", hide_env_values = true)]
    pub openai_keys: Option<String>,

    /// Comma-separated Anthropic API keys.
    #[arg(long, env = "ANTHROPIC_KEY", hide_env_values = true)]
    pub anthropic_keys: Option<String>,

    /// Comma-separated AWS credentials (accessKeyId:secretAccessKey:region).
    #[arg(long, env = "AWS_CREDENTIALS", hide_env_values = true)]
    pub aws_credentials: Option<String>,

    /// Comma-separated GCP credentials
    /// (projectId:clientEmail:region:base64PrivateKey).
    #[arg(long, env = "GCP_CREDENTIALS", hide_env_values = true)]
    pub gcp_credentials: Option<String>,

    /// Comma-separated Azure credentials (resourceName:deploymentId:apiKey).
    #[arg(long, env = "AZURE_CREDENTIALS", hide_env_values = true)]
    pub azure_credentials: Option<String>,

    /// Comma-separated Google AI API keys.
    #[arg(long, env = "GOOGLE_AI_KEY", hide_env_values = true)]
    pub google_ai_keys: Option<String>,

    /// Comma-separated Mistral API keys.
    #[arg(long, env = "MISTRAL_AI_KEY", hide_env_values = true)]
    pub mistral_keys: Option<String>,

    /// Origin/Referer substrings to reject.
    #[arg(long, env = "BLOCKED_ORIGINS", value_delimiter = ',')]
    pub blocked_origins: Vec<String>,

    /// Prompt substrings that trip the content filter.
    #[arg(long, env = "BLOCKED_PHRASES", value_delimiter = ',')]
    pub blocked_phrases: Vec<String>,

    /// Reject prompts whose prompt+output budget exceeds this many tokens.
    #[arg(long, env = "MAX_CONTEXT_TOKENS")]
    pub max_context_tokens: Option<u32>,

    /// Reject requests asking for more output tokens than this.
    #[arg(long, env = "MAX_OUTPUT_TOKENS")]
    pub max_output_tokens: Option<u32>,

    /// Allow image prompts.
    #[arg(long, env = "ALLOW_VISION")]
    pub allow_vision: Option<bool>,

    /// Allow Bedrock keys whose invocation logging is enabled.
    #[arg(long, env = "ALLOW_AWS_LOGGING")]
    pub allow_aws_logging: Option<bool>,

    /// Run background key checkers.
    #[arg(long, env = "CHECK_KEYS")]
    pub check_keys: Option<bool>,

    /// Outbound proxy URL for upstream egress.
    #[arg(long, env = "OUTBOUND_PROXY")]
    pub proxy: Option<String>,
}

impl Cli {
    pub fn into_patch(self) -> ProxyConfigPatch {
        ProxyConfigPatch {
            host: self.host,
            port: self.port,
            openai_keys: self.openai_keys,
            anthropic_keys: self.anthropic_keys,
            aws_credentials: self.aws_credentials,
            gcp_credentials: self.gcp_credentials,
            azure_credentials: self.azure_credentials,
            google_ai_keys: self.google_ai_keys,
            mistral_keys: self.mistral_keys,
            blocked_origins: (!self.blocked_origins.is_empty()).then_some(self.blocked_origins),
            blocked_phrases: (!self.blocked_phrases.is_empty()).then_some(self.blocked_phrases),
            max_context_tokens: self.max_context_tokens,
            max_output_tokens: self.max_output_tokens,
            allow_vision: self.allow_vision,
            allow_aws_logging: self.allow_aws_logging,
            check_keys: self.check_keys,
            proxy: self.proxy,
        }
    }
}
