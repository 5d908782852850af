//! Provider probe strategies used by the background checker.
//!
//! Mistral keys are never probed (configured families are trusted) and Azure
//! deployments are validated lazily by their first live request, so neither
//! registers a probe here.

mod anthropic;
mod aws;
mod gcp;
mod googleai;
mod openai;

use std::sync::Arc;

use kproxy_common::Service;

use crate::checker::ProviderProbe;

pub use anthropic::AnthropicProbe;
pub use aws::AwsProbe;
pub use gcp::GcpProbe;
pub use googleai::GoogleAiProbe;
pub use openai::OpenAiProbe;

pub fn probe_for(service: Service) -> Option<Arc<dyn ProviderProbe>> {
    match service {
        Service::OpenAi => Some(Arc::new(OpenAiProbe)),
        Service::Anthropic => Some(Arc::new(AnthropicProbe)),
        Service::Aws => Some(Arc::new(AwsProbe)),
        Service::Gcp => Some(Arc::new(GcpProbe)),
        Service::GoogleAi => Some(Arc::new(GoogleAiProbe)),
        Service::Azure | Service::Mistral => None,
    }
}
