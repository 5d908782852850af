//! Credential pooling: per-provider key registries with health, capability,
//! rate-limit and usage state, background checkers, and the service-agnostic
//! pool router.
//!
//! Pool state is mutated only through [`KeyProvider`] methods; callers always
//! receive copies. Provider-specific crypto (AWS SigV4, GCP service-account
//! OAuth) lives here next to the key material it consumes.

pub mod checker;
pub mod clock;
pub mod events;
pub mod gcp_oauth;
pub mod key;
pub mod pool;
pub mod prioritizer;
pub mod probes;
pub mod provider;
pub mod sigv4;

pub use checker::{KeyChecker, ProbeClient, ProbeError, ProbeOutcome, ProbeRequest, ProbeResponse};
pub use events::{Event, EventHub, EventSink, TracingSink};
pub use key::{AwsLoggingStatus, Key, KeyExtra, KeyPatch};
pub use pool::KeyPool;
pub use prioritizer::prioritize;
pub use provider::{KeyProvider, ProviderTuning};
