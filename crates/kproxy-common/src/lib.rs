//! Shared vocabulary for kproxy.
//!
//! This crate intentionally depends on nothing heavier than `serde` and
//! `thiserror`: every other crate in the workspace speaks these types.

pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod user;

pub use config::{ProxyConfig, ProxyConfigError, ProxyConfigPatch};
pub use error::{ErrorKind, ProxyError};
pub use identity::QueueIdentity;
pub use model::{
    ApiFormat, ModelFamily, Service, model_family, service_for_family, service_for_model,
};
pub use error::redact_hostnames;
pub use user::{OpenResolver, ResolvedUser, UserResolver};
