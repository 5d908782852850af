use serde_json::Value;

use crate::request::{ProxyRequest, SignedRequest};

/// One reversible mutation, recorded with the value it replaced.
#[derive(Debug)]
enum Mutation {
    SetHeader { name: String, prior: Option<String> },
    RemoveHeader { name: String, prior: Option<String> },
    ReplaceBody { prior: Value },
    SetPath { prior: String },
    /// Key assignment is not reverted; the key is opaque to the client and a
    /// retry is free to keep or replace it.
    AssignKey,
    SetSignedRequest { prior: Option<SignedRequest> },
}

/// Wraps the in-flight request for the mutation phase. Mutators only ever
/// receive this manager, never the raw request, so every recorded change can
/// be unwound before a retry and the next attempt starts from the same
/// transformed-but-unauthenticated state.
#[derive(Debug)]
pub struct RequestManager {
    request: ProxyRequest,
    log: Vec<Mutation>,
}

impl RequestManager {
    pub fn new(request: ProxyRequest) -> Self {
        Self {
            request,
            log: Vec::new(),
        }
    }

    pub fn request(&self) -> &ProxyRequest {
        &self.request
    }

    /// Scheduling state (timestamps, retry counter) lives outside the
    /// mutation log and is adjusted directly by the engine.
    pub fn scheduling_mut(&mut self) -> &mut ProxyRequest {
        &mut self.request
    }

    pub fn into_request(self) -> ProxyRequest {
        self.request
    }

    pub fn mutation_count(&self) -> usize {
        self.log.len()
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let prior = header_replace(&mut self.request.headers, &name, Some(value));
        self.log.push(Mutation::SetHeader { name, prior });
    }

    pub fn remove_header(&mut self, name: &str) {
        let prior = header_replace(&mut self.request.headers, name, None);
        if prior.is_some() {
            self.log.push(Mutation::RemoveHeader {
                name: name.to_string(),
                prior,
            });
        }
    }

    pub fn replace_body(&mut self, body: Value) {
        let prior = std::mem::replace(&mut self.request.body, body);
        self.log.push(Mutation::ReplaceBody { prior });
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        let prior = std::mem::replace(&mut self.request.path, path.into());
        self.log.push(Mutation::SetPath { prior });
    }

    pub fn assign_key(&mut self, key: kproxy_keys::Key) {
        self.request.key = Some(key);
        self.log.push(Mutation::AssignKey);
    }

    pub fn set_signed_request(&mut self, signed: SignedRequest) {
        let prior = self.request.signed_request.replace(signed);
        self.log.push(Mutation::SetSignedRequest { prior });
    }

    /// Unwind every recorded mutation in reverse order. After this the
    /// observable request state (headers, body, path, signed request) equals
    /// the state before the first mutation; only the key assignment remains.
    pub fn revert(&mut self) {
        while let Some(mutation) = self.log.pop() {
            match mutation {
                Mutation::SetHeader { name, prior } | Mutation::RemoveHeader { name, prior } => {
                    header_replace(&mut self.request.headers, &name, prior);
                }
                Mutation::ReplaceBody { prior } => {
                    self.request.body = prior;
                }
                Mutation::SetPath { prior } => {
                    self.request.path = prior;
                }
                Mutation::AssignKey => {}
                Mutation::SetSignedRequest { prior } => {
                    self.request.signed_request = prior;
                }
            }
        }
    }
}

/// Set, replace or remove a header; returns the prior value.
fn header_replace(
    headers: &mut Vec<(String, String)>,
    name: &str,
    value: Option<String>,
) -> Option<String> {
    let position = headers
        .iter()
        .position(|(key, _)| key.eq_ignore_ascii_case(name));
    match (position, value) {
        (Some(at), Some(value)) => Some(std::mem::replace(&mut headers[at].1, value)),
        (Some(at), None) => Some(headers.remove(at).1),
        (None, Some(value)) => {
            headers.push((name.to_string(), value));
            None
        }
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kproxy_common::{ApiFormat, QueueIdentity, Service};

    fn manager() -> RequestManager {
        let request = ProxyRequest::new(
            QueueIdentity::Ip("127.0.0.1".to_string()),
            None,
            "127.0.0.1".to_string(),
            ApiFormat::OpenAi,
            ApiFormat::AnthropicChat,
            Service::Anthropic,
            vec![("origin".to_string(), "https://example.test".to_string())],
            serde_json::json!({"model": "claude-3-5-sonnet-20240620"}),
        );
        RequestManager::new(request)
    }

    #[test]
    fn revert_restores_pre_mutation_state() {
        let mut mgr = manager();
        let headers_before = mgr.request().headers.clone();
        let body_before = mgr.request().body.clone();
        let path_before = mgr.request().path.clone();

        mgr.remove_header("origin");
        mgr.set_header("x-api-key", "sk-secret");
        mgr.set_header("x-api-key", "sk-other");
        mgr.replace_body(serde_json::json!({"rewritten": true}));
        mgr.set_path("/v1/messages");
        mgr.set_signed_request(SignedRequest {
            method: "POST",
            hostname: "h".to_string(),
            path: "/p".to_string(),
            headers: Vec::new(),
            body: bytes::Bytes::new(),
        });
        assert!(mgr.mutation_count() >= 5);

        mgr.revert();
        assert_eq!(mgr.request().headers, headers_before);
        assert_eq!(mgr.request().body, body_before);
        assert_eq!(mgr.request().path, path_before);
        assert!(mgr.request().signed_request.is_none());
        assert_eq!(mgr.mutation_count(), 0);
    }

    #[test]
    fn key_assignment_survives_revert() {
        let mut mgr = manager();
        let key = kproxy_keys::Key::parse(Service::Anthropic, "sk-ant-x").unwrap();
        mgr.assign_key(key.clone());
        mgr.revert();
        assert_eq!(
            mgr.request().key.as_ref().map(|k| k.hash.as_str()),
            Some(key.hash.as_str())
        );
    }

    #[test]
    fn double_revert_is_harmless() {
        let mut mgr = manager();
        mgr.set_header("authorization", "Bearer x");
        mgr.revert();
        mgr.revert();
        assert_eq!(mgr.mutation_count(), 0);
        assert!(
            !mgr.request()
                .headers
                .iter()
                .any(|(name, _)| name == "authorization")
        );
    }
}
