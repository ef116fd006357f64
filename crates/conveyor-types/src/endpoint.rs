use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use url::Url;

/// One immutable snapshot of where requests go and what headers ride along.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub base: Url,
    pub headers: BTreeMap<String, String>,
}

/// Shared endpoint/header state, read by many tasks and replaced (never
/// mutated in place) by the connection manager.
///
/// Registration and ping responses may override either field at runtime.
/// A non-empty endpoint replaces the previous one; a supplied header map
/// replaces the previous map wholesale (an empty map clears it).
#[derive(Debug)]
pub struct EndpointState {
    current: ArcSwap<Endpoint>,
}

impl EndpointState {
    pub fn new(base: Url) -> Self {
        Self {
            current: ArcSwap::from_pointee(Endpoint {
                base,
                headers: BTreeMap::new(),
            }),
        }
    }

    /// The snapshot requests should use right now.
    pub fn snapshot(&self) -> Arc<Endpoint> {
        self.current.load_full()
    }

    /// Install overrides and return the snapshot that was replaced, so a
    /// failed connectivity check can [`restore`](Self::restore) it.
    pub fn apply(
        &self,
        endpoint: Option<Url>,
        headers: Option<BTreeMap<String, String>>,
    ) -> Arc<Endpoint> {
        let prior = self.current.load_full();
        let next = Endpoint {
            base: endpoint.unwrap_or_else(|| prior.base.clone()),
            headers: headers.unwrap_or_else(|| prior.headers.clone()),
        };
        self.current.store(Arc::new(next));
        prior
    }

    /// Revert to a previously returned snapshot.
    pub fn restore(&self, prior: Arc<Endpoint>) {
        self.current.store(prior);
    }
}

/// Header names the environment may not inject.
const RESERVED_HEADERS: &[&str] = &[
    "AUTHORIZATION",
    "CONTENT-ENCODING",
    "CONTENT-LENGTH",
    "CONTENT-TYPE",
    "HOST",
    "USER-AGENT",
];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderNameError {
    #[error("request header name is empty")]
    Empty,
    #[error("request header name {0:?} is reserved")]
    Reserved(String),
    #[error("request header name {0:?} contains invalid characters")]
    Invalid(String),
}

/// Translate a `BUILDKITE_REQUEST_HEADER_*` suffix into an HTTP header name.
///
/// Underscores become hyphens. Reserved names (`CONTENT_TYPE` and friends)
/// are rejected so the environment cannot clobber protocol headers.
pub fn header_name_from_env(suffix: &str) -> Result<String, HeaderNameError> {
    if suffix.is_empty() {
        return Err(HeaderNameError::Empty);
    }
    let name = suffix.replace('_', "-");
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(HeaderNameError::Invalid(name));
    }
    if RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(&name))
    {
        return Err(HeaderNameError::Reserved(name));
    }
    Ok(name)
}
