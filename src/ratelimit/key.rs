//! Rate-limit key derivation.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between a key's namespace and its components.
const SEPARATOR: char = ':';

/// Errors raised when a request lacks the inputs a strategy needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("client address unavailable")]
    MissingClientAddress,
    #[error("authenticated subject unavailable")]
    MissingSubject,
    #[error("resource parameter `{0}` unavailable")]
    MissingResource(String),
}

/// How a limiter identifies the caller it throttles.
///
/// In YAML the parameterised strategy is written as a single-key map
/// (`subject_and_resource: {param: persona_id}`); fields holding a strategy
/// use `serde_yaml::with::singleton_map`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// By client network address, for anonymous endpoints
    ClientAddress,
    /// By authenticated subject id
    Subject,
    /// By subject and a resource taken from the named path parameter
    SubjectAndResource { param: String },
}

impl KeyStrategy {
    /// The path parameter this strategy reads, if any.
    pub fn resource_param(&self) -> Option<&str> {
        match self {
            KeyStrategy::SubjectAndResource { param } => Some(param),
            _ => None,
        }
    }
}

/// Request facts available for key derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyInputs {
    pub client_addr: Option<IpAddr>,
    pub subject: Option<String>,
    pub resource: Option<String>,
}

/// A key that uniquely identifies the throttled entity within a limiter.
///
/// Rendered as `<limiter>:<component>[:<component>]`. Components are escaped
/// so that no two distinct subjects share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Derive the key for `inputs` under the `limiter` namespace.
    pub fn derive(
        limiter: &str,
        strategy: &KeyStrategy,
        inputs: &KeyInputs,
    ) -> Result<Self, KeyError> {
        let subject = || inputs.subject.as_deref().ok_or(KeyError::MissingSubject);

        let components = match strategy {
            KeyStrategy::ClientAddress => {
                let addr = inputs.client_addr.ok_or(KeyError::MissingClientAddress)?;
                vec![addr.to_string()]
            }
            KeyStrategy::Subject => vec![subject()?.to_string()],
            KeyStrategy::SubjectAndResource { param } => {
                let resource = inputs
                    .resource
                    .as_deref()
                    .ok_or_else(|| KeyError::MissingResource(param.clone()))?;
                vec![subject()?.to_string(), resource.to_string()]
            }
        };

        Ok(Self::from_parts(limiter, &components))
    }

    fn from_parts(limiter: &str, components: &[String]) -> Self {
        let mut key = String::from(limiter);
        for component in components {
            key.push(SEPARATOR);
            key.push_str(&escape_component(component));
        }
        Self(key)
    }

    /// The namespace prefix shared by every key of `limiter`.
    pub fn namespace(limiter: &str) -> String {
        format!("{}{}", limiter, SEPARATOR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_component(raw: &str) -> String {
    raw.replace('%', "%25").replace(SEPARATOR, "%3A")
}
