//! Request identity types.
//!
//! [`RequestId`] correlates a request across log lines and error envelopes;
//! [`CallerIdentity`] records who made it once an authentication stage has
//! run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for each request, using UUID v7.
///
/// UUID v7 is time-ordered, which keeps log lines for a burst of requests
/// sorted by arrival.
///
/// # Example
///
/// ```
/// use keel_core::RequestId;
///
/// let id = RequestId::new();
/// println!("Request ID: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new unique request ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `RequestId` from an existing UUID, e.g. one parsed from an
    /// inbound `x-request-id` header.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallerIdentity {
    /// No credentials were presented, or none were checked.
    #[default]
    Anonymous,
    /// An end user.
    User {
        /// Stable user identifier.
        user_id: String,
        /// Roles granted to the user.
        #[serde(default)]
        roles: Vec<String>,
    },
    /// A machine client holding an API key.
    ApiKey {
        /// Key identifier (never the secret itself).
        key_id: String,
    },
}

impl CallerIdentity {
    /// Creates a user identity without roles.
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
            roles: Vec::new(),
        }
    }

    /// Creates an API key identity.
    #[must_use]
    pub fn api_key(key_id: impl Into<String>) -> Self {
        Self::ApiKey {
            key_id: key_id.into(),
        }
    }

    /// Returns `true` for [`CallerIdentity::Anonymous`].
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Returns a string identifier suitable for logging and rate-limit keys.
    ///
    /// Never contains secrets.
    #[must_use]
    pub fn log_id(&self) -> String {
        match self {
            Self::Anonymous => "anonymous".to_string(),
            Self::User { user_id, .. } => format!("user:{user_id}"),
            Self::ApiKey { key_id } => format!("apikey:{key_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_unique() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_request_id_display_is_uuid() {
        let id = RequestId::new();
        let display = id.to_string();
        assert_eq!(display.len(), 36);
        assert_eq!(Uuid::parse_str(&display).ok(), Some(*id.as_uuid()));
    }

    #[test]
    fn test_log_ids() {
        assert_eq!(CallerIdentity::Anonymous.log_id(), "anonymous");
        assert_eq!(CallerIdentity::user("u1").log_id(), "user:u1");
        assert_eq!(CallerIdentity::api_key("k9").log_id(), "apikey:k9");
    }

    #[test]
    fn test_identity_serialization() {
        let identity = CallerIdentity::User {
            user_id: "u123".into(),
            roles: vec!["admin".into()],
        };
        let json = serde_json::to_string(&identity).expect("serialization should work");
        assert!(json.contains("\"type\":\"user\""));

        let parsed: CallerIdentity =
            serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed, identity);
    }
}
