//! Authenticated user identity.

use serde::{Deserialize, Serialize};

/// Identity recorded on a connection after successful authentication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable user identifier; the presence key.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Whether the user may call admin-gated functions.
    #[serde(default)]
    pub is_admin: bool,
}

impl Identity {
    /// Create a non-admin identity.
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            is_admin: false,
        }
    }

    /// Mark the identity as admin.
    #[must_use]
    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_camel_case() {
        let id = Identity::new("u1", "Ada").admin();
        let v = serde_json::to_value(&id).unwrap();
        assert_eq!(v, json!({"userId": "u1", "userName": "Ada", "isAdmin": true}));
    }

    #[test]
    fn is_admin_defaults_to_false() {
        let id: Identity = serde_json::from_value(json!({"userId": "u2", "userName": "Bob"})).unwrap();
        assert!(!id.is_admin);
    }
}
