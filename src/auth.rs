//! Allowlist authentication.
//!
//! The gateway authenticates end users; chatrun only checks membership
//! against the configured allowlist before accepting work.

use crate::settings::AuthConfig;

/// Config-backed user allowlist.
#[derive(Debug, Clone)]
pub struct Allowlist {
    allowed: Vec<String>,
    open: bool,
}

impl Allowlist {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            allowed: config.allowed_users.clone(),
            open: config.open,
        }
    }

    /// Check whether a user may enqueue runs.
    pub fn is_allowed(&self, user_id: &str) -> bool {
        self.open || self.allowed.iter().any(|u| u == user_id)
    }
}
