//! Authentication Module
//!
//! Username/password authentication against the static user list in the
//! configuration. Passwords are stored either in plaintext or as argon2
//! PHC hashes.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::Hooks;


/// Stored credential for one user
enum Credential {
    Plaintext(String),
    /// argon2 PHC string
    Hash(String),
}

struct UserEntry {
    credential: Credential,
    /// ACL role (if any)
    role: Option<String>,
}

/// Authentication provider
pub struct AuthProvider {
    enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, UserEntry>,
}

impl AuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();

        for user in &config.users {
            let credential = match (&user.password_hash, &user.password) {
                (Some(hash), _) => Credential::Hash(hash.clone()),
                (None, Some(password)) => Credential::Plaintext(password.clone()),
                (None, None) => {
                    warn!(username = %user.username, "user has no credential, skipped");
                    continue;
                }
            };
            users.insert(
                user.username.clone(),
                UserEntry {
                    credential,
                    role: user.role.clone(),
                },
            );
        }

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ACL role of a configured user
    pub fn get_user_role(&self, username: &str) -> Option<&str> {
        self.users.get(username).and_then(|u| u.role.as_deref())
    }

    fn verify_password(password: &[u8], credential: &Credential) -> bool {
        match credential {
            Credential::Plaintext(stored) => password == stored.as_bytes(),
            Credential::Hash(phc) => match PasswordHash::new(phc) {
                Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
                Err(e) => {
                    warn!("unparseable password hash: {}", e);
                    false
                }
            },
        }
    }
}

impl Hooks for AuthProvider {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(username) = username else {
            if !self.allow_anonymous {
                debug!(client_id, "anonymous connection refused");
            }
            return self.allow_anonymous;
        };

        let Some(user) = self.users.get(username) else {
            debug!(client_id, username, "unknown user");
            return false;
        };

        let ok = Self::verify_password(password.unwrap_or(&[]), &user.credential);
        if !ok {
            debug!(client_id, username, "bad password");
        }
        ok
    }
}
