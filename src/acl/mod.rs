//! ACL (Access Control List) Module
//!
//! Role-based publish/subscribe permissions. Patterns use MQTT wildcards and
//! may embed `%c` (client id) or `%u` (username) inside a level. Patterns are
//! compiled once when the provider is built; placeholders are resolved per
//! check and only ever match a single level.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::auth::AuthProvider;
use crate::config::{AclConfig, AclPermissions};
use crate::hooks::Hooks;
use crate::topic::parse_filter;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Exact(String),
    /// Level text with `%c` / `%u` placeholders
    Template(String),
    Plus,
    Hash,
}

/// A compiled ACL topic pattern
#[derive(Debug, Clone)]
struct Pattern {
    levels: Vec<Level>,
}

impl Pattern {
    fn compile(raw: &str) -> Self {
        let levels = raw
            .split('/')
            .map(|level| match level {
                "+" => Level::Plus,
                "#" => Level::Hash,
                l if l.contains("%c") || l.contains("%u") => Level::Template(l.to_string()),
                l => Level::Exact(l.to_string()),
            })
            .collect();
        Self { levels }
    }

    /// Whether `topic` is covered. `topic` may itself be a filter (for
    /// SUBSCRIBE); a wildcard in it only passes where the pattern is at
    /// least as broad.
    fn allows(&self, topic: &str, client_id: &str, username: Option<&str>) -> bool {
        let mut parts = topic.split('/');
        for level in &self.levels {
            let part = parts.next();
            match (level, part) {
                (Level::Hash, _) => return true,
                (Level::Plus, Some(p)) if p != "#" => {}
                (Level::Exact(e), Some(p)) if e == p => {}
                (Level::Template(t), Some(p)) => match expand(t, client_id, username) {
                    Some(expanded) if expanded == p => {}
                    _ => return false,
                },
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

/// Fill in `%c` / `%u`. A pattern naming `%u` never matches an anonymous
/// client, and a value that would spill into other levels or act as a
/// wildcard never matches.
fn expand(template: &str, client_id: &str, username: Option<&str>) -> Option<String> {
    let mut out = template.replace("%c", client_id);
    if out.contains("%u") {
        out = out.replace("%u", username?);
    }
    if out.contains(['/', '+', '#']) {
        return None;
    }
    Some(out)
}

#[derive(Debug, Default)]
struct Grants {
    publish: Vec<Pattern>,
    subscribe: Vec<Pattern>,
}

impl Grants {
    fn compile(publish: &[String], subscribe: &[String]) -> Self {
        Self {
            publish: publish.iter().map(|p| Pattern::compile(p)).collect(),
            subscribe: subscribe.iter().map(|p| Pattern::compile(p)).collect(),
        }
    }

    fn allows(
        &self,
        topic: &str,
        is_subscription: bool,
        client_id: &str,
        username: Option<&str>,
    ) -> bool {
        let patterns = if is_subscription {
            &self.subscribe
        } else {
            &self.publish
        };
        patterns.iter().any(|p| p.allows(topic, client_id, username))
    }
}

/// ACL provider
pub struct AclProvider {
    enabled: bool,
    roles: HashMap<String, Grants>,
    /// Applies to every client, with or without a role
    default: Grants,
    /// Username to role resolution
    auth_provider: Arc<AuthProvider>,
}

impl AclProvider {
    pub fn new(config: &AclConfig, auth_provider: Arc<AuthProvider>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    Grants::compile(&role.publish, &role.subscribe),
                )
            })
            .collect();
        let AclPermissions { publish, subscribe } = &config.default;

        Self {
            enabled: config.enabled,
            roles,
            default: Grants::compile(publish, subscribe),
            auth_provider,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn role(&self, username: Option<&str>) -> Option<&Grants> {
        let role_name = self.auth_provider.get_user_role(username?)?;
        self.roles.get(role_name)
    }

    /// Whether `client_id` may publish to `topic` (or subscribe to it as a
    /// filter when `is_subscription`)
    pub fn check(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        is_subscription: bool,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        // Shared subscriptions are checked on the filter they carry
        let topic = match is_subscription.then(|| parse_filter(topic, 0)) {
            Some(Ok(parsed)) if parsed.share_group.is_some() => parsed.filter,
            _ => topic,
        };

        let allowed = self
            .role(username)
            .is_some_and(|grants| grants.allows(topic, is_subscription, client_id, username))
            || self
                .default
                .allows(topic, is_subscription, client_id, username);
        if !allowed {
            trace!(client_id, topic, is_subscription, "ACL denied");
        }
        allowed
    }
}

impl Hooks for AclProvider {
    fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        _password: Option<&[u8]>,
        topic: &str,
        is_subscription: bool,
        _payload: &[u8],
    ) -> bool {
        self.check(client_id, username, topic, is_subscription)
    }
}

#[cfg(test)]
mod pattern_tests {
    use super::*;

    fn allows(pattern: &str, topic: &str) -> bool {
        Pattern::compile(pattern).allows(topic, "c1", Some("alice"))
    }

    #[test]
    fn exact_levels() {
        assert!(allows("foo/bar", "foo/bar"));
        assert!(!allows("foo/bar", "foo/baz"));
        assert!(!allows("foo/bar", "foo"));
        assert!(!allows("foo", "foo/bar"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(allows("foo/+/bar", "foo/xxx/bar"));
        assert!(allows("+/bar", "foo/bar"));
        assert!(allows("foo/+", "foo/+"));
        assert!(!allows("foo/+", "foo/bar/baz"));
        assert!(!allows("foo/+", "foo/#"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(allows("foo/#", "foo/bar"));
        assert!(allows("foo/#", "foo/bar/baz"));
        assert!(allows("foo/#", "foo/+/baz"));
        assert!(allows("#", "foo/bar/baz"));
        assert!(!allows("foo/bar", "foo/#"));
    }

    #[test]
    fn placeholders_expand_within_a_level() {
        assert!(allows("sensors/%c/#", "sensors/c1/temp"));
        assert!(allows("users/%u/data", "users/alice/data"));
        assert!(allows("home/dev-%c", "home/dev-c1"));
        assert!(!allows("users/%u/data", "users/bob/data"));
    }

    #[test]
    fn placeholder_never_spans_levels_or_wildcards() {
        let pattern = Pattern::compile("sensors/%c/#");
        assert!(!pattern.allows("sensors/a/b/x", "a/b", None));
        assert!(!pattern.allows("sensors/x", "+", None));
        assert!(!Pattern::compile("users/%u").allows("users/", "c1", None));
    }
}
