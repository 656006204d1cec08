//! ACL module tests

use super::*;
use crate::config::{AclConfig, AclPermissions, AclRole, AuthConfig, UserConfig};
use std::sync::Arc;

fn user(username: &str, role: &str) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: Some(format!("{}_pass", username)),
        password_hash: None,
        role: Some(role.to_string()),
    }
}

fn make_test_auth_provider() -> Arc<AuthProvider> {
    let auth_config = AuthConfig {
        enabled: true,
        allow_anonymous: false,
        users: vec![
            user("admin", "admin"),
            user("sensor", "device"),
            user("readonly", "reader"),
        ],
    };
    Arc::new(AuthProvider::new(&auth_config))
}

fn make_test_acl_config() -> AclConfig {
    AclConfig {
        enabled: true,
        roles: vec![
            AclRole {
                name: "admin".to_string(),
                publish: vec!["#".to_string()],
                subscribe: vec!["#".to_string()],
            },
            AclRole {
                name: "device".to_string(),
                publish: vec!["sensors/%c/#".to_string()],
                subscribe: vec!["commands/%c/#".to_string()],
            },
            AclRole {
                name: "reader".to_string(),
                publish: vec![],
                subscribe: vec!["sensors/#".to_string()],
            },
        ],
        default: AclPermissions {
            publish: vec![],
            subscribe: vec!["public/+".to_string()],
        },
    }
}

fn provider() -> AclProvider {
    AclProvider::new(&make_test_acl_config(), make_test_auth_provider())
}

#[test]
fn test_acl_disabled_allows_all() {
    let acl_config = AclConfig {
        enabled: false,
        roles: vec![],
        default: AclPermissions::default(),
    };
    let provider = AclProvider::new(&acl_config, make_test_auth_provider());
    assert!(!provider.is_enabled());
    assert!(provider.authorize("c1", Some("anyone"), None, "any/topic", false, b"x"));
}

#[test]
fn test_admin_can_publish_anywhere() {
    assert!(provider().authorize("admin_client", Some("admin"), None, "any/topic/here", false, b""));
}

#[test]
fn test_device_publishes_only_to_own_topic() {
    let provider = provider();
    assert!(provider.check("sensor_client", Some("sensor"), "sensors/sensor_client/temperature", false));
    assert!(!provider.check("sensor_client", Some("sensor"), "sensors/other_client/temperature", false));
}

#[test]
fn test_reader_subscribe_rules() {
    let provider = provider();
    assert!(!provider.check("reader_client", Some("readonly"), "sensors/temp", false));
    assert!(provider.check("reader_client", Some("readonly"), "sensors/+/temp", true));
    assert!(!provider.check("reader_client", Some("readonly"), "commands/device1", true));
}

#[test]
fn test_shared_subscription_checked_on_inner_filter() {
    let provider = provider();
    assert!(provider.check("reader_client", Some("readonly"), "$share/workers/sensors/#", true));
    assert!(!provider.check("reader_client", Some("readonly"), "$share/workers/commands/#", true));
}

#[test]
fn test_default_permissions_for_anonymous() {
    let provider = provider();
    assert!(provider.check("anon", None, "public/news", true));
    assert!(!provider.check("anon", None, "public/news/today", true));
    assert!(!provider.check("anon", None, "public/news", false));
}

#[test]
fn test_role_user_falls_back_to_default() {
    assert!(provider().check("reader_client", Some("readonly"), "public/news", true));
}
