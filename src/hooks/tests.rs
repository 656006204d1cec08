//! Hooks module tests

use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

#[test]
fn test_default_hooks_allow_all() {
    let hooks = DefaultHooks;
    assert!(hooks.authenticate("client1", Some("user"), Some(b"pass")));
    assert!(hooks.authorize("client1", Some("user"), None, "test/topic", false, b"x"));
    assert!(hooks.authorize("client1", None, None, "test/#", true, b""));
}

struct AllowHooks;
struct DenyHooks;

impl Hooks for AllowHooks {}

impl Hooks for DenyHooks {
    fn authenticate(&self, _: &str, _: Option<&str>, _: Option<&[u8]>) -> bool {
        false
    }

    fn authorize(
        &self,
        _: &str,
        _: Option<&str>,
        _: Option<&[u8]>,
        topic: &str,
        _: bool,
        _: &[u8],
    ) -> bool {
        !topic.starts_with("secret/")
    }
}

#[derive(Clone, Default)]
struct CountingHooks {
    events: Arc<AtomicUsize>,
}

impl Hooks for CountingHooks {
    fn on_event(&self, _event: &BrokerEvent) {
        self.events.fetch_add(1, Ordering::SeqCst);
    }
}

fn event() -> BrokerEvent {
    BrokerEvent::ClientConnected {
        client_id: Arc::from("c1"),
        protocol_version: crate::protocol::ProtocolVersion::V5,
        session_present: false,
    }
}

#[test]
fn test_composite_requires_every_member() {
    let hooks = CompositeHooks::new().with(AllowHooks).with(DenyHooks);
    assert_eq!(hooks.len(), 2);
    assert!(!hooks.authenticate("c", None, None));
    assert!(hooks.authorize("c", None, None, "public/a", false, b""));
    assert!(!hooks.authorize("c", None, None, "secret/a", false, b""));
}

#[test]
fn test_empty_composite_allows() {
    let hooks = CompositeHooks::new();
    assert!(hooks.is_empty());
    assert!(hooks.authenticate("c", None, None));
}

#[test]
fn test_events_reach_every_member() {
    let a = CountingHooks::default();
    let b = CountingHooks::default();
    let hooks = CompositeHooks::new().with(a.clone()).with(b.clone());
    hooks.on_event(&event());
    hooks.on_event(&event());
    assert_eq!(a.events.load(Ordering::SeqCst), 2);
    assert_eq!(b.events.load(Ordering::SeqCst), 2);
}

#[test]
fn test_arc_wrapper_delegates() {
    let hooks: Arc<dyn Hooks> = Arc::new(DenyHooks);
    assert!(!hooks.authenticate("c", None, None));
    let wrapped = Arc::new(hooks);
    assert!(!wrapped.authorize("c", None, None, "secret/x", true, b""));
}
