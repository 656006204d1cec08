//! Hooks Module
//!
//! Extensibility points consulted by the broker: authentication at CONNECT,
//! authorization before a PUBLISH or SUBSCRIBE is applied, and an
//! observability callback for every [`BrokerEvent`].
//!
//! Hooks run synchronously while the broker lock is held, so
//! implementations must not block.

use std::sync::Arc;

use crate::broker::BrokerEvent;

#[cfg(test)]
mod tests;

/// Broker hooks trait
///
/// All methods have default implementations that allow everything.
pub trait Hooks: Send + Sync {
    /// Called before a CONNECT is accepted. `false` refuses the connection
    /// with a CONNACK failure code.
    fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> bool {
        true
    }

    /// Called before a PUBLISH is routed (`is_subscription == false`, the
    /// topic is the topic name) or a SUBSCRIBE filter is applied
    /// (`is_subscription == true`, the topic is the filter as sent and the
    /// payload is empty).
    fn authorize(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
        _topic: &str,
        _is_subscription: bool,
        _payload: &[u8],
    ) -> bool {
        true
    }

    /// Observability callback
    fn on_event(&self, _event: &BrokerEvent) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        (**self).authenticate(client_id, username, password)
    }

    fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        topic: &str,
        is_subscription: bool,
        payload: &[u8],
    ) -> bool {
        (**self).authorize(client_id, username, password, topic, is_subscription, payload)
    }

    fn on_event(&self, event: &BrokerEvent) {
        (**self).on_event(event)
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// Authentication and authorization succeed only if every member agrees;
/// events reach every member in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Hooks for CompositeHooks {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        self.hooks
            .iter()
            .all(|h| h.authenticate(client_id, username, password))
    }

    fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        topic: &str,
        is_subscription: bool,
        payload: &[u8],
    ) -> bool {
        self.hooks.iter().all(|h| {
            h.authorize(client_id, username, password, topic, is_subscription, payload)
        })
    }

    fn on_event(&self, event: &BrokerEvent) {
        for hooks in &self.hooks {
            hooks.on_event(event);
        }
    }
}
