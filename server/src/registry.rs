use std::{collections::HashMap, fmt, sync::Arc};

use interlink_common::Answer;
use serde_json::Value;
use thiserror::Error;

/// Handles calls to one method.
///
/// Returning `None` tells the caller nobody answered; the peer then receives
/// the fixed "no listener" error answer.
pub trait MethodHandler {
    /// Handles the `data` of one request
    fn handle(&self, data: Value) -> Option<Answer>;
}

impl<F> MethodHandler for F
where
    F: Fn(Value) -> Option<Answer>,
{
    fn handle(&self, data: Value) -> Option<Answer> {
        self(data)
    }
}

/// Handler as stored in the registry. Identity (the allocation) is what
/// [`ListenerRegistry::unregister`] matches on.
pub type SharedHandler = Arc<dyn MethodHandler>;

/// Registration failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another handler already owns the method
    #[error("a listener for method {0:?} is already registered")]
    AlreadyRegistered(String),
}

/// Maps method names to at most one handler each
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<String, SharedHandler>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

impl ListenerRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` unless the method is already taken,
    /// in which case the existing handler stays active.
    pub fn register<M: Into<String>>(
        &mut self,
        method: M,
        handler: SharedHandler,
    ) -> Result<(), RegistryError> {
        let method = method.into();
        if self.listeners.contains_key(&method) {
            tracing::warn!(method, "Listener already registered, keeping the existing one");
            return Err(RegistryError::AlreadyRegistered(method));
        }

        tracing::debug!(method, "Listener registered");
        self.listeners.insert(method, handler);
        Ok(())
    }

    /// Runs the handler for `method`; `None` if nothing is registered or the
    /// handler produced no answer.
    pub fn trigger(&self, method: &str, data: Value) -> Option<Answer> {
        self.listeners.get(method)?.handle(data)
    }

    /// Removes every method mapped to this exact handler. Returns how many
    /// mappings were removed.
    pub fn unregister(&mut self, handler: &SharedHandler) -> usize {
        let before = self.listeners.len();
        self.listeners
            .retain(|_, stored| !std::ptr::addr_eq(Arc::as_ptr(stored), Arc::as_ptr(handler)));
        let removed = before - self.listeners.len();

        if removed > 0 {
            tracing::debug!(removed, "Listener unregistered");
        }
        removed
    }

    /// Whether `method` has a handler
    pub fn is_registered(&self, method: &str) -> bool {
        self.listeners.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.listeners.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
