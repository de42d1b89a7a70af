//! Key and channel namespacing.
//!
//! Every key and channel that reaches the broker goes through one
//! [`KeyPrefix`], so publishers and subscribers can never disagree about it.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Optional `<prefix>:` namespace shared by the whole client.
pub struct KeyPrefix {
    value: ArcSwapOption<String>,
}

impl KeyPrefix {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            value: ArcSwapOption::from(prefix.map(Arc::new)),
        }
    }

    /// Replace the prefix for every later key, returning the new value.
    pub fn set_prefix(&self, prefix: Option<String>) -> Option<String> {
        self.value.store(prefix.clone().map(Arc::new));
        prefix
    }

    pub fn get(&self) -> Option<String> {
        self.value.load_full().map(|p| p.as_ref().clone())
    }

    /// `"<prefix>:<key>"` when a prefix is set, `key` otherwise.
    pub fn prefix(&self, key: &str) -> String {
        match self.value.load().as_deref() {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Undo [`prefix`](Self::prefix) on a wire channel name.
    ///
    /// Names that do not carry the current prefix are returned unchanged.
    pub fn strip<'a>(&self, channel: &'a str) -> &'a str {
        let guard = self.value.load();
        let Some(prefix) = guard.as_deref() else {
            return channel;
        };
        channel
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(channel)
    }
}

impl Default for KeyPrefix {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPrefix").field(&self.get()).finish()
    }
}
