//! Server Name Indication routing: an ordered map from hostname pattern to
//! per-name SSL configuration, honouring exact matches before wildcards.

use std::collections::BTreeMap;
use std::sync::Arc;

use openssl::ssl::SslContext;

use super::{create_ssl_context, TlsContextOptions, TlsError};

pub(crate) struct SniNode {
    pub(crate) ssl_ctx: SslContext,
    pub(crate) user: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

/// Hostname-pattern tree. Patterns are matched case-insensitively; a
/// leading `*.` label matches exactly one leftmost label of the lookup
/// name. An exact entry always wins over a wildcard one.
#[derive(Default)]
pub struct SniTree {
    exact: BTreeMap<String, SniNode>,
    wildcard: BTreeMap<String, SniNode>,
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl SniTree {
    pub(crate) fn new() -> SniTree {
        SniTree::default()
    }

    /// Register `pattern` with its own SSL configuration. Re-adding an
    /// existing pattern is ignored, matching first-wins registration.
    pub fn add(
        &mut self,
        pattern: &str,
        options: &TlsContextOptions,
        user: Option<Arc<dyn std::any::Any + Send + Sync>>,
    ) -> Result<(), TlsError> {
        let key = normalize(pattern);
        let map = if key.starts_with("*.") {
            &mut self.wildcard
        } else {
            &mut self.exact
        };
        if map.contains_key(&key) {
            return Ok(());
        }
        let ssl_ctx = create_ssl_context(options)?;
        map.insert(key, SniNode { ssl_ctx, user });
        Ok(())
    }

    pub fn remove(&mut self, pattern: &str) {
        let key = normalize(pattern);
        if key.starts_with("*.") {
            self.wildcard.remove(&key);
        } else {
            self.exact.remove(&key);
        }
    }

    /// Look up a hostname. A lookup of a literal wildcard pattern matches
    /// the exact literal first, which is what registration management
    /// wants.
    pub(crate) fn find(&self, hostname: &str) -> Option<&SniNode> {
        let key = normalize(hostname);
        if let Some(node) = self.exact.get(&key) {
            return Some(node);
        }
        if let Some(node) = self.wildcard.get(&key) {
            return Some(node);
        }
        // Replace the leftmost label with `*` and try again.
        if let Some(dot) = key.find('.') {
            let wildcard_key = format!("*{}", &key[dot..]);
            if let Some(node) = self.wildcard.get(&wildcard_key) {
                return Some(node);
            }
        }
        None
    }

    pub(crate) fn find_user(&self, hostname: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.find(hostname).and_then(|node| node.user.clone())
    }
}

/// Shared SNI state of a parent TLS context: the pattern tree plus the
/// miss hook that may add the missing name synchronously, after which the
/// lookup is retried once.
pub(crate) struct SniState {
    pub(crate) tree: SniTree,
    pub(crate) on_missing: Option<fn(&mut SniTree, &str)>,
}

impl SniState {
    pub(crate) fn new() -> SniState {
        SniState {
            tree: SniTree::new(),
            on_missing: None,
        }
    }

    pub(crate) fn resolve(&mut self, hostname: &str) -> Option<SslContext> {
        if let Some(node) = self.tree.find(hostname) {
            return Some(node.ssl_ctx.clone());
        }
        let hook = self.on_missing?;
        hook(&mut self.tree, hostname);
        self.tree.find(hostname).map(|node| node.ssl_ctx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{SniState, SniTree};
    use crate::tls::TlsContextOptions;

    fn sample_options() -> TlsContextOptions {
        // No key material: a bare context is enough for routing tests.
        TlsContextOptions::default()
    }

    #[test]
    fn exact_beats_wildcard() {
        let mut tree = SniTree::new();
        tree.add("*.example.com", &sample_options(), None).unwrap();
        tree.add("a.example.com", &sample_options(), Some(std::sync::Arc::new(1u32)))
            .unwrap();

        let node = tree.find("a.example.com").unwrap();
        assert!(node.user.is_some());
        // Sibling names fall through to the wildcard.
        let node = tree.find("b.example.com").unwrap();
        assert!(node.user.is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut tree = SniTree::new();
        tree.add("Example.COM", &sample_options(), None).unwrap();
        assert!(tree.find("example.com").is_some());
        assert!(tree.find("EXAMPLE.com").is_some());
    }

    #[test]
    fn wildcard_matches_one_label() {
        let mut tree = SniTree::new();
        tree.add("*.example.com", &sample_options(), None).unwrap();
        assert!(tree.find("a.example.com").is_some());
        assert!(tree.find("example.com").is_none());
        // Only the leftmost label is wildcarded.
        assert!(tree.find("a.b.example.com").is_none());
    }

    #[test]
    fn miss_hook_is_retried_once() {
        let mut state = SniState::new();
        state.on_missing = Some(|tree, hostname| {
            tree.add(hostname, &crate::tls::TlsContextOptions::default(), None)
                .unwrap();
        });
        assert!(state.resolve("late.example.com").is_some());
        assert!(state.tree.find("late.example.com").is_some());
    }
}
