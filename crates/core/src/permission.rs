//! Permission gate: decides whether a requested tool call may execute.
//!
//! The gate is an opaque collaborator: the executor asks once per call and
//! never caches anything itself. "Allow always" bookkeeping belongs to the
//! gate (see [`CachingGate`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::tool::ToolParams;

/// The outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

impl PermissionDecision {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// Decides whether a tool call may run.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Decide on a (tool name, parameters) pair.
    async fn decide(&self, tool_name: &str, params: &ToolParams) -> PermissionDecision;

    /// Boolean form used by the executor.
    async fn check_permission(&self, tool_name: &str, params: &ToolParams) -> bool {
        self.decide(tool_name, params).await.is_allowed()
    }
}

/// Allows every call. The default when no gate is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn decide(&self, _tool_name: &str, _params: &ToolParams) -> PermissionDecision {
        PermissionDecision::AllowOnce
    }
}

/// Static allow/deny lists.
///
/// Rules:
/// - A name in `deny` (or `"*"` in `deny`) is denied
/// - A name in `allow` (or `"*"` in `allow`) is allowed
/// - Anything else gets the fallback decision
#[derive(Debug, Clone)]
pub struct PolicyGate {
    allow: Vec<String>,
    deny: Vec<String>,
    fallback: PermissionDecision,
}

impl PolicyGate {
    pub fn new(allow: Vec<String>, deny: Vec<String>, fallback: PermissionDecision) -> Self {
        Self {
            allow,
            deny,
            fallback,
        }
    }

    fn listed(list: &[String], tool_name: &str) -> bool {
        list.iter().any(|entry| entry == "*" || entry == tool_name)
    }
}

#[async_trait]
impl PermissionGate for PolicyGate {
    async fn decide(&self, tool_name: &str, _params: &ToolParams) -> PermissionDecision {
        if Self::listed(&self.deny, tool_name) {
            return PermissionDecision::Deny;
        }
        if Self::listed(&self.allow, tool_name) {
            return PermissionDecision::AllowAlways;
        }
        self.fallback
    }
}

/// Remembers `AllowAlways` answers from an inner gate, per tool name.
pub struct CachingGate {
    inner: Arc<dyn PermissionGate>,
    always: Mutex<HashSet<String>>,
}

impl CachingGate {
    pub fn new(inner: Arc<dyn PermissionGate>) -> Self {
        Self {
            inner,
            always: Mutex::new(HashSet::new()),
        }
    }

    fn remembered(&self, tool_name: &str) -> bool {
        self.always
            .lock()
            .map(|set| set.contains(tool_name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl PermissionGate for CachingGate {
    async fn decide(&self, tool_name: &str, params: &ToolParams) -> PermissionDecision {
        if self.remembered(tool_name) {
            return PermissionDecision::AllowAlways;
        }
        let decision = self.inner.decide(tool_name, params).await;
        if decision == PermissionDecision::AllowAlways {
            if let Ok(mut set) = self.always.lock() {
                set.insert(tool_name.to_string());
            }
        }
        decision
    }
}

/// A sub-agent's gate: forwards every check to the parent's gate.
pub struct DelegatingGate {
    parent: Arc<dyn PermissionGate>,
    label: String,
}

impl DelegatingGate {
    pub fn new(parent: Arc<dyn PermissionGate>, label: impl Into<String>) -> Self {
        Self {
            parent,
            label: label.into(),
        }
    }
}

#[async_trait]
impl PermissionGate for DelegatingGate {
    async fn decide(&self, tool_name: &str, params: &ToolParams) -> PermissionDecision {
        debug!(sub_agent = %self.label, tool = tool_name, "Delegating permission check to parent");
        self.parent.decide(tool_name, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGate {
        decision: PermissionDecision,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PermissionGate for CountingGate {
        async fn decide(&self, _tool_name: &str, _params: &ToolParams) -> PermissionDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decision
        }
    }

    #[tokio::test]
    async fn allow_all_allows() {
        assert!(AllowAll.check_permission("shell", &ToolParams::new()).await);
    }

    #[tokio::test]
    async fn policy_deny_wins_over_allow() {
        let gate = PolicyGate::new(
            vec!["*".into()],
            vec!["shell".into()],
            PermissionDecision::Deny,
        );
        assert!(!gate.check_permission("shell", &ToolParams::new()).await);
        assert!(gate.check_permission("read_file", &ToolParams::new()).await);
    }

    #[tokio::test]
    async fn policy_uses_fallback_for_unlisted_tools() {
        let gate = PolicyGate::new(vec!["read_file".into()], vec![], PermissionDecision::Deny);
        assert_eq!(
            gate.decide("write_file", &ToolParams::new()).await,
            PermissionDecision::Deny
        );
        assert_eq!(
            gate.decide("read_file", &ToolParams::new()).await,
            PermissionDecision::AllowAlways
        );
    }

    #[tokio::test]
    async fn caching_gate_remembers_allow_always() {
        let inner = Arc::new(CountingGate {
            decision: PermissionDecision::AllowAlways,
            calls: AtomicUsize::new(0),
        });
        let gate = CachingGate::new(inner.clone());

        assert!(gate.check_permission("grep", &ToolParams::new()).await);
        assert!(gate.check_permission("grep", &ToolParams::new()).await);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caching_gate_does_not_remember_allow_once() {
        let inner = Arc::new(CountingGate {
            decision: PermissionDecision::AllowOnce,
            calls: AtomicUsize::new(0),
        });
        let gate = CachingGate::new(inner.clone());

        gate.check_permission("grep", &ToolParams::new()).await;
        gate.check_permission("grep", &ToolParams::new()).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delegating_gate_forwards_to_parent() {
        let parent = Arc::new(CountingGate {
            decision: PermissionDecision::Deny,
            calls: AtomicUsize::new(0),
        });
        let child = DelegatingGate::new(parent.clone(), "explorer");

        assert!(!child.check_permission("shell", &ToolParams::new()).await);
        assert_eq!(parent.calls.load(Ordering::SeqCst), 1);
    }
}
