//! Rule table dispatching subjects to handlers

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::subject::matches;
use crate::metrics;

/// Identity of a routing rule
pub type RuleId = u64;

/// Synchronous handler invoked for every matching subject
pub trait RouteHandler: Send + Sync {
    fn handle(&self, subject: &str, payload: &Value) -> anyhow::Result<()>;
}

impl<F> RouteHandler for F
where
    F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, subject: &str, payload: &Value) -> anyhow::Result<()> {
        self(subject, payload)
    }
}

struct RoutingRule {
    id: RuleId,
    pattern: String,
    handler: Arc<dyn RouteHandler>,
    enabled: bool,
}

/// Public view of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    pub id: RuleId,
    pub pattern: String,
    pub enabled: bool,
}

/// Subject router holding process-lifetime rules
pub struct SubjectRouter {
    rules: RwLock<Vec<RoutingRule>>,
    next_id: AtomicU64,
}

impl SubjectRouter {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add an enabled rule
    pub fn add_rule(&self, pattern: impl Into<String>, handler: Arc<dyn RouteHandler>) -> RuleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pattern = pattern.into();
        debug!(rule = id, pattern = %pattern, "Routing rule added");
        self.rules.write().push(RoutingRule {
            id,
            pattern,
            handler,
            enabled: true,
        });
        id
    }

    pub fn remove_rule(&self, id: RuleId) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    pub fn set_enabled(&self, id: RuleId, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> Vec<RuleInfo> {
        self.rules
            .read()
            .iter()
            .map(|r| RuleInfo {
                id: r.id,
                pattern: r.pattern.clone(),
                enabled: r.enabled,
            })
            .collect()
    }

    /// Invoke every enabled rule matching `subject`; returns how many matched.
    ///
    /// A failing or panicking handler is logged and does not affect the others.
    pub fn route(&self, subject: &str, payload: &Value) -> usize {
        let matched: Vec<(RuleId, Arc<dyn RouteHandler>)> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && matches(&r.pattern, subject))
            .map(|r| (r.id, Arc::clone(&r.handler)))
            .collect();

        for (id, handler) in &matched {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(subject, payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::record_handler_error();
                    warn!(rule = id, subject = subject, error = %e, "Routing handler failed");
                }
                Err(_) => {
                    metrics::record_handler_error();
                    error!(rule = id, subject = subject, "Routing handler panicked");
                }
            }
        }

        matched.len()
    }
}

impl Default for SubjectRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubjectRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectRouter")
            .field("rules", &self.rules())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn RouteHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn RouteHandler> =
            Arc::new(move |subject: &str, _payload: &Value| -> anyhow::Result<()> {
                sink.lock().push(subject.to_string());
                Ok(())
            });
        (seen, handler)
    }

    #[test]
    fn test_route_counts_matching_rules() {
        let router = SubjectRouter::new();
        let (seen_a, handler_a) = recorder();
        let (seen_b, handler_b) = recorder();
        router.add_rule("hub.global.>", handler_a);
        router.add_rule("hub.presence.*", handler_b);

        assert_eq!(router.route("hub.global.presence", &json!({})), 1);
        assert_eq!(router.route("hub.local.other", &json!({})), 0);
        assert_eq!(*seen_a.lock(), vec!["hub.global.presence".to_string()]);
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let router = SubjectRouter::new();
        router.add_rule(
            "hub.>",
            Arc::new(|_: &str, _: &Value| -> anyhow::Result<()> { anyhow::bail!("boom") }),
        );
        router.add_rule(
            "hub.>",
            Arc::new(|_: &str, _: &Value| -> anyhow::Result<()> { panic!("handler bug") }),
        );
        let (seen, handler) = recorder();
        router.add_rule("hub.>", handler);

        assert_eq!(router.route("hub.global.presence", &json!({"a": 1})), 3);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_disabled_rules_never_match() {
        let router = SubjectRouter::new();
        let (seen, handler) = recorder();
        let id = router.add_rule("hub.>", handler);

        assert!(router.set_enabled(id, false));
        assert_eq!(router.route("hub.x", &json!(null)), 0);

        assert!(router.set_enabled(id, true));
        assert_eq!(router.route("hub.x", &json!(null)), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_remove_rule_by_identity() {
        let router = SubjectRouter::new();
        let (_, first) = recorder();
        let (_, second) = recorder();
        let a = router.add_rule("hub.>", first);
        let b = router.add_rule("hub.>", second);

        assert!(router.remove_rule(a));
        assert!(!router.remove_rule(a));
        assert_eq!(router.rules().len(), 1);
        assert_eq!(router.rules()[0].id, b);
    }
}
