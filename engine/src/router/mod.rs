//! Capability Router
//!
//! Maps a free-form intent into an ordered plan of steps bound to concrete
//! capabilities:
//!
//! 1. Normalize the intent into category tags using keyword rules.
//! 2. For each required tag, select the highest-priority registered
//!    capability whose requirements are currently satisfiable. Ties break by
//!    registration name, never by arrival order, so routing is reproducible
//!    for a fixed registry snapshot.
//! 3. Encode step ordering from the declared tag dependencies: every plan
//!    runs load-context first, the action steps next, and verify-completion
//!    last.
//!
//! An unsatisfiable tag returns `MissingCapability` naming the unmet tag; the
//! router never silently drops a requirement.

pub mod plan;

pub use plan::{Plan, Step};

use regex::Regex;
use sdk::errors::ControllerError;
use sdk::types::{RegistryEntry, RiskLevel};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Structural tag bound to the first step of every plan
pub const TAG_LOAD_CONTEXT: &str = "load-context";
/// Structural tag bound to the final step of every plan
pub const TAG_VERIFY_COMPLETION: &str = "verify-completion";
/// Fallback action tag when no keyword rule matches the intent
pub const TAG_GENERAL: &str = "general";

/// Registry of routable capabilities.
///
/// Entries are keyed by name in a BTreeMap so iteration order, and therefore
/// tie-breaking, is deterministic. The `available` set tracks which declared
/// requirements (tools, integrations) are currently satisfied.
#[derive(Debug, Default, Clone)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    available: BTreeSet<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: RegistryEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn mark_requirement_available(&mut self, requirement: &str) {
        self.available.insert(requirement.to_string());
    }

    pub fn mark_requirement_unavailable(&mut self, requirement: &str) {
        self.available.remove(requirement);
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every declared requirement of the entry is available
    pub fn is_satisfiable(&self, entry: &RegistryEntry) -> bool {
        entry.requirements.iter().all(|r| self.available.contains(r))
    }

    /// Highest-priority satisfiable capability for a tag.
    ///
    /// Iteration is in name order and only a strictly greater priority
    /// replaces the current best, so ties resolve to the lexicographically
    /// smallest name.
    pub fn select_for_tag(&self, tag: &str) -> Option<&RegistryEntry> {
        let mut best: Option<&RegistryEntry> = None;
        for entry in self.entries.values() {
            if !entry.has_tag(tag) || !self.is_satisfiable(entry) {
                continue;
            }
            match best {
                Some(current) if entry.priority <= current.priority => {}
                _ => best = Some(entry),
            }
        }
        best
    }
}

/// One intent-normalization rule
struct IntentRule {
    pattern: Regex,
    tag: &'static str,
    risk: RiskLevel,
}

/// The capability router
pub struct Router {
    rules: Vec<IntentRule>,
    destructive: Regex,
}

impl Router {
    pub fn new() -> Self {
        let rule = |pattern: &str, tag: &'static str, risk: RiskLevel| IntentRule {
            // Patterns are compile-time constants; a failure here is a
            // programming error caught by the unit tests below
            #[allow(clippy::unwrap_used)]
            pattern: Regex::new(pattern).unwrap(),
            tag,
            risk,
        };

        Self {
            rules: vec![
                rule(r"(?i)\b(scrape|crawl|headlines?|extract)\b", "scrape", RiskLevel::Low),
                rule(
                    r"(?i)\b(database|migration|sql|schema)\b",
                    "database",
                    RiskLevel::High,
                ),
                rule(r"(?i)\b(deploy|release|rollout)\b", "deploy", RiskLevel::High),
                rule(
                    r"(?i)\b(notify|alert|message|email)\b",
                    "notify",
                    RiskLevel::Medium,
                ),
                rule(r"(?i)\b(monitor|watch|health)\b", "monitor", RiskLevel::Medium),
            ],
            #[allow(clippy::unwrap_used)]
            destructive: Regex::new(r"(?i)\b(delete|drop|remove|destroy|terminate|kill)\b")
                .unwrap(),
        }
    }

    /// Normalize an intent into action tags, in rule order, deduplicated
    fn action_tags(&self, intent: &str) -> Vec<(&'static str, RiskLevel)> {
        let mut tags = Vec::new();
        for rule in &self.rules {
            if rule.pattern.is_match(intent) && !tags.iter().any(|(t, _)| *t == rule.tag) {
                tags.push((rule.tag, rule.risk));
            }
        }
        tags
    }

    /// Route an intent against a registry snapshot.
    ///
    /// Deterministic: identical intent and registry yield an identical plan
    /// (same id, same step bindings) across repeated calls.
    pub fn route(
        &self,
        intent: &str,
        registry: &CapabilityRegistry,
    ) -> Result<Plan, ControllerError> {
        let mut actions = self.action_tags(intent);
        if actions.is_empty() {
            actions.push((TAG_GENERAL, RiskLevel::Low));
        }

        // Destructive wording escalates the risk of every action step
        let destructive = self.destructive.is_match(intent);

        let select = |tag: &str| -> Result<String, ControllerError> {
            registry
                .select_for_tag(tag)
                .map(|e| e.name.clone())
                .ok_or_else(|| ControllerError::MissingCapability(tag.to_string()))
        };

        let mut steps = Vec::new();

        steps.push(Step {
            index: 0,
            id: "step_1".to_string(),
            description: format!("Assemble context for: {}", intent),
            category: TAG_LOAD_CONTEXT.to_string(),
            capability: select(TAG_LOAD_CONTEXT)?,
            risk_level: RiskLevel::Low,
            dependencies: vec![],
            expected_outcome: "Relevant context loaded".to_string(),
        });

        let mut action_indices = Vec::new();
        for (tag, base_risk) in &actions {
            let index = steps.len();
            let risk = if destructive {
                base_risk.escalate()
            } else {
                *base_risk
            };
            steps.push(Step {
                index,
                id: format!("step_{}", index + 1),
                description: format!("Execute {} for: {}", tag, intent),
                category: tag.to_string(),
                capability: select(tag)?,
                risk_level: risk,
                dependencies: vec![0],
                expected_outcome: format!("{} outcome recorded with evidence", tag),
            });
            action_indices.push(index);
        }

        let verify_index = steps.len();
        steps.push(Step {
            index: verify_index,
            id: format!("step_{}", verify_index + 1),
            description: "Verify completion of all action steps".to_string(),
            category: TAG_VERIFY_COMPLETION.to_string(),
            capability: select(TAG_VERIFY_COMPLETION)?,
            risk_level: RiskLevel::Low,
            dependencies: action_indices,
            expected_outcome: "All action outcomes verified".to_string(),
        });

        tracing::debug!(
            intent = intent,
            steps = steps.len(),
            "routed intent into plan"
        );

        Ok(Plan::new(intent, steps))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::CapabilityKind;

    fn base_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(RegistryEntry::new(
            "context-loader",
            CapabilityKind::Skill,
            &[TAG_LOAD_CONTEXT],
            10,
        ));
        registry.register(RegistryEntry::new(
            "verifier",
            CapabilityKind::Skill,
            &[TAG_VERIFY_COMPLETION],
            10,
        ));
        registry.register(
            RegistryEntry::new("web-scrape", CapabilityKind::Skill, &["scrape"], 10)
                .with_requirements(&["http"]),
        );
        registry.register(RegistryEntry::new(
            "task-runner",
            CapabilityKind::Agent,
            &[TAG_GENERAL],
            5,
        ));
        registry.mark_requirement_available("http");
        registry
    }

    #[test]
    fn test_scrape_intent_routes_three_steps() {
        let router = Router::new();
        let registry = base_registry();

        let plan = router
            .route("scrape headlines from bbc.com", &registry)
            .unwrap();

        assert_eq!(plan.len(), 3);
        let steps = plan.steps();
        assert_eq!(steps[0].category, TAG_LOAD_CONTEXT);
        assert_eq!(steps[0].capability, "context-loader");
        assert_eq!(steps[1].category, "scrape");
        assert_eq!(steps[1].capability, "web-scrape");
        assert_eq!(steps[2].category, TAG_VERIFY_COMPLETION);
        assert_eq!(steps[2].capability, "verifier");

        // verify-completion depends on execute, execute on load-context
        assert_eq!(steps[1].dependencies, vec![0]);
        assert_eq!(steps[2].dependencies, vec![1]);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let router = Router::new();
        let registry = base_registry();

        let a = router.route("scrape headlines from bbc.com", &registry).unwrap();
        let b = router.route("scrape headlines from bbc.com", &registry).unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.steps(), b.steps());
    }

    #[test]
    fn test_missing_capability_names_the_tag() {
        let router = Router::new();
        let mut registry = base_registry();
        // http becomes unavailable; web-scrape is no longer satisfiable
        registry.mark_requirement_unavailable("http");

        let err = router
            .route("scrape headlines from bbc.com", &registry)
            .unwrap_err();
        match err {
            ControllerError::MissingCapability(tag) => assert_eq!(tag, "scrape"),
            other => panic!("expected MissingCapability, got {other}"),
        }
    }

    #[test]
    fn test_priority_selection_and_name_tie_break() {
        let mut registry = base_registry();
        registry.register(RegistryEntry::new(
            "premium-scraper",
            CapabilityKind::ExternalIntegration,
            &["scrape"],
            20,
        ));
        registry.register(RegistryEntry::new(
            "alpha-scraper",
            CapabilityKind::Skill,
            &["scrape"],
            20,
        ));

        // Highest priority wins; among equals the smallest name wins
        let selected = registry.select_for_tag("scrape").unwrap();
        assert_eq!(selected.name, "alpha-scraper");
    }

    #[test]
    fn test_unmatched_intent_falls_back_to_general() {
        let router = Router::new();
        let registry = base_registry();

        let plan = router.route("tidy up the workshop", &registry).unwrap();
        assert_eq!(plan.steps()[1].category, TAG_GENERAL);
        assert_eq!(plan.steps()[1].capability, "task-runner");
    }

    #[test]
    fn test_destructive_intent_escalates_risk() {
        let router = Router::new();
        let mut registry = base_registry();
        registry.register(RegistryEntry::new(
            "db-admin",
            CapabilityKind::ExternalIntegration,
            &["database"],
            10,
        ));

        let plan = router
            .route("drop the staging database schema", &registry)
            .unwrap();
        // database is already High; destructive wording keeps it High
        assert_eq!(plan.steps()[1].risk_level, RiskLevel::High);

        let plan = router.route("remove old headlines scrape", &registry).unwrap();
        // scrape is Low; destructive wording lifts it to Medium
        assert_eq!(plan.steps()[1].risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_multiple_action_tags_fan_out() {
        let router = Router::new();
        let mut registry = base_registry();
        registry.register(RegistryEntry::new(
            "notifier",
            CapabilityKind::ExternalIntegration,
            &["notify"],
            10,
        ));

        let plan = router
            .route("scrape headlines and notify the channel", &registry)
            .unwrap();

        assert_eq!(plan.len(), 4);
        let verify = &plan.steps()[3];
        assert_eq!(verify.category, TAG_VERIFY_COMPLETION);
        assert_eq!(verify.dependencies, vec![1, 2]);
    }
}
