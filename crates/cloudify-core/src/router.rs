//! Model role routing and deterministic escalation.
//!
//! A [`RoutingTable`] maps each logical [`ModelRole`] to a primary model id and
//! an ordered fallback chain. The table is read-only at runtime; escalation
//! state lives in the caller-held [`ModelSelection`], so [`RoutingTable::escalate`]
//! is a pure transition function and the table can be shared across agents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RouterError;

/// Logical task categories an agent can ask a model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Cheap, low-latency classification and extraction.
    Fast,
    DeepReasoning,
    Planning,
    CodeGeneration,
    /// Multi-model ensemble voting.
    Ensemble,
}

impl ModelRole {
    pub const ALL: [ModelRole; 5] = [
        ModelRole::Fast,
        ModelRole::DeepReasoning,
        ModelRole::Planning,
        ModelRole::CodeGeneration,
        ModelRole::Ensemble,
    ];
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelRole::Fast => "fast",
            ModelRole::DeepReasoning => "deep_reasoning",
            ModelRole::Planning => "planning",
            ModelRole::CodeGeneration => "code_generation",
            ModelRole::Ensemble => "ensemble",
        };
        write!(f, "{s}")
    }
}

/// Primary model plus ordered fallbacks for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRoute {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl ModelRoute {
    pub fn new<I, S>(primary: impl Into<String>, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary: primary.into(),
            fallbacks: fallbacks.into_iter().map(Into::into).collect(),
        }
    }

    /// Model id at `position` in the chain (0 = primary).
    fn at(&self, position: usize) -> Option<&str> {
        if position == 0 {
            Some(self.primary.as_str())
        } else {
            self.fallbacks.get(position - 1).map(String::as_str)
        }
    }

    /// Total number of models in the chain, primary included.
    pub fn chain_len(&self) -> usize {
        1 + self.fallbacks.len()
    }
}

/// A model chosen for a role, carrying its position in the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub role: ModelRole,
    pub model: String,
    /// 0 for the primary model, `n` for the n-th fallback.
    pub position: usize,
}

/// Static role to model configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    routes: BTreeMap<ModelRole, ModelRoute>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let mut routes = BTreeMap::new();
        routes.insert(
            ModelRole::Fast,
            ModelRoute::new(
                "anthropic/claude-3-5-haiku",
                ["openai/gpt-4o-mini", "google/gemini-2.0-flash"],
            ),
        );
        routes.insert(
            ModelRole::DeepReasoning,
            ModelRoute::new(
                "anthropic/claude-opus-4",
                ["openai/o3", "google/gemini-2.5-pro"],
            ),
        );
        routes.insert(
            ModelRole::Planning,
            ModelRoute::new(
                "anthropic/claude-sonnet-4",
                ["anthropic/claude-opus-4", "openai/gpt-4.1"],
            ),
        );
        routes.insert(
            ModelRole::CodeGeneration,
            ModelRoute::new(
                "anthropic/claude-sonnet-4",
                ["openai/gpt-4.1", "anthropic/claude-3-5-haiku"],
            ),
        );
        routes.insert(
            ModelRole::Ensemble,
            ModelRoute::new(
                "anthropic/claude-opus-4",
                ["openai/gpt-4.1", "google/gemini-2.5-pro"],
            ),
        );
        Self { routes }
    }
}

impl RoutingTable {
    /// An empty table; combine with [`RoutingTable::with_route`].
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    pub fn with_route(mut self, role: ModelRole, route: ModelRoute) -> Self {
        self.routes.insert(role, route);
        self
    }

    pub fn get(&self, role: ModelRole) -> Option<&ModelRoute> {
        self.routes.get(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModelRole, &ModelRoute)> {
        self.routes.iter()
    }

    /// Select the primary model for `role`.
    ///
    /// Deterministic: the same role always yields the same selection.
    pub fn route(&self, role: ModelRole) -> Result<ModelSelection, RouterError> {
        let route = self.routes.get(&role).ok_or(RouterError::UnknownRole(role))?;
        Ok(ModelSelection {
            role,
            model: route.primary.clone(),
            position: 0,
        })
    }

    /// Advance `current` to the next model in its role's fallback chain.
    ///
    /// Returns [`RouterError::EscalationExhausted`] once the chain is consumed.
    pub fn escalate(
        &self,
        current: &ModelSelection,
        failure_reason: &str,
    ) -> Result<ModelSelection, RouterError> {
        let route = self
            .routes
            .get(&current.role)
            .ok_or(RouterError::UnknownRole(current.role))?;
        let next = current.position + 1;
        match route.at(next) {
            Some(model) => Ok(ModelSelection {
                role: current.role,
                model: model.to_string(),
                position: next,
            }),
            None => Err(RouterError::EscalationExhausted {
                role: current.role,
                attempts: route.chain_len(),
                last_reason: failure_reason.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::empty().with_route(
            ModelRole::Planning,
            ModelRoute::new("primary", ["fallback-a", "fallback-b"]),
        )
    }

    #[test]
    fn route_is_deterministic() {
        let t = table();
        let a = t.route(ModelRole::Planning).unwrap();
        let b = t.route(ModelRole::Planning).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.model, "primary");
        assert_eq!(a.position, 0);
    }

    #[test]
    fn escalate_walks_chain_then_exhausts() {
        let t = table();
        let first = t.route(ModelRole::Planning).unwrap();
        let second = t.escalate(&first, "timeout").unwrap();
        assert_eq!(second.model, "fallback-a");
        let third = t.escalate(&second, "rate limited").unwrap();
        assert_eq!(third.model, "fallback-b");
        assert_eq!(third.position, 2);

        match t.escalate(&third, "overloaded") {
            Err(RouterError::EscalationExhausted {
                role,
                attempts,
                last_reason,
            }) => {
                assert_eq!(role, ModelRole::Planning);
                assert_eq!(attempts, 3);
                assert_eq!(last_reason, "overloaded");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn escalation_does_not_mutate_table() {
        let t = table();
        let first = t.route(ModelRole::Planning).unwrap();
        let _ = t.escalate(&first, "x").unwrap();
        assert_eq!(t.route(ModelRole::Planning).unwrap(), first);
    }

    #[test]
    fn primary_only_route_exhausts_immediately() {
        let t = RoutingTable::empty()
            .with_route(ModelRole::Fast, ModelRoute::new("solo", Vec::<String>::new()));
        let sel = t.route(ModelRole::Fast).unwrap();
        assert!(matches!(
            t.escalate(&sel, "down"),
            Err(RouterError::EscalationExhausted { attempts: 1, .. })
        ));
    }

    #[test]
    fn unknown_role_is_reported() {
        let t = table();
        assert_eq!(
            t.route(ModelRole::Ensemble),
            Err(RouterError::UnknownRole(ModelRole::Ensemble))
        );
    }

    #[test]
    fn default_table_covers_every_role() {
        let t = RoutingTable::default();
        for role in ModelRole::ALL {
            assert!(t.route(role).is_ok(), "missing route for {role}");
        }
    }

    #[test]
    fn routing_table_parses_from_toml() {
        let raw = r#"
            [planning]
            primary = "m1"
            fallbacks = ["m2"]
        "#;
        let t: RoutingTable = toml::from_str(raw).unwrap();
        assert_eq!(t.route(ModelRole::Planning).unwrap().model, "m1");
        assert_eq!(t.get(ModelRole::Planning).unwrap().chain_len(), 2);
    }
}
