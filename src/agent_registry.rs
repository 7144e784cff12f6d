//! C8 (data side) — `AgentRegistry`: the fixed agent-id → capability table.
//!
//! Dispatch is a lookup into this table, not open subclassing (§9 redesign
//! flag: "dynamically typed per-agent dispatch... expose an `Agent` capability
//! with variants enumerated in a registry"). The eight domain specialists plus
//! the generalist `assistant` and the `multi_agent` pseudo-agent form the
//! closed set named in §6.

use std::collections::HashMap;
use std::time::Duration;

/// One row of the agent table (§4.8).
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub display_name: String,
    pub system_prompt: String,
    pub model_id: String,
    pub temperature: f32,
    /// Timeout for this agent's model calls (§4.6: "default 30s; 60s for the
    /// 'engineer' agent").
    pub timeout: Duration,
    pub can_delegate: bool,
    pub can_research: bool,
    /// Peer agent ids this agent is permitted to call (§4.8).
    pub allowed_callees: Vec<String>,
    /// If true, a failing child fails the parent (§4.11, §7; default false per
    /// SPEC_FULL.md's resolution of the corresponding Open Question).
    pub require_children: bool,
}

impl AgentRecord {
    fn new(id: &str, display_name: &str, system_prompt: &str, model_id: &str) -> Self {
        AgentRecord {
            id: id.to_string(),
            display_name: display_name.to_string(),
            system_prompt: system_prompt.to_string(),
            model_id: model_id.to_string(),
            temperature: 0.4,
            timeout: Duration::from_secs(30),
            can_delegate: false,
            can_research: false,
            allowed_callees: Vec::new(),
            require_children: false,
        }
    }

    fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    fn delegates_to(mut self, callees: &[&str]) -> Self {
        self.can_delegate = true;
        self.allowed_callees = callees.iter().map(|s| s.to_string()).collect();
        self
    }

    fn researches(mut self) -> Self {
        self.can_research = true;
        self
    }
}

/// The closed agent table (§6, §4.8).
pub struct AgentRegistry {
    agents: HashMap<String, AgentRecord>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentRecord>) -> Self {
        AgentRegistry {
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(|s| s.as_str())
    }

    /// Agent ids explicit-mention scanning should consider (excludes the
    /// `multi_agent` pseudo-agent, which is never user-addressable by name).
    pub fn nameable_ids(&self) -> Vec<&str> {
        self.agents
            .keys()
            .map(|s| s.as_str())
            .filter(|id| *id != "multi_agent")
            .collect()
    }

    /// Construct the default, spec-fixed table (§6's closed agent-id set),
    /// with model ids overridden per `model_ids` (falling back to a per-agent
    /// default when absent, per `EngineConfig::model_ids`).
    pub fn default_registry(model_ids: &HashMap<String, String>) -> Self {
        let model_for = |agent_id: &str, default: &str| -> String {
            model_ids.get(agent_id).cloned().unwrap_or_else(|| default.to_string())
        };

        let agents = vec![
            AgentRecord::new(
                "product_manager",
                "Product Manager",
                "You are a product manager. Frame requests in terms of user value, scope, and tradeoffs. \
                 When a request needs an engineering feasibility read, delegate to the engineer agent \
                 using a DELEGATE block.",
                &model_for("product_manager", "gpt-4o-mini"),
            )
            .delegates_to(&["engineer", "marketing_strategist"]),
            AgentRecord::new(
                "finance_manager",
                "Finance Manager",
                "You are a finance manager. Answer with concrete numbers, assumptions stated explicitly, \
                 and a short sensitivity note.",
                &model_for("finance_manager", "gpt-4o-mini"),
            ),
            AgentRecord::new(
                "marketing_strategist",
                "Marketing Strategist",
                "You are a marketing strategist. Propose positioning and channel strategy. You may \
                 delegate lead-sourcing questions to the leadgen agent.",
                &model_for("marketing_strategist", "gpt-4o-mini"),
            )
            .delegates_to(&["leadgen"])
            .researches(),
            AgentRecord::new(
                "leadgen",
                "Lead Generation Specialist",
                "You identify and qualify leads from a given market description. You may delegate \
                 outreach drafting to the outbound_mail agent.",
                &model_for("leadgen", "gpt-4o-mini"),
            )
            .delegates_to(&["outbound_mail"])
            .researches(),
            AgentRecord::new(
                "outbound_mail",
                "Outbound Mail Writer",
                "You draft outbound mail copy: subject line, body, and a single clear call to action.",
                &model_for("outbound_mail", "gpt-4o-mini"),
            ),
            AgentRecord::new(
                "call_prep",
                "Call Prep Assistant",
                "You prepare a one-page call brief: attendee context, goals, and three questions to ask.",
                &model_for("call_prep", "gpt-4o-mini"),
            ),
            AgentRecord::new(
                "engineer",
                "Engineer",
                "You assess engineering feasibility, effort, and risk for the request given to you. You \
                 may delegate product-scope clarification back to the product_manager agent.",
                &model_for("engineer", "gpt-4o"),
            )
            .with_timeout(Duration::from_secs(60))
            .delegates_to(&["product_manager"]),
            AgentRecord::new(
                "assistant",
                "Assistant",
                "You are a general-purpose assistant. Answer directly; delegate to a domain specialist \
                 only when the request clearly needs one.",
                &model_for("assistant", "gpt-4o-mini"),
            )
            .delegates_to(&[
                "product_manager",
                "finance_manager",
                "marketing_strategist",
                "leadgen",
                "engineer",
            ])
            .researches(),
            AgentRecord::new(
                "multi_agent",
                "Multi-Agent Consolidator",
                "You consolidate the outputs of several agents consulted on the same request into one \
                 coherent answer.",
                &model_for("multi_agent", "gpt-4o-mini"),
            ),
        ];

        AgentRegistry::new(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_contains_closed_agent_set() {
        let registry = AgentRegistry::default_registry(&HashMap::new());
        for id in [
            "product_manager",
            "finance_manager",
            "marketing_strategist",
            "leadgen",
            "outbound_mail",
            "call_prep",
            "engineer",
            "assistant",
            "multi_agent",
        ] {
            assert!(registry.get(id).is_some(), "missing agent {}", id);
        }
    }

    #[test]
    fn engineer_has_extended_timeout() {
        let registry = AgentRegistry::default_registry(&HashMap::new());
        assert_eq!(registry.get("engineer").unwrap().timeout, Duration::from_secs(60));
    }

    #[test]
    fn model_id_override_takes_precedence() {
        let mut overrides = HashMap::new();
        overrides.insert("engineer".to_string(), "custom-model".to_string());
        let registry = AgentRegistry::default_registry(&overrides);
        assert_eq!(registry.get("engineer").unwrap().model_id, "custom-model");
        assert_eq!(registry.get("finance_manager").unwrap().model_id, "gpt-4o-mini");
    }

    #[test]
    fn nameable_ids_excludes_multi_agent_pseudo_agent() {
        let registry = AgentRegistry::default_registry(&HashMap::new());
        assert!(!registry.nameable_ids().contains(&"multi_agent"));
        assert!(registry.nameable_ids().contains(&"engineer"));
    }

    #[test]
    fn finance_manager_cannot_delegate() {
        let registry = AgentRegistry::default_registry(&HashMap::new());
        let record = registry.get("finance_manager").unwrap();
        assert!(!record.can_delegate);
        assert!(record.allowed_callees.is_empty());
    }
}
