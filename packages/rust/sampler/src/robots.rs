//! robots.txt parsing and the per-session verdict cache.

use std::collections::HashMap;

/// Parsed robots.txt rules.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    /// Rules per user-agent token (lowercase).
    rules: HashMap<String, AgentRules>,

    /// Rules for `*`.
    default_rules: AgentRules,
}

#[derive(Debug, Clone, Default)]
struct AgentRules {
    disallow: Vec<String>,
    /// Allowed path prefixes (override disallow).
    allow: Vec<String>,
}

impl RobotsTxt {
    /// Parse robots.txt content. Unknown directives are ignored.
    pub fn parse(content: &str) -> Self {
        let mut robots = Self::default();
        let mut current_agents: Vec<String> = Vec::new();
        let mut current_rules = AgentRules::default();
        // Consecutive User-agent lines share one group.
        let mut in_rules = false;

        for line in content.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before.trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    if in_rules {
                        robots.store_group(&current_agents, &current_rules);
                        current_agents.clear();
                        current_rules = AgentRules::default();
                        in_rules = false;
                    }
                    current_agents.push(value.to_lowercase());
                }
                "disallow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        current_rules.disallow.push(value.to_string());
                    }
                }
                "allow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        current_rules.allow.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        robots.store_group(&current_agents, &current_rules);
        robots
    }

    fn store_group(&mut self, agents: &[String], rules: &AgentRules) {
        for agent in agents {
            if agent == "*" {
                self.default_rules = rules.clone();
            } else {
                self.rules.insert(agent.clone(), rules.clone());
            }
        }
    }

    /// Check if a path is allowed for a user-agent.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let agent_lower = user_agent.to_lowercase();
        let token = agent_lower.split('/').next().unwrap_or(&agent_lower);

        let rules = self
            .rules
            .get(token)
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|(k, _)| agent_lower.contains(k.as_str()))
                    .map(|(_, v)| v)
            })
            .unwrap_or(&self.default_rules);

        if rules.allow.iter().any(|allow| path.starts_with(allow)) {
            return true;
        }

        !rules
            .disallow
            .iter()
            .any(|disallow| disallow == "/" || path.starts_with(disallow))
    }

    /// Check if robots.txt disallows all crawling for this agent.
    pub fn disallows_all(&self, user_agent: &str) -> bool {
        !self.is_allowed(user_agent, "/")
    }
}

/// Blanket-disallow verdicts per origin, scoped to one sampling session.
#[derive(Debug, Default)]
pub struct RobotsCache {
    blocked: HashMap<String, bool>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached verdict for `origin`, if it has been looked up already.
    pub fn get(&self, origin: &str) -> Option<bool> {
        self.blocked.get(origin).copied()
    }

    pub fn insert(&mut self, origin: impl Into<String>, blocked: bool) {
        self.blocked.insert(origin.into(), blocked);
    }
}
