//! Routing rules: the `(condition, selector, priority)` triples the router
//! evaluates against every pending task (§3/§4.4).

use super::agent::{Agent, AgentStatus};
use super::ids::{AgentId, RoutingRuleId};
use super::task::Task;

/// Shared context a selector needs but that isn't carried on `Agent` or
/// `Task` themselves.
#[derive(Debug, Clone, Copy)]
pub struct RoutingContext {
    /// Current time, used to compute health scores.
    pub now: super::ids::Timestamp,
    /// Heartbeat interval, used to compute health scores.
    pub heartbeat_interval_ms: u64,
}

/// Weighted fitness score used by `ExactCapabilityMatch` (§4.3 Agent
/// selection): up to 30 points for low load, 30 for success rate, 40 for
/// health score.
#[must_use]
pub fn weighted_score(agent: &Agent, ctx: RoutingContext) -> f64 {
    let load_score = (1.0 - agent.load()).max(0.0) * 30.0;
    let success_score = (agent.success_rate() / 100.0) * 30.0;
    let health_score = (agent.health_score(ctx.now, ctx.heartbeat_interval_ms) / 100.0) * 40.0;
    load_score + success_score + health_score
}

fn healthy_available<'a>(
    agents: &'a [Agent],
    ctx: RoutingContext,
) -> impl Iterator<Item = &'a Agent> {
    agents
        .iter()
        .filter(move |agent| agent.is_healthy(ctx.now, ctx.heartbeat_interval_ms))
}

/// A `(condition, selector, priority)` triple consulted by the router.
/// Evaluation order is strictly descending `priority`; ties break by stable
/// registration order (the order rules appear in the router's rule table).
pub trait RoutingRule: Send + Sync {
    /// Stable identity for enable/disable/remove by id.
    fn id(&self) -> RoutingRuleId;
    /// Display name.
    fn name(&self) -> &str;
    /// Evaluation priority; higher runs first.
    fn priority(&self) -> i32;
    /// Whether this rule currently participates in evaluation.
    fn enabled(&self) -> bool;
    /// Enables or disables this rule.
    fn set_enabled(&mut self, enabled: bool);
    /// Whether this rule applies to `task` at all.
    fn condition(&self, task: &Task) -> bool;
    /// Picks an agent for `task` from `agents`, or `None` if no eligible
    /// agent exists under this rule's semantics.
    fn select(&self, agents: &[Agent], task: &Task, ctx: RoutingContext) -> Option<AgentId>;
}

/// Priority 10: task priority at or above the high-priority threshold picks
/// the healthiest available agent, ignoring capability and load.
pub struct HighPriorityRule {
    id: RoutingRuleId,
    enabled: bool,
}

impl HighPriorityRule {
    /// Fixed evaluation priority for this rule.
    pub const PRIORITY: i32 = 10;

    /// Constructs the rule with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RoutingRuleId::generate(),
            enabled: true,
        }
    }
}

impl Default for HighPriorityRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingRule for HighPriorityRule {
    fn id(&self) -> RoutingRuleId {
        self.id
    }

    fn name(&self) -> &str {
        "HighPriority"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn condition(&self, task: &Task) -> bool {
        task.priority.is_high()
    }

    fn select(&self, agents: &[Agent], _task: &Task, ctx: RoutingContext) -> Option<AgentId> {
        healthy_available(agents, ctx)
            .max_by(|a, b| {
                a.health_score(ctx.now, ctx.heartbeat_interval_ms)
                    .total_cmp(&b.health_score(ctx.now, ctx.heartbeat_interval_ms))
            })
            .map(|agent| agent.id)
    }
}

/// Priority 8: tasks with required capabilities defer to weighted
/// all-of capability matching (mirrors `C3.FindBestAgent` with
/// require-all semantics).
pub struct ExactCapabilityMatchRule {
    id: RoutingRuleId,
    enabled: bool,
}

impl ExactCapabilityMatchRule {
    /// Fixed evaluation priority for this rule.
    pub const PRIORITY: i32 = 8;

    /// Constructs the rule with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RoutingRuleId::generate(),
            enabled: true,
        }
    }
}

impl Default for ExactCapabilityMatchRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingRule for ExactCapabilityMatchRule {
    fn id(&self) -> RoutingRuleId {
        self.id
    }

    fn name(&self) -> &str {
        "ExactCapabilityMatch"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn condition(&self, task: &Task) -> bool {
        !task.required_capabilities.is_empty()
    }

    fn select(&self, agents: &[Agent], task: &Task, ctx: RoutingContext) -> Option<AgentId> {
        let mut best: Option<(&Agent, f64)> = None;
        for agent in healthy_available(agents, ctx) {
            if !task
                .required_capabilities
                .iter()
                .all(|cap| agent.capabilities.contains(cap))
            {
                continue;
            }
            let score = weighted_score(agent, ctx);
            best = match best {
                None => Some((agent, score)),
                Some((current_best, current_score)) => {
                    if score > current_score
                        || ((score - current_score).abs() < f64::EPSILON
                            && agent.load() < current_best.load())
                    {
                        Some((agent, score))
                    } else {
                        Some((current_best, current_score))
                    }
                }
            };
        }
        best.map(|(agent, _)| agent.id)
    }
}

/// Priority 5: always applicable; balances load across healthy available
/// agents.
pub struct LoadBalanceRule {
    id: RoutingRuleId,
    enabled: bool,
}

impl LoadBalanceRule {
    /// Fixed evaluation priority for this rule.
    pub const PRIORITY: i32 = 5;

    /// Constructs the rule with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RoutingRuleId::generate(),
            enabled: true,
        }
    }
}

impl Default for LoadBalanceRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingRule for LoadBalanceRule {
    fn id(&self) -> RoutingRuleId {
        self.id
    }

    fn name(&self) -> &str {
        "LoadBalance"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn condition(&self, _task: &Task) -> bool {
        true
    }

    fn select(&self, agents: &[Agent], _task: &Task, ctx: RoutingContext) -> Option<AgentId> {
        healthy_available(agents, ctx)
            .min_by(|a, b| a.load().total_cmp(&b.load()))
            .map(|agent| agent.id)
    }
}

/// Priority 1: always applicable; picks any agent with residual capacity,
/// regardless of health, as a last resort before the task stays pending.
pub struct FallbackRule {
    id: RoutingRuleId,
    enabled: bool,
}

impl FallbackRule {
    /// Fixed evaluation priority for this rule.
    pub const PRIORITY: i32 = 1;

    /// Constructs the rule with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RoutingRuleId::generate(),
            enabled: true,
        }
    }
}

impl Default for FallbackRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingRule for FallbackRule {
    fn id(&self) -> RoutingRuleId {
        self.id
    }

    fn name(&self) -> &str {
        "Fallback"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn condition(&self, _task: &Task) -> bool {
        true
    }

    fn select(&self, agents: &[Agent], _task: &Task, _ctx: RoutingContext) -> Option<AgentId> {
        agents
            .iter()
            .find(|agent| {
                agent.status != AgentStatus::Offline
                    && agent.current_tasks < agent.max_concurrent_tasks.into_inner()
            })
            .map(|agent| agent.id)
    }
}

/// Builds the default rule table in descending priority order
/// (`HighPriority`, `ExactCapabilityMatch`, `LoadBalance`, `Fallback`).
#[must_use]
pub fn default_rules() -> Vec<Box<dyn RoutingRule>> {
    vec![
        Box::new(HighPriorityRule::new()),
        Box::new(ExactCapabilityMatchRule::new()),
        Box::new(LoadBalanceRule::new()),
        Box::new(FallbackRule::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentRegistration;
    use crate::domain::ids::{Capability, ConnectionId, Timestamp};
    use crate::domain::task::{NewTaskRequest, TaskPriority};
    use std::collections::BTreeSet;

    fn agent_with(capabilities: &[&str], current: u32, max: u32) -> Agent {
        let caps = capabilities
            .iter()
            .map(|c| Capability::try_new((*c).to_string()).unwrap())
            .collect::<BTreeSet<_>>();
        let mut agent = Agent::register(
            AgentId::generate(),
            ConnectionId::generate(),
            AgentRegistration {
                name: "a".to_string(),
                version: "1".to_string(),
                capabilities: caps,
                max_concurrent_tasks: super::super::agent::MaxConcurrentTasks::try_new(max)
                    .unwrap(),
                description: None,
                tags: vec![],
            },
        )
        .unwrap();
        agent.current_tasks = current;
        agent
    }

    fn ctx() -> RoutingContext {
        RoutingContext {
            now: Timestamp::now(),
            heartbeat_interval_ms: 30_000,
        }
    }

    #[test]
    fn high_priority_rule_fires_above_threshold() {
        let rule = HighPriorityRule::new();
        let high = Task::try_new(
            crate::domain::ids::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                priority: Some(TaskPriority::try_new(9).unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(rule.condition(&high));

        let agents = vec![agent_with(&[], 0, 2)];
        assert!(rule.select(&agents, &high, ctx()).is_some());
    }

    #[test]
    fn exact_capability_match_requires_all_capabilities() {
        let rule = ExactCapabilityMatchRule::new();
        let mut caps = BTreeSet::new();
        caps.insert(Capability::try_new("x".to_string()).unwrap());
        let task = Task::try_new(
            crate::domain::ids::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                required_capabilities: caps,
                ..Default::default()
            },
        )
        .unwrap();

        let wrong_caps = vec![agent_with(&["y"], 0, 2)];
        assert!(rule.select(&wrong_caps, &task, ctx()).is_none());

        let right_caps = vec![agent_with(&["x"], 0, 2)];
        assert!(rule.select(&right_caps, &task, ctx()).is_some());
    }

    #[test]
    fn load_balance_picks_lowest_load() {
        let rule = LoadBalanceRule::new();
        let busy = agent_with(&[], 1, 2);
        let idle = agent_with(&[], 0, 2);
        let idle_id = idle.id;
        let task = Task::try_new(
            crate::domain::ids::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let chosen = rule.select(&[busy, idle], &task, ctx()).unwrap();
        assert_eq!(chosen, idle_id);
    }

    #[test]
    fn fallback_picks_any_agent_with_residual_capacity() {
        let rule = FallbackRule::new();
        let full = agent_with(&[], 2, 2);
        let has_room = agent_with(&[], 1, 2);
        let has_room_id = has_room.id;
        let task = Task::try_new(
            crate::domain::ids::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let chosen = rule.select(&[full, has_room], &task, ctx()).unwrap();
        assert_eq!(chosen, has_room_id);
    }
}
