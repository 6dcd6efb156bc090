//! Live binding from a task to the agent working it (§3 Assignment).

use serde::{Deserialize, Serialize};

use super::ids::{AgentId, RoutingRuleId, TaskId, Timestamp};

/// A live `(TaskId, AgentId)` binding created by the router when a routing
/// rule selects an agent for a task.
///
/// Cardinality: at most one active assignment per `TaskId`; the number of
/// active assignments per `AgentId` is bounded by that agent's
/// `MaxConcurrentTasks` (I3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// The task being worked.
    pub task_id: TaskId,
    /// The agent working it.
    pub agent_id: AgentId,
    /// The rule whose selector produced this assignment.
    pub routing_rule_id: RoutingRuleId,
    /// When the assignment was created.
    pub assigned_at: Timestamp,
    /// Set once the task reaches a terminal status.
    ///
    /// `actual_duration = completed_at - assigned_at`, per the fixed
    /// duration-accounting convention (§9).
    pub completed_at: Option<Timestamp>,
}

impl Assignment {
    /// Creates a new assignment, timestamped now.
    #[must_use]
    pub fn new(task_id: TaskId, agent_id: AgentId, routing_rule_id: RoutingRuleId) -> Self {
        Self {
            task_id,
            agent_id,
            routing_rule_id,
            assigned_at: Timestamp::now(),
            completed_at: None,
        }
    }

    /// Closes the assignment and returns its actual duration in milliseconds.
    pub fn close(&mut self) -> u64 {
        let now = Timestamp::now();
        self.completed_at = Some(now);
        now.elapsed_ms_since(self.assigned_at)
    }

    /// Actual duration in milliseconds, if the assignment has closed.
    #[must_use]
    pub fn actual_duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|completed| completed.elapsed_ms_since(self.assigned_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actual_duration_uses_assigned_at_not_submission_time() {
        let mut assignment = Assignment::new(
            TaskId::generate(),
            AgentId::generate(),
            RoutingRuleId::generate(),
        );
        assert!(assignment.actual_duration_ms().is_none());
        let duration = assignment.close();
        assert_eq!(assignment.actual_duration_ms(), Some(duration));
    }
}
