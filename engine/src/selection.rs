//! Agent selection for unassigned work.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use mesh_core::error::{MeshError, Result};
use mesh_core::models::AgentProfile;

/// How a concrete agent is picked from the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    RoundRobin,
    LeastLoaded,
    Random,
    /// Most capability overlap with the requirement wins
    CapabilityMatch,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::LeastLoaded
    }
}

/// Restrictions applied before the policy picks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    /// Candidates must declare all of these
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Tried first when any of them qualify
    #[serde(default)]
    pub preferred: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Stateful selector; the round-robin cursor survives across calls.
#[derive(Debug, Default)]
pub struct AgentSelector {
    cursor: AtomicUsize,
}

impl AgentSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one agent id from `agents`.
    ///
    /// Candidates must be available, declare the required capabilities,
    /// and not be excluded. Preferred agents that qualify are chosen ahead
    /// of the rest.
    pub fn select(
        &self,
        agents: &[AgentProfile],
        policy: SelectionPolicy,
        criteria: &SelectionCriteria,
    ) -> Result<String> {
        let mut candidates: Vec<&AgentProfile> = agents
            .iter()
            .filter(|a| {
                a.is_available()
                    && a.has_capabilities(&criteria.required_capabilities)
                    && !criteria.exclude.contains(&a.agent_id)
            })
            .collect();
        candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        if candidates.is_empty() {
            return Err(MeshError::ServiceUnavailable {
                retry_after_secs: 5,
            });
        }

        let preferred: Vec<&AgentProfile> = candidates
            .iter()
            .filter(|a| criteria.preferred.contains(&a.agent_id))
            .copied()
            .collect();
        let pool = if preferred.is_empty() {
            candidates
        } else {
            preferred
        };

        let chosen = match policy {
            SelectionPolicy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
                pool[index]
            }
            SelectionPolicy::LeastLoaded => pool
                .iter()
                .min_by_key(|a| (a.active_tasks, a.agent_id.clone()))
                .copied()
                .unwrap_or(pool[0]),
            SelectionPolicy::Random => pool
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(pool[0]),
            SelectionPolicy::CapabilityMatch => pool
                .iter()
                .max_by_key(|a| {
                    let overlap = criteria
                        .required_capabilities
                        .iter()
                        .filter(|c| a.capabilities.contains(c))
                        .count();
                    // Tie-break toward fewer declared capabilities so the
                    // most specialized agent wins, then stable by id.
                    (
                        overlap,
                        std::cmp::Reverse(a.capabilities.len()),
                        std::cmp::Reverse(a.agent_id.clone()),
                    )
                })
                .copied()
                .unwrap_or(pool[0]),
        };
        Ok(chosen.agent_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, caps: &[&str], load: u32) -> AgentProfile {
        let mut a = AgentProfile::new(id, "t1")
            .with_capabilities(caps.iter().map(|c| c.to_string()).collect());
        a.active_tasks = load;
        a
    }

    #[test]
    fn test_least_loaded() {
        let agents = vec![agent("a1", &[], 5), agent("a2", &[], 1), agent("a3", &[], 3)];
        let selector = AgentSelector::new();
        let chosen = selector
            .select(&agents, SelectionPolicy::LeastLoaded, &Default::default())
            .unwrap();
        assert_eq!(chosen, "a2");
    }

    #[test]
    fn test_round_robin_cycles() {
        let agents = vec![agent("a1", &[], 0), agent("a2", &[], 0)];
        let selector = AgentSelector::new();
        let first = selector
            .select(&agents, SelectionPolicy::RoundRobin, &Default::default())
            .unwrap();
        let second = selector
            .select(&agents, SelectionPolicy::RoundRobin, &Default::default())
            .unwrap();
        let third = selector
            .select(&agents, SelectionPolicy::RoundRobin, &Default::default())
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_capability_filter() {
        let agents = vec![agent("a1", &["rust"], 0), agent("a2", &["python"], 0)];
        let selector = AgentSelector::new();
        let criteria = SelectionCriteria {
            required_capabilities: vec!["rust".into()],
            ..Default::default()
        };
        let chosen = selector
            .select(&agents, SelectionPolicy::LeastLoaded, &criteria)
            .unwrap();
        assert_eq!(chosen, "a1");
    }

    #[test]
    fn test_exclude_and_preferred() {
        let agents = vec![agent("a1", &[], 0), agent("a2", &[], 9), agent("a3", &[], 0)];
        let selector = AgentSelector::new();

        let criteria = SelectionCriteria {
            exclude: vec!["a1".into()],
            preferred: vec!["a2".into()],
            ..Default::default()
        };
        // a2 is preferred even though a3 carries less load.
        let chosen = selector
            .select(&agents, SelectionPolicy::LeastLoaded, &criteria)
            .unwrap();
        assert_eq!(chosen, "a2");
    }

    #[test]
    fn test_no_candidates_is_unavailable() {
        let mut offline = agent("a1", &[], 0);
        offline.status = mesh_core::models::AgentStatus::Offline;
        let selector = AgentSelector::new();
        let err = selector
            .select(&[offline], SelectionPolicy::Random, &Default::default())
            .unwrap_err();
        assert!(matches!(err, MeshError::ServiceUnavailable { .. }));
    }

    #[test]
    fn test_capability_match_prefers_specialist() {
        let agents = vec![
            agent("generalist", &["rust", "python", "go", "review"], 0),
            agent("specialist", &["rust", "review"], 0),
        ];
        let selector = AgentSelector::new();
        let criteria = SelectionCriteria {
            required_capabilities: vec!["rust".into(), "review".into()],
            ..Default::default()
        };
        let chosen = selector
            .select(&agents, SelectionPolicy::CapabilityMatch, &criteria)
            .unwrap();
        assert_eq!(chosen, "specialist");
    }
}
