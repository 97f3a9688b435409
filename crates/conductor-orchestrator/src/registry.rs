use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult, Parameters};
use conductor_security::CapabilitySet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Contract every pluggable worker satisfies.
///
/// Agents are owned by the caller. The registry only keeps a weak handle,
/// so dropping the last `Arc` retires the agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable unique identifier.
    fn id(&self) -> &str;

    /// Human-readable name; also the secondary tie-break key.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &CapabilitySet;

    /// Run one task. Transient failures should be reported as
    /// `Resource`/`Timeout` (or `AgentExecution` with that kind) so the
    /// engine can retry them.
    async fn execute(
        &self,
        task_id: &str,
        parameters: &Parameters,
    ) -> ConductorResult<serde_json::Value>;
}

struct AgentEntry {
    agent: Weak<dyn Agent>,
    name: String,
    capabilities: CapabilitySet,
    live: bool,
    /// Sequence number of the most recent selection; `None` if never chosen.
    last_selected: Option<u64>,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentEntry>,
    selection_seq: u64,
}

impl RegistryState {
    /// Live, reachable agents covering `required`, in tie-break order:
    /// least recently selected, then name, then id.
    fn eligible(&self, required: &CapabilitySet) -> Vec<(&str, Arc<dyn Agent>)> {
        let mut matches: Vec<(&str, &AgentEntry, Arc<dyn Agent>)> = self
            .agents
            .iter()
            .filter(|(_, e)| e.live && e.capabilities.satisfies(required))
            .filter_map(|(id, e)| e.agent.upgrade().map(|a| (id.as_str(), e, a)))
            .collect();
        matches.sort_by(|(id_a, a, _), (id_b, b, _)| {
            a.last_selected
                .cmp(&b.last_selected)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| id_a.cmp(id_b))
        });
        matches.into_iter().map(|(id, _, a)| (id, a)).collect()
    }

    fn prune_dropped(&mut self) {
        self.agents.retain(|id, e| {
            let alive = e.agent.strong_count() > 0;
            if !alive {
                debug!(agent = %id, "Pruning dropped agent");
            }
            alive
        });
    }
}

/// Index of which agents can run which capabilities.
///
/// Lookups and mutations share one lock, so a lookup always sees a single
/// consistent agent set: once `deregister` returns, no later `find` or
/// `select` can hand out that agent.
#[derive(Default)]
pub struct CapabilityRegistry {
    state: RwLock<RegistryState>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) an agent, live by default.
    pub fn register(&self, agent: &Arc<dyn Agent>) -> ConductorResult<()> {
        let id = agent.id();
        if id.trim().is_empty() {
            return Err(ConductorError::Validation("agent id must not be empty".into()));
        }
        if id.trim() != id {
            return Err(ConductorError::Validation(format!(
                "agent id '{id}' has leading or trailing whitespace"
            )));
        }
        if agent.capabilities().is_empty() {
            warn!(agent = %id, "Registering agent without capabilities");
        }

        let mut state = self.state.write();
        state.prune_dropped();
        let last_selected = state.agents.get(id).and_then(|e| e.last_selected);
        state.agents.insert(
            id.to_string(),
            AgentEntry {
                agent: Arc::downgrade(agent),
                name: agent.name().to_string(),
                capabilities: agent.capabilities().clone(),
                live: true,
                last_selected,
            },
        );
        info!(
            agent = %id,
            name = %agent.name(),
            capabilities = ?agent.capabilities().to_vec(),
            "Registered agent"
        );
        Ok(())
    }

    /// Remove an agent. Returns `false` if it was not registered.
    pub fn deregister(&self, agent_id: &str) -> bool {
        let mut state = self.state.write();
        state.prune_dropped();
        let removed = state.agents.remove(agent_id).is_some();
        if removed {
            info!(agent = %agent_id, "Deregistered agent");
        }
        removed
    }

    /// Flip an agent's liveness flag. Non-live agents are never eligible.
    pub fn set_live(&self, agent_id: &str, live: bool) -> bool {
        let mut state = self.state.write();
        match state.agents.get_mut(agent_id) {
            Some(entry) => {
                entry.live = live;
                info!(agent = %agent_id, live, "Agent liveness changed");
                true
            }
            None => false,
        }
    }

    /// Eligible agents in tie-break order, without recording a selection.
    pub fn find(&self, required: &CapabilitySet) -> Vec<Arc<dyn Agent>> {
        let state = self.state.read();
        state
            .eligible(required)
            .into_iter()
            .map(|(_, agent)| agent)
            .collect()
    }

    /// Pick the first eligible agent and record the selection, so the next
    /// call with the same requirement prefers a different agent.
    pub fn select(&self, required: &CapabilitySet) -> Option<Arc<dyn Agent>> {
        let mut state = self.state.write();
        let (id, agent) = {
            let (id, agent) = state.eligible(required).into_iter().next()?;
            (id.to_string(), agent)
        };
        state.selection_seq += 1;
        let seq = state.selection_seq;
        if let Some(entry) = state.agents.get_mut(&id) {
            entry.last_selected = Some(seq);
        }
        Some(agent)
    }

    /// Like [`select`](Self::select) but reports an empty result as an error.
    pub fn resolve(
        &self,
        task_id: &str,
        required: &CapabilitySet,
    ) -> ConductorResult<Arc<dyn Agent>> {
        self.select(required)
            .ok_or_else(|| ConductorError::NoCapableAgent {
                task_id: task_id.to_string(),
                required: required.to_vec(),
            })
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.state.read().agents.contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
