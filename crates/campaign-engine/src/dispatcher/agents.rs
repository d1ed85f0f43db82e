//! In-memory agent registry.
//!
//! Holds the live view of every call-center agent: availability,
//! extension, break bookkeeping, and call counters. Seeded from the
//! user store at startup (everyone OFFLINE) and mutated by hub
//! lifecycle events, break operations, and assignment.
//!
//! Status invariant maintained here: `ON_CALL` holds exactly when a
//! current contact is attached and `active_calls >= 1`; `OFFLINE`
//! implies not connected.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::database::agents::AgentSeed;
use crate::models::{AgentStatus, CampaignId, ContactId, UserId};

/// Descriptor of the callee an agent is currently handling
#[derive(Debug, Clone, PartialEq)]
pub struct ContactDescriptor {
    pub contact_id: ContactId,
    pub campaign_id: CampaignId,
    pub phone: String,
    pub channel_id: String,
}

/// Live state of one agent
#[derive(Debug, Clone)]
pub struct AgentState {
    pub user_id: UserId,
    pub name: String,
    pub extension: String,
    pub status: AgentStatus,
    pub connected: bool,
    pub break_reason: Option<String>,
    pub break_started_at: Option<DateTime<Utc>>,
    pub active_calls: u32,
    pub total_calls_today: u32,
    pub current_contact: Option<ContactDescriptor>,
}

impl AgentState {
    fn from_seed(seed: AgentSeed) -> Self {
        Self {
            user_id: seed.user_id,
            name: seed.name,
            extension: seed.extension,
            status: AgentStatus::Offline,
            connected: false,
            break_reason: None,
            break_started_at: None,
            active_calls: 0,
            total_calls_today: 0,
            current_contact: None,
        }
    }

    /// Dashboard projection of this agent
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "userId": self.user_id,
            "name": self.name,
            "extension": self.extension,
            "status": self.status.as_str(),
            "connected": self.connected,
            "breakReason": self.break_reason,
            "activeCalls": self.active_calls,
            "totalCallsToday": self.total_calls_today,
            "currentContact": self.current_contact.as_ref().map(|c| json!({
                "contactId": c.contact_id,
                "campaignId": c.campaign_id,
                "phone": c.phone,
            })),
        })
    }
}

/// What a disconnect changed, for break-history persistence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisconnectEffect {
    pub had_open_break: bool,
}

/// Registry of agents keyed by user id, with first-seen ordering for
/// assignment tie-breaks
pub struct AgentRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    agents: HashMap<UserId, AgentState>,
    /// Seed/registration order; least-calls ties resolve to the
    /// earliest entry
    order: Vec<UserId>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                agents: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Load agents from the user store; everyone starts OFFLINE
    pub fn seed(&self, seeds: Vec<AgentSeed>) {
        let mut inner = self.inner.lock();
        for seed in seeds {
            let user_id = seed.user_id;
            if !inner.agents.contains_key(&user_id) {
                inner.order.push(user_id);
                inner.agents.insert(user_id, AgentState::from_seed(seed));
            }
        }
        info!("👥 Agent registry seeded with {} agents", inner.order.len());
    }

    /// First socket for the agent came up.
    ///
    /// OFFLINE becomes AVAILABLE, or ON_BREAK when a break reason is
    /// still set. Reconnects never clobber ON_CALL.
    pub fn on_connected(&self, user_id: UserId) -> Option<AgentStatus> {
        let mut inner = self.inner.lock();
        let agent = inner.agents.get_mut(&user_id)?;
        agent.connected = true;
        if agent.status == AgentStatus::Offline {
            agent.status = if agent.break_reason.is_some() {
                AgentStatus::OnBreak
            } else {
                AgentStatus::Available
            };
        }
        Some(agent.status)
    }

    /// Last socket for the agent went away
    pub fn on_disconnected(&self, user_id: UserId) -> Option<DisconnectEffect> {
        let mut inner = self.inner.lock();
        let agent = inner.agents.get_mut(&user_id)?;
        agent.connected = false;
        let had_open_break = agent.status == AgentStatus::OnBreak;
        agent.status = AgentStatus::Offline;
        agent.break_reason = None;
        agent.break_started_at = None;
        Some(DisconnectEffect { had_open_break })
    }

    /// Least-calls assignment: among connected AVAILABLE agents, pick
    /// the one with the fewest calls today (first-seen wins ties) and
    /// atomically reserve it for `contact`.
    pub fn reserve_least_busy(&self, contact: ContactDescriptor) -> Option<(UserId, String)> {
        let mut inner = self.inner.lock();

        let mut best: Option<UserId> = None;
        let mut best_calls = u32::MAX;
        for user_id in &inner.order {
            if let Some(agent) = inner.agents.get(user_id) {
                if agent.connected
                    && agent.status == AgentStatus::Available
                    && agent.total_calls_today < best_calls
                {
                    best = Some(*user_id);
                    best_calls = agent.total_calls_today;
                }
            }
        }

        let user_id = best?;
        let agent = inner.agents.get_mut(&user_id)?;
        agent.status = AgentStatus::OnCall;
        agent.active_calls += 1;
        agent.total_calls_today += 1;
        agent.current_contact = Some(contact);
        Some((user_id, agent.extension.clone()))
    }

    /// Undo a reservation after a failed bridge
    pub fn rollback_reservation(&self, user_id: UserId) {
        let mut inner = self.inner.lock();
        if let Some(agent) = inner.agents.get_mut(&user_id) {
            agent.status = if agent.connected {
                AgentStatus::Available
            } else {
                AgentStatus::Offline
            };
            agent.active_calls = agent.active_calls.saturating_sub(1);
            agent.total_calls_today = agent.total_calls_today.saturating_sub(1);
            agent.current_contact = None;
        }
    }

    /// Agent finished a call: back to AVAILABLE (or OFFLINE when the
    /// socket is already gone)
    pub fn finish_call(&self, user_id: UserId) -> Option<AgentStatus> {
        let mut inner = self.inner.lock();
        let agent = inner.agents.get_mut(&user_id)?;
        if agent.status != AgentStatus::OnCall {
            warn!("Agent {} finished a call while {:?}", user_id, agent.status);
        }
        agent.active_calls = agent.active_calls.saturating_sub(1);
        agent.current_contact = None;
        agent.status = if agent.connected {
            AgentStatus::Available
        } else {
            AgentStatus::Offline
        };
        Some(agent.status)
    }

    /// Agent-initiated break
    pub fn set_break(&self, user_id: UserId, reason: &str) -> Option<()> {
        let mut inner = self.inner.lock();
        let agent = inner.agents.get_mut(&user_id)?;
        agent.status = AgentStatus::OnBreak;
        agent.break_reason = Some(reason.to_string());
        agent.break_started_at = Some(Utc::now());
        Some(())
    }

    /// Agent returned from break
    pub fn clear_break(&self, user_id: UserId) -> Option<()> {
        let mut inner = self.inner.lock();
        let agent = inner.agents.get_mut(&user_id)?;
        agent.break_reason = None;
        agent.break_started_at = None;
        if agent.status == AgentStatus::OnBreak {
            agent.status = if agent.connected {
                AgentStatus::Available
            } else {
                AgentStatus::Offline
            };
        }
        Some(())
    }

    /// Supervisor-forced status change; returns the previous status
    pub fn force_status(&self, user_id: UserId, status: AgentStatus) -> Option<AgentStatus> {
        let mut inner = self.inner.lock();
        let agent = inner.agents.get_mut(&user_id)?;
        let previous = agent.status;
        agent.status = status;
        if status != AgentStatus::OnBreak {
            agent.break_reason = None;
            agent.break_started_at = None;
        } else if agent.break_reason.is_none() {
            agent.break_reason = Some("FORCED".to_string());
            agent.break_started_at = Some(Utc::now());
        }
        Some(previous)
    }

    pub fn get(&self, user_id: UserId) -> Option<AgentState> {
        self.inner.lock().agents.get(&user_id).cloned()
    }

    /// Snapshot in first-seen order, for `agents-state-update`
    pub fn snapshot(&self) -> Vec<AgentState> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.agents.get(id).cloned())
            .collect()
    }

    /// Count of connected AVAILABLE agents
    pub fn available_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .agents
            .values()
            .filter(|a| a.connected && a.status == AgentStatus::Available)
            .count()
    }

    /// Count of agents currently ON_CALL
    pub fn on_call_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::OnCall)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(user_id: UserId, extension: &str) -> AgentSeed {
        AgentSeed {
            user_id,
            name: format!("agent-{}", user_id),
            extension: extension.to_string(),
        }
    }

    fn descriptor(contact_id: ContactId) -> ContactDescriptor {
        ContactDescriptor {
            contact_id,
            campaign_id: 1,
            phone: "0999".to_string(),
            channel_id: format!("ch-{}", contact_id),
        }
    }

    fn registry_with_connected(ids: &[UserId]) -> AgentRegistry {
        let registry = AgentRegistry::new();
        registry.seed(ids.iter().map(|id| seed(*id, "1000")).collect());
        for id in ids {
            registry.on_connected(*id);
        }
        registry
    }

    #[test]
    fn seeded_agents_start_offline() {
        let registry = AgentRegistry::new();
        registry.seed(vec![seed(1, "1001")]);
        let agent = registry.get(1).unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(!agent.connected);
    }

    #[test]
    fn connect_respects_pending_break() {
        let registry = AgentRegistry::new();
        registry.seed(vec![seed(1, "1001")]);
        registry.on_connected(1);
        registry.set_break(1, "lunch");
        registry.on_disconnected(1);

        // Break reason was cleared by the disconnect close-out
        assert_eq!(registry.on_connected(1), Some(AgentStatus::Available));
    }

    #[test]
    fn reconnect_never_clobbers_on_call() {
        let registry = registry_with_connected(&[1]);
        registry.reserve_least_busy(descriptor(5)).unwrap();
        assert_eq!(registry.on_connected(1), Some(AgentStatus::OnCall));
    }

    #[test]
    fn least_calls_pick_with_first_seen_tie_break() {
        let registry = registry_with_connected(&[1, 2, 3]);

        // Tie at zero calls: first-seen agent 1 wins
        let (first, _) = registry.reserve_least_busy(descriptor(10)).unwrap();
        assert_eq!(first, 1);
        registry.finish_call(1);

        // Agent 1 now has 1 call today; 2 and 3 tie at zero, 2 wins
        let (second, _) = registry.reserve_least_busy(descriptor(11)).unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn reservation_sets_on_call_invariant() {
        let registry = registry_with_connected(&[1]);
        registry.reserve_least_busy(descriptor(5)).unwrap();

        let agent = registry.get(1).unwrap();
        assert_eq!(agent.status, AgentStatus::OnCall);
        assert!(agent.active_calls >= 1);
        assert!(agent.current_contact.is_some());

        // Nobody else is available now
        assert!(registry.reserve_least_busy(descriptor(6)).is_none());
    }

    #[test]
    fn rollback_restores_availability_and_counters() {
        let registry = registry_with_connected(&[1]);
        registry.reserve_least_busy(descriptor(5)).unwrap();
        registry.rollback_reservation(1);

        let agent = registry.get(1).unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert_eq!(agent.active_calls, 0);
        assert_eq!(agent.total_calls_today, 0);
        assert!(agent.current_contact.is_none());
    }

    #[test]
    fn finish_call_when_disconnected_goes_offline() {
        let registry = registry_with_connected(&[1]);
        registry.reserve_least_busy(descriptor(5)).unwrap();
        registry.on_disconnected(1);

        assert_eq!(registry.finish_call(1), Some(AgentStatus::Offline));
        let agent = registry.get(1).unwrap();
        assert_eq!(agent.active_calls, 0);
        assert!(agent.current_contact.is_none());
    }

    #[test]
    fn disconnect_reports_open_break() {
        let registry = registry_with_connected(&[1]);
        registry.set_break(1, "lunch");
        let effect = registry.on_disconnected(1).unwrap();
        assert!(effect.had_open_break);
        assert_eq!(registry.get(1).unwrap().status, AgentStatus::Offline);
    }

    #[test]
    fn offline_agents_are_never_picked() {
        let registry = AgentRegistry::new();
        registry.seed(vec![seed(1, "1001")]);
        assert!(registry.reserve_least_busy(descriptor(5)).is_none());
    }
}
