//! Agent dispatcher.
//!
//! Owns the in-memory agent registry and the FIFO wait queue, and
//! bridges live callees to agents: least-calls assignment, a mixing
//! bridge dialed to the agent's extension, rollback on bridge failure,
//! a 2-second queue tick draining expired waiters, and the
//! finished-call path with its duplicate-report guard. Supervisor
//! snooping lives in [`spy`].

pub mod agents;
pub mod queue;
pub mod spy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use outdial_ari::AriClient;
use outdial_push::{names, PushEvent, PushHub};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::models::{
    AgentStatus, BreakEndReason, CallEventKind, CampaignId, Contact, ContactId, UserId,
};

use agents::{AgentRegistry, AgentState, ContactDescriptor};
use queue::WaitQueue;
use spy::SpyCoordinator;

/// Maximum wait before a queued caller is dropped
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(300);

/// Queue maintenance cadence
const QUEUE_TICK: Duration = Duration::from_secs(2);

/// Window for dropping duplicate finished-call reports
const FINISHED_DEDUPE_WINDOW: Duration = Duration::from_secs(10);

/// How long the agent's leg may ring before the bridge is abandoned
const AGENT_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a transfer request from the IVR
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// Caller is bridged to an agent
    Bridged { agent_id: UserId },
    /// No agent free; caller waits at `position`
    Queued { position: usize },
}

/// A live bridged agent call, keyed by the caller's channel
struct AgentCallSession {
    agent_id: UserId,
    agent_channel_id: String,
    bridge_id: String,
    contact_id: ContactId,
    campaign_id: CampaignId,
    connected_at: Instant,
}

/// Orchestrates agents, the wait queue, and caller-agent bridges
pub struct AgentDispatcher {
    ari: Arc<AriClient>,
    db: Database,
    hub: Arc<PushHub>,
    agents: AgentRegistry,
    queue: Mutex<WaitQueue>,
    /// In-memory half of the FINISHED dedupe window
    recent_finished: Mutex<HashMap<ContactId, Instant>>,
    /// Agent legs awaiting Stasis entry, keyed by channel id
    pending_agent_legs: DashMap<String, oneshot::Sender<()>>,
    /// Bridged sessions keyed by caller channel id
    sessions: DashMap<String, AgentCallSession>,
    /// Reverse index: agent leg channel id -> caller channel id
    agent_leg_index: DashMap<String, String>,
    spy: SpyCoordinator,
}

impl AgentDispatcher {
    pub fn new(ari: Arc<AriClient>, db: Database, hub: Arc<PushHub>) -> Arc<Self> {
        let spy = SpyCoordinator::new(ari.clone());
        Arc::new(Self {
            ari,
            db,
            hub,
            agents: AgentRegistry::new(),
            queue: Mutex::new(WaitQueue::new()),
            recent_finished: Mutex::new(HashMap::new()),
            pending_agent_legs: DashMap::new(),
            sessions: DashMap::new(),
            agent_leg_index: DashMap::new(),
            spy,
        })
    }

    /// Seed the registry from the user store
    pub async fn load_agents(&self) -> Result<()> {
        let seeds = self.db.load_agent_seeds().await?;
        self.agents.seed(seeds);
        Ok(())
    }

    /// Seed the registry directly (embedding, tests)
    pub fn seed_agents(&self, seeds: Vec<crate::database::agents::AgentSeed>) {
        self.agents.seed(seeds);
    }

    /// Spawn the queue maintenance tick
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(QUEUE_TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => dispatcher.queue_tick().await,
                    _ = shutdown.cancelled() => {
                        info!("Queue tick loop shutting down");
                        return;
                    }
                }
            }
        });
    }

    // === Hub lifecycle ===

    /// First dashboard socket for an agent came up
    pub async fn on_agent_connected(&self, user_id: UserId) {
        let Some(status) = self.agents.on_connected(user_id) else {
            return; // not a call-center agent
        };
        info!("👤 Agent {} connected ({})", user_id, status.as_str());
        self.emit_agent_sync(user_id);
        self.emit_agents_state();
        // A newly available agent may unblock the queue head
        self.try_assign_queue_head().await;
    }

    /// Last dashboard socket for an agent went away
    pub async fn on_agent_disconnected(&self, user_id: UserId) {
        let Some(effect) = self.agents.on_disconnected(user_id) else {
            return;
        };
        info!("👤 Agent {} disconnected", user_id);
        if effect.had_open_break {
            if let Err(e) = self
                .db
                .close_break(user_id, BreakEndReason::Disconnected)
                .await
            {
                error!("Failed to close break for agent {}: {}", user_id, e);
            }
        }
        self.emit_agents_state();
    }

    // === Break operations ===

    /// Agent-initiated break
    pub async fn set_break(&self, user_id: UserId, reason: &str) -> Result<()> {
        self.agents
            .set_break(user_id, reason)
            .ok_or_else(|| EngineError::not_found(format!("agent {}", user_id)))?;
        self.db.open_break(user_id, reason, "AGENT").await?;
        self.emit_agent_sync(user_id);
        self.emit_agents_state();
        Ok(())
    }

    /// Agent returns from break
    pub async fn clear_break(&self, user_id: UserId) -> Result<()> {
        self.agents
            .clear_break(user_id)
            .ok_or_else(|| EngineError::not_found(format!("agent {}", user_id)))?;
        self.db.close_break(user_id, BreakEndReason::Returned).await?;
        self.emit_agent_sync(user_id);
        self.emit_agents_state();
        self.try_assign_queue_head().await;
        Ok(())
    }

    /// Supervisor-forced status change
    pub async fn force_status(
        &self,
        user_id: UserId,
        status: AgentStatus,
        supervisor_id: UserId,
    ) -> Result<()> {
        let previous = self
            .agents
            .force_status(user_id, status)
            .ok_or_else(|| EngineError::not_found(format!("agent {}", user_id)))?;

        if previous == AgentStatus::OnBreak && status != AgentStatus::OnBreak {
            self.db
                .close_break(user_id, BreakEndReason::ForcedBySupervisor)
                .await?;
        } else if previous != AgentStatus::OnBreak && status == AgentStatus::OnBreak {
            self.db.open_break(user_id, "FORCED", "SUPERVISOR").await?;
        }

        self.hub.emit_to_user(
            user_id,
            PushEvent::new(
                names::AGENT_STATUS_FORCED,
                json!({
                    "status": status.as_str(),
                    "by": supervisor_id,
                }),
            ),
        );
        self.emit_agents_state();
        if status == AgentStatus::Available {
            self.try_assign_queue_head().await;
        }
        Ok(())
    }

    // === Transfer and assignment ===

    /// IVR handoff: bridge now if an agent is free, else enqueue.
    pub async fn transfer(&self, contact: &Contact, channel_id: &str) -> Result<TransferOutcome> {
        let descriptor = ContactDescriptor {
            contact_id: contact.id,
            campaign_id: contact.campaign_id,
            phone: contact.phone.clone(),
            channel_id: channel_id.to_string(),
        };

        match self.try_bridge(descriptor.clone()).await {
            Some(agent_id) => Ok(TransferOutcome::Bridged { agent_id }),
            None => {
                let position = self.queue.lock().enqueue(
                    contact.id,
                    contact.campaign_id,
                    &contact.phone,
                    channel_id,
                );
                info!(
                    "⏳ Contact {} queued at position {} (channel {})",
                    contact.id, position, channel_id
                );
                self.emit_queue_state();
                Ok(TransferOutcome::Queued { position })
            }
        }
    }

    /// Reserve the least-busy agent and bridge the caller to it.
    /// `None` when nobody is free or the bridge failed (reservation
    /// rolled back).
    async fn try_bridge(&self, descriptor: ContactDescriptor) -> Option<UserId> {
        let (agent_id, extension) = self.agents.reserve_least_busy(descriptor.clone())?;

        if let Err(e) = self
            .db
            .insert_call_event(
                descriptor.contact_id,
                Some(descriptor.campaign_id),
                Some(agent_id),
                CallEventKind::Assigned,
                None,
            )
            .await
        {
            error!("Failed to log ASSIGNED for contact {}: {}", descriptor.contact_id, e);
        }

        match self.bridge_to_agent(&descriptor, agent_id, &extension).await {
            Ok(()) => {
                if let Err(e) = self
                    .db
                    .insert_call_event(
                        descriptor.contact_id,
                        Some(descriptor.campaign_id),
                        Some(agent_id),
                        CallEventKind::Connected,
                        None,
                    )
                    .await
                {
                    error!(
                        "Failed to log CONNECTED for contact {}: {}",
                        descriptor.contact_id, e
                    );
                }
                self.hub.emit_to_user(
                    agent_id,
                    PushEvent::new(
                        names::AGENT_CALL_INCOMING,
                        json!({
                            "contactId": descriptor.contact_id,
                            "campaignId": descriptor.campaign_id,
                            "phone": descriptor.phone,
                        }),
                    ),
                );
                self.emit_agents_state();
                Some(agent_id)
            }
            Err(e) => {
                warn!(
                    "Bridge to agent {} failed for contact {}: {}",
                    agent_id, descriptor.contact_id, e
                );
                self.agents.rollback_reservation(agent_id);
                self.emit_agents_state();
                None
            }
        }
    }

    /// Mixing bridge: caller channel + a freshly dialed agent leg
    async fn bridge_to_agent(
        &self,
        descriptor: &ContactDescriptor,
        agent_id: UserId,
        extension: &str,
    ) -> Result<()> {
        let bridge_id = self.ari.create_bridge().await?;

        if let Err(e) = self
            .ari
            .add_channel_to_bridge(&bridge_id, &descriptor.channel_id)
            .await
        {
            self.ari.destroy_bridge(&bridge_id).await.ok();
            return Err(e.into());
        }

        let agent_channel_id = Uuid::new_v4().to_string();
        let (answered_tx, answered_rx) = oneshot::channel();
        self.pending_agent_legs
            .insert(agent_channel_id.clone(), answered_tx);

        let endpoint = format!("SIP/{}", extension);
        if let Err(e) = self
            .ari
            .originate(
                &endpoint,
                &descriptor.phone,
                &agent_channel_id,
                AGENT_ANSWER_TIMEOUT.as_secs() as u32,
                HashMap::new(),
            )
            .await
        {
            self.pending_agent_legs.remove(&agent_channel_id);
            self.ari.destroy_bridge(&bridge_id).await.ok();
            return Err(e.into());
        }

        let answered = tokio::time::timeout(AGENT_ANSWER_TIMEOUT, answered_rx)
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !answered {
            self.pending_agent_legs.remove(&agent_channel_id);
            self.ari.hangup(&agent_channel_id).await.ok();
            self.ari.destroy_bridge(&bridge_id).await.ok();
            return Err(EngineError::dispatcher(format!(
                "agent {} did not answer",
                agent_id
            )));
        }

        if let Err(e) = self
            .ari
            .add_channel_to_bridge(&bridge_id, &agent_channel_id)
            .await
        {
            self.ari.hangup(&agent_channel_id).await.ok();
            self.ari.destroy_bridge(&bridge_id).await.ok();
            return Err(e.into());
        }

        self.sessions.insert(
            descriptor.channel_id.clone(),
            AgentCallSession {
                agent_id,
                agent_channel_id: agent_channel_id.clone(),
                bridge_id,
                contact_id: descriptor.contact_id,
                campaign_id: descriptor.campaign_id,
                connected_at: Instant::now(),
            },
        );
        self.agent_leg_index
            .insert(agent_channel_id, descriptor.channel_id.clone());

        info!(
            "🌉 Contact {} bridged to agent {} ({})",
            descriptor.contact_id, agent_id, extension
        );
        Ok(())
    }

    /// Try to hand the queue head to an available agent
    async fn try_assign_queue_head(&self) {
        loop {
            let entry = match self.queue.lock().dequeue_head() {
                Some(entry) => entry,
                None => return,
            };

            let descriptor = ContactDescriptor {
                contact_id: entry.contact_id,
                campaign_id: entry.campaign_id,
                phone: entry.phone.clone(),
                channel_id: entry.channel_id.clone(),
            };

            if self.try_bridge(descriptor).await.is_some() {
                self.emit_queue_state();
                continue; // maybe another agent is free for the next head
            }

            // Nobody free (or the bridge failed): back to the head
            self.queue.lock().push_front(entry);
            self.emit_queue_state();
            return;
        }
    }

    /// 2-second maintenance pass: expire stale waiters, then assign
    async fn queue_tick(&self) {
        let expired = self.queue.lock().drain_expired(
            chrono::Duration::from_std(QUEUE_TIMEOUT).unwrap_or_else(|_| chrono::Duration::seconds(300)),
        );
        for entry in expired {
            warn!(
                "⏰ Contact {} timed out after {}s in queue",
                entry.contact_id,
                QUEUE_TIMEOUT.as_secs()
            );
            self.ari.hangup(&entry.channel_id).await.ok();
            if let Err(e) = self
                .db
                .insert_call_event(
                    entry.contact_id,
                    Some(entry.campaign_id),
                    None,
                    CallEventKind::Timeout,
                    None,
                )
                .await
            {
                error!("Failed to log TIMEOUT for contact {}: {}", entry.contact_id, e);
            }
            self.emit_queue_state();
        }

        self.try_assign_queue_head().await;
    }

    // === Call teardown ===

    /// Router hook: some channel left Stasis or was destroyed.
    ///
    /// Covers a waiting caller hanging up (CLIENT_ABANDONED), a
    /// bridged caller hanging up, and an agent leg hanging up. When
    /// the router knows which contact owned the channel it passes the
    /// id and the queue removal is contact-keyed; otherwise the
    /// channel id is the key.
    pub async fn on_channel_gone(&self, channel_id: &str, contact_id: Option<ContactId>) {
        // Waiting caller abandoned the queue
        let abandoned = {
            let mut queue = self.queue.lock();
            match contact_id {
                Some(contact_id) => queue.remove_by_contact(contact_id),
                None => queue.remove_by_channel(channel_id),
            }
        };
        if let Some(entry) = abandoned {
            info!(
                "🚪 Contact {} abandoned the queue at position {}",
                entry.contact_id, entry.position
            );
            if let Err(e) = self
                .db
                .insert_call_event(
                    entry.contact_id,
                    Some(entry.campaign_id),
                    None,
                    CallEventKind::ClientAbandoned,
                    None,
                )
                .await
            {
                error!(
                    "Failed to log CLIENT_ABANDONED for contact {}: {}",
                    entry.contact_id, e
                );
            }
            self.emit_queue_state();
            return;
        }

        // Bridged caller hung up
        if let Some((_, session)) = self.sessions.remove(channel_id) {
            self.teardown_session(session).await;
            return;
        }

        // Agent leg hung up
        if let Some((_, caller_channel)) = self.agent_leg_index.remove(channel_id) {
            if let Some((_, session)) = self.sessions.remove(&caller_channel) {
                self.ari.hangup(&caller_channel).await.ok();
                self.teardown_session(session).await;
            }
        }
    }

    async fn teardown_session(&self, session: AgentCallSession) {
        self.agent_leg_index.remove(&session.agent_channel_id);
        self.ari.destroy_bridge(&session.bridge_id).await.ok();
        self.ari.hangup(&session.agent_channel_id).await.ok();
        let duration = session.connected_at.elapsed().as_secs() as i64;
        self.on_agent_call_finished(
            session.contact_id,
            session.campaign_id,
            session.agent_id,
            duration,
        )
        .await;
    }

    /// Finished-call bookkeeping with the 10-second dedupe window.
    ///
    /// Duplicate reports (in memory or already persisted) are dropped
    /// silently; no double decrement.
    pub async fn on_agent_call_finished(
        &self,
        contact_id: ContactId,
        campaign_id: CampaignId,
        agent_id: UserId,
        duration_seconds: i64,
    ) {
        {
            let mut recent = self.recent_finished.lock();
            let now = Instant::now();
            recent.retain(|_, seen| now.duration_since(*seen) < FINISHED_DEDUPE_WINDOW);
            if recent.contains_key(&contact_id) {
                debug!("Duplicate finished report for contact {} dropped", contact_id);
                return;
            }
            recent.insert(contact_id, now);
        }

        match self
            .db
            .recent_finished_exists(contact_id, FINISHED_DEDUPE_WINDOW.as_secs() as i64)
            .await
        {
            Ok(true) => {
                debug!(
                    "Persisted finished event for contact {} within window, dropped",
                    contact_id
                );
                return;
            }
            Ok(false) => {}
            Err(e) => error!("Finished dedupe lookup failed for contact {}: {}", contact_id, e),
        }

        self.agents.finish_call(agent_id);

        if let Err(e) = self
            .db
            .insert_call_event(
                contact_id,
                Some(campaign_id),
                Some(agent_id),
                CallEventKind::Finished,
                Some(duration_seconds),
            )
            .await
        {
            error!("Failed to log FINISHED for contact {}: {}", contact_id, e);
        }

        self.hub.emit_to_user(
            agent_id,
            PushEvent::new(
                names::AGENT_CALL_ENDED,
                json!({
                    "contactId": contact_id,
                    "campaignId": campaign_id,
                    "durationSeconds": duration_seconds,
                }),
            ),
        );
        self.emit_agents_state();
    }

    // === Supervisor snoop ===

    /// Listen in on a contact's live call from the supervisor's
    /// extension
    pub async fn spy_call(&self, contact_id: ContactId, supervisor_extension: &str) -> Result<()> {
        let contact = self.db.get_contact(contact_id).await?;
        let channel_id = contact.active_channel_id.ok_or_else(|| {
            EngineError::dispatcher(format!("contact {} has no live channel", contact_id))
        })?;
        self.spy.spy_call(&channel_id, supervisor_extension).await
    }

    /// Router hook for Stasis entry; `true` when the channel was a
    /// pending agent or supervisor leg
    pub async fn on_stasis_start(&self, channel_id: &str) -> bool {
        if let Some((_, answered_tx)) = self.pending_agent_legs.remove(channel_id) {
            let _ = answered_tx.send(());
            return true;
        }
        self.spy.on_stasis_start(channel_id).await
    }

    /// Router hook for destroyed channels that never reached Stasis
    pub fn on_channel_destroyed(&self, channel_id: &str) {
        self.spy.on_channel_destroyed(channel_id);
    }

    /// Router hook for Stasis exit of spy legs
    pub async fn on_spy_leg_end(&self, channel_id: &str) -> bool {
        self.spy.on_stasis_end(channel_id).await
    }

    // === Snapshots ===

    pub fn agents_snapshot(&self) -> Vec<AgentState> {
        self.agents.snapshot()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn queue_snapshot(&self) -> Vec<queue::QueueEntry> {
        self.queue.lock().snapshot()
    }

    pub fn longest_wait_seconds(&self) -> i64 {
        self.queue.lock().longest_wait_seconds()
    }

    pub fn available_agents(&self) -> usize {
        self.agents.available_count()
    }

    pub fn on_call_agents(&self) -> usize {
        self.agents.on_call_count()
    }

    fn emit_agents_state(&self) {
        let agents: Vec<_> = self
            .agents
            .snapshot()
            .iter()
            .map(|a| a.to_json())
            .collect();
        self.hub.emit_to_admins(PushEvent::new(
            names::AGENTS_STATE_UPDATE,
            json!({ "agents": agents }),
        ));
    }

    fn emit_agent_sync(&self, user_id: UserId) {
        if let Some(agent) = self.agents.get(user_id) {
            self.hub.emit_to_user(
                user_id,
                PushEvent::new(names::AGENT_STATUS_SYNC, agent.to_json()),
            );
        }
    }

    fn emit_queue_state(&self) {
        let queue: Vec<_> = self
            .queue
            .lock()
            .snapshot()
            .iter()
            .map(|e| e.to_json())
            .collect();
        self.hub.emit_to_admins(PushEvent::new(
            names::QUEUE_STATE_UPDATE,
            json!({ "queue": queue }),
        ));
    }
}
