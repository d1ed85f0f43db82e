//! Engine wiring and the ARI event router.
//!
//! [`OutdialEngine`] constructs every subsystem, runs startup
//! recovery (zombie sweep + budget recompute), and routes the
//! telephony event firehose:
//!
//! - `StasisStart`: pending agent/supervisor legs resume their
//!   waiters; answered campaign channels enter the message-playback +
//!   post-call-IVR flow
//! - `StasisEnd`: queue removal / bridge teardown, and the terminal
//!   SUCCESS persistence for answered contacts (the slot releases only
//!   here, on real hangup)
//! - `ChannelDestroyed`: the Q.850 cause is parked on the channel
//!   flags for the `StasisEnd` persistence
//! - `Connected` (pump reconnect): orphaned in-flight calls are swept

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use outdial_ari::{AriClient, AriConfig, AriEvent};
use outdial_push::{names, HubLifecycle, PushEvent, PushHub};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::database::campaigns::NewCampaign;
use crate::database::Database;
use crate::dispatcher::AgentDispatcher;
use crate::error::{EngineError, Result};
use crate::executor::causes::hangup_cause_text;
use crate::executor::{CallExecutor, ChannelRegistry};
use crate::ivr::MenuRunner;
use crate::models::{Campaign, CampaignId, CampaignStatus, ContactId, PostCallMenu, UserId};
use crate::monitor::StatsMonitor;
use crate::scheduler::CampaignScheduler;
use crate::tts::TtsEngine;

/// Dashboard snapshot of the engine
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub running_campaigns: i64,
    pub calling_contacts: i64,
    pub queued_calls: usize,
    pub available_agents: usize,
    pub on_call_agents: usize,
}

/// Top-level orchestrator owning every subsystem
pub struct OutdialEngine {
    config: EngineConfig,
    db: Database,
    ari: Arc<AriClient>,
    tts: Arc<TtsEngine>,
    hub: Arc<PushHub>,
    channels: Arc<ChannelRegistry>,
    scheduler: Arc<CampaignScheduler>,
    dispatcher: Arc<AgentDispatcher>,
    menu_runner: Arc<MenuRunner>,
    /// Set once the control plane connected; later connects are
    /// reconnects and trigger the orphan sweep
    control_plane_seen: AtomicBool,
    shutdown: CancellationToken,
}

impl OutdialEngine {
    /// Construct the engine and connect its collaborators.
    ///
    /// Does not start any background work; call [`start`](Self::start).
    pub async fn new(config: EngineConfig) -> Result<Arc<Self>> {
        info!("🚀 Creating outdial engine");
        let shutdown = CancellationToken::new();

        let db = Database::connect(&config.database).await?;
        let hub = PushHub::new();

        let ari = AriClient::connect(
            AriConfig {
                base_url: config.ari.url.clone(),
                username: config.ari.username.clone(),
                password: config.ari.password.clone(),
                app_name: config.ari.app_name.clone(),
            },
            shutdown.clone(),
        )?;

        let tts = Arc::new(TtsEngine::new(config.tts_url.clone())?);
        let channels = Arc::new(ChannelRegistry::new());

        let (poke_tx, poke_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(CallExecutor::new(
            ari.clone(),
            tts.clone(),
            db.clone(),
            hub.clone(),
            channels.clone(),
            poke_tx.clone(),
            config.trunks.clone(),
            config.caller_id.clone(),
        ));
        let scheduler = CampaignScheduler::new(db.clone(), executor, poke_tx, poke_rx);
        let dispatcher = AgentDispatcher::new(ari.clone(), db.clone(), hub.clone());
        let menu_runner = Arc::new(MenuRunner::new(
            ari.clone(),
            tts.clone(),
            db.clone(),
            dispatcher.clone(),
            hub.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            db,
            ari,
            tts,
            hub,
            channels,
            scheduler,
            dispatcher,
            menu_runner,
            control_plane_seen: AtomicBool::new(false),
            shutdown,
        }))
    }

    /// Run startup recovery and spawn all background loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.startup_recovery().await?;
        self.dispatcher.load_agents().await?;

        self.scheduler.start(self.shutdown.clone());
        self.dispatcher.start(self.shutdown.clone());
        StatsMonitor::new(self.db.clone(), self.dispatcher.clone(), self.hub.clone())
            .start(self.shutdown.clone());
        self.spawn_event_router();
        self.spawn_hub_lifecycle();

        info!("✅ Engine started");
        Ok(())
    }

    /// Sweep zombies and correct budget drift.
    ///
    /// A contact persisted as CALLING without a live engine cannot be
    /// driven anymore; it fails with the SYSTEM_RESTART cause and the
    /// per-user budgets are recomputed from non-terminal campaigns.
    async fn startup_recovery(&self) -> Result<()> {
        self.db.sweep_zombie_contacts().await?;
        self.db.recompute_all_budgets().await?;
        Ok(())
    }

    /// Cancel all background work
    pub fn stop(&self) {
        info!("🛑 Engine stopping");
        self.shutdown.cancel();
    }

    pub fn hub(&self) -> &Arc<PushHub> {
        &self.hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn dispatcher(&self) -> &Arc<AgentDispatcher> {
        &self.dispatcher
    }

    fn spawn_event_router(self: &Arc<Self>) {
        let engine = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut events = engine.ari.events();
            loop {
                let event = tokio::select! {
                    e = events.recv() => e,
                    _ = shutdown.cancelled() => {
                        info!("Event router shutting down");
                        return;
                    }
                };
                match event {
                    Ok(event) => engine.route_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event router lagged {} events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn spawn_hub_lifecycle(self: &Arc<Self>) {
        let Some(mut lifecycle) = self.hub.lifecycle_events() else {
            warn!("Hub lifecycle stream already consumed");
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    e = lifecycle.recv() => match e {
                        Some(e) => e,
                        None => return,
                    },
                    _ = shutdown.cancelled() => return,
                };
                match event {
                    HubLifecycle::Connected { user_id } => {
                        dispatcher.on_agent_connected(user_id).await
                    }
                    HubLifecycle::Disconnected { user_id } => {
                        dispatcher.on_agent_disconnected(user_id).await
                    }
                }
            }
        });
    }

    async fn route_event(self: &Arc<Self>, event: AriEvent) {
        match event {
            AriEvent::Connected => {
                // Startup recovery covers the first connect; a later
                // one means the control channel was lost and every
                // in-flight call with it
                if self.control_plane_seen.swap(true, Ordering::SeqCst) {
                    info!("🔌 Control plane reconnected, sweeping orphans");
                    self.channels.clear();
                    if let Err(e) = self.db.sweep_zombie_contacts().await {
                        error!("Zombie sweep failed: {}", e);
                    }
                } else {
                    info!("🔌 Control plane connected");
                }
            }
            AriEvent::StasisStart { channel, .. } => {
                self.on_stasis_start(&channel.id).await;
            }
            AriEvent::StasisEnd { channel } => {
                self.on_stasis_end(&channel.id).await;
            }
            AriEvent::ChannelDestroyed { channel, cause, .. } => {
                self.channels.set_destroy_cause(&channel.id, cause);
                self.dispatcher.on_channel_destroyed(&channel.id);
                // A destroyed channel that never reached Stasis ends a
                // queued wait or a bridge the same way a StasisEnd does
                self.dispatcher.on_channel_gone(&channel.id, None).await;
            }
            _ => {}
        }
    }

    async fn on_stasis_start(self: &Arc<Self>, channel_id: &str) {
        // Agent and supervisor legs are resumed by their waiters
        if self.dispatcher.on_stasis_start(channel_id).await {
            return;
        }

        // Answered campaign callee: play the message, then the menu
        if let Some(flags) = self.channels.get(channel_id) {
            let engine = self.clone();
            let channel_id = channel_id.to_string();
            tokio::spawn(async move {
                let contact = match engine.db.get_contact(flags.contact_id).await {
                    Ok(contact) => contact,
                    Err(e) => {
                        error!("Contact {} not loadable for IVR: {}", flags.contact_id, e);
                        engine.ari.hangup(&channel_id).await.ok();
                        return;
                    }
                };
                if let Err(e) = engine.menu_runner.run_call_flow(&channel_id, &contact).await {
                    error!(
                        "Call flow failed on channel {} (contact {}): {}",
                        channel_id, contact.id, e
                    );
                    engine.ari.hangup(&channel_id).await.ok();
                }
            });
            return;
        }

        // Unknown channel: a spy leg from a previous process instance
        // carries the tag variable and must not stay up
        match self.ari.get_variable(channel_id, "SPY_LEG").await {
            Ok(value) if value == "true" => {
                warn!("Hanging up stray supervisor leg {}", channel_id);
                self.ari.hangup(channel_id).await.ok();
            }
            _ => {
                debug!("StasisStart for unknown channel {}", channel_id);
            }
        }
    }

    async fn on_stasis_end(self: &Arc<Self>, channel_id: &str) {
        let flags = self.channels.remove(channel_id);
        self.dispatcher
            .on_channel_gone(channel_id, flags.as_ref().map(|f| f.contact_id))
            .await;
        self.dispatcher.on_spy_leg_end(channel_id).await;

        // Terminal persistence for answered campaign calls happens
        // here, on real hangup. A channel only reaches Stasis once it
        // answered, so any StasisEnd on a registry channel is the end
        // of an answered call, whether or not the executor task has
        // caught up with the answer event yet.
        let Some(flags) = flags else {
            self.finish_untracked_channel(channel_id).await;
            return;
        };

        let cause = flags.destroy_cause.unwrap_or(16);
        let cause_text = hangup_cause_text(cause);
        match self
            .db
            .mark_contact_success(flags.contact_id, &cause.to_string(), &cause_text)
            .await
        {
            Ok(true) => {
                info!(
                    "📴 Contact {} finished successfully (cause {})",
                    flags.contact_id, cause
                );
                let data = json!({
                    "contactId": flags.contact_id,
                    "campaignId": flags.campaign_id,
                    "status": "SUCCESS",
                });
                self.hub.emit_to_user(
                    flags.owner_id,
                    PushEvent::new(names::CALL_FINISHED, data.clone()),
                );
                self.hub
                    .emit_to_admins(PushEvent::new(names::CALL_FINISHED, data));
            }
            Ok(false) => {
                debug!(
                    "Contact {} already terminal at StasisEnd",
                    flags.contact_id
                );
            }
            Err(e) => {
                error!(
                    "Failed to persist success for contact {}: {}",
                    flags.contact_id, e
                );
            }
        }

        // The slot is free; let the scheduler refill it
        let _ = self.scheduler.poke_handle().send(flags.campaign_id);
    }

    /// StasisEnd for a channel the registry lost (e.g. a pump outage
    /// cleared it before the sweep landed). The store still knows
    /// which contact owned the channel, so the answered call is
    /// persisted instead of waiting for the next zombie sweep.
    async fn finish_untracked_channel(self: &Arc<Self>, channel_id: &str) {
        let contact = match self.db.find_contact_by_channel(channel_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => return,
            Err(e) => {
                error!("Lookup of untracked channel {} failed: {}", channel_id, e);
                return;
            }
        };

        match self
            .db
            .mark_contact_success(contact.id, "16", &hangup_cause_text(16))
            .await
        {
            Ok(true) => {
                info!(
                    "📴 Contact {} finished on untracked channel {}",
                    contact.id, channel_id
                );
                let data = json!({
                    "contactId": contact.id,
                    "campaignId": contact.campaign_id,
                    "status": "SUCCESS",
                });
                if let Ok(campaign) = self.db.get_campaign(contact.campaign_id).await {
                    self.hub.emit_to_user(
                        campaign.user_id,
                        PushEvent::new(names::CALL_FINISHED, data.clone()),
                    );
                }
                self.hub
                    .emit_to_admins(PushEvent::new(names::CALL_FINISHED, data));
                let _ = self.scheduler.poke_handle().send(contact.campaign_id);
            }
            Ok(false) => {}
            Err(e) => {
                error!(
                    "Failed to persist success for contact {} on untracked channel: {}",
                    contact.id, e
                );
            }
        }
    }

    // === Campaign control surface (called by the HTTP layer) ===

    /// Create a campaign, reserving its channel budget
    pub async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        self.db.create_campaign(new).await
    }

    /// Pause a SCHEDULED/RUNNING campaign
    pub async fn pause_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        let campaign = self.db.get_campaign(campaign_id).await?;
        match campaign.status {
            CampaignStatus::Scheduled | CampaignStatus::Running => {
                self.db
                    .set_campaign_status(campaign_id, CampaignStatus::Paused)
                    .await
            }
            other => Err(EngineError::invalid_input(format!(
                "cannot pause a {} campaign",
                other.as_str()
            ))),
        }
    }

    /// Resume a PAUSED campaign into its window
    pub async fn resume_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        let campaign = self.db.get_campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(EngineError::invalid_input(format!(
                "cannot resume a {} campaign",
                campaign.status.as_str()
            )));
        }
        let now = chrono::Local::now().naive_local();
        let next = if campaign.in_window(now) {
            CampaignStatus::Running
        } else {
            CampaignStatus::Scheduled
        };
        self.db.set_campaign_status(campaign_id, next).await?;
        if next == CampaignStatus::Running {
            let _ = self.scheduler.poke_handle().send(campaign_id);
        }
        Ok(())
    }

    /// Cancel a campaign, releasing its budget exactly once
    pub async fn cancel_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.db
            .finish_campaign(campaign_id, CampaignStatus::Cancelled)
            .await?;
        Ok(())
    }

    /// Persist a menu and invalidate the campaign's TTS cache.
    ///
    /// Every save invalidates, including saves with identical content.
    pub async fn save_menu(&self, menu: &PostCallMenu) -> Result<()> {
        self.db.save_menu(menu).await?;
        self.tts.invalidate(menu.campaign_id);
        Ok(())
    }

    /// Supervisor snoop on a live contact call
    pub async fn spy_call(&self, contact_id: ContactId, supervisor_extension: &str) -> Result<()> {
        self.dispatcher.spy_call(contact_id, supervisor_extension).await
    }

    /// Persist an agent-negotiated commitment and notify admins
    pub async fn record_manual_commitment(
        &self,
        new: crate::database::commitments::NewCommitment,
    ) -> Result<i64> {
        let contact_id = new.contact_id;
        let campaign_id = new.campaign_id;
        let agent_id = new.agent_id;
        let date = new.commitment_date;
        let id = self.db.insert_commitment(new).await?;
        self.hub.emit_to_admins(PushEvent::new(
            names::COMMITMENT_CREATED,
            json!({
                "contactId": contact_id,
                "campaignId": campaign_id,
                "agentId": agent_id,
                "date": date.to_string(),
            }),
        ));
        Ok(id)
    }

    /// Agent break controls, exposed for the HTTP layer
    pub async fn set_agent_break(&self, user_id: UserId, reason: &str) -> Result<()> {
        self.dispatcher.set_break(user_id, reason).await
    }

    pub async fn clear_agent_break(&self, user_id: UserId) -> Result<()> {
        self.dispatcher.clear_break(user_id).await
    }

    /// Current engine snapshot for dashboards
    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            running_campaigns: self
                .db
                .count_campaigns_with_status(CampaignStatus::Running)
                .await?,
            calling_contacts: self.db.count_calling_total().await?,
            queued_calls: self.dispatcher.queued_count(),
            available_agents: self.dispatcher.available_agents(),
            on_call_agents: self.dispatcher.on_call_agents(),
        })
    }
}
