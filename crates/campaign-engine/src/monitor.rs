//! Periodic dashboard feeds.
//!
//! Clients that subscribe to the `stats` or `campaigns` sub-channels
//! of their room receive a steady stream of engine statistics and
//! per-campaign progress. Emission goes through the hub's throttling
//! and sanitization like every other event.

use std::sync::Arc;
use std::time::Duration;

use outdial_push::{PushEvent, PushHub};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::database::Database;
use crate::dispatcher::AgentDispatcher;
use crate::models::CampaignStatus;

/// Cadence of the stats feed
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Emits periodic statistics to subscribed dashboard sockets
pub struct StatsMonitor {
    db: Database,
    dispatcher: Arc<AgentDispatcher>,
    hub: Arc<PushHub>,
}

impl StatsMonitor {
    pub fn new(db: Database, dispatcher: Arc<AgentDispatcher>, hub: Arc<PushHub>) -> Arc<Self> {
        Arc::new(Self {
            db,
            dispatcher,
            hub,
        })
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = monitor.emit_once().await {
                            error!("Stats feed pass failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Stats feed shutting down");
                        return;
                    }
                }
            }
        });
    }

    async fn emit_once(&self) -> crate::error::Result<()> {
        // Engine-wide numbers to the admin room's `stats` channel
        let running = self
            .db
            .count_campaigns_with_status(CampaignStatus::Running)
            .await?;
        let calling = self.db.count_calling_total().await?;
        self.hub.emit_to_admins(PushEvent::on_channel(
            "stats-update",
            "stats",
            json!({
                "runningCampaigns": running,
                "callingContacts": calling,
                "queuedCalls": self.dispatcher.queued_count(),
                "longestWaitSeconds": self.dispatcher.longest_wait_seconds(),
                "availableAgents": self.dispatcher.available_agents(),
                "onCallAgents": self.dispatcher.on_call_agents(),
            }),
        ));

        // Per-campaign progress to each owner's `campaigns` channel
        let progress = self.db.running_campaign_progress().await?;
        debug!("Stats feed: {} running campaigns", progress.len());
        for campaign in progress {
            self.hub.emit_to_user(
                campaign.user_id,
                PushEvent::on_channel(
                    "campaign-progress",
                    "campaigns",
                    json!({
                        "campaignId": campaign.campaign_id,
                        "name": campaign.name,
                        "total": campaign.total,
                        "notCalled": campaign.not_called,
                        "calling": campaign.calling,
                        "success": campaign.success,
                        "failed": campaign.failed,
                    }),
                ),
            );
        }
        Ok(())
    }
}
