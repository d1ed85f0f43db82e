//! Campaign scheduler.
//!
//! Two entry points drive dialing:
//!
//! - A one-second periodic tick scanning SCHEDULED/RUNNING campaigns:
//!   time-window transitions, completion past the end date, and a
//!   `process` pass for every RUNNING campaign.
//! - Event-driven pokes from the call executor and the engine's event
//!   router whenever a contact leaves CALLING.
//!
//! `process` runs under the per-campaign lock registry and keeps
//! `active <= concurrent_calls` by construction: it only launches into
//! the free gap measured from the persisted CALLING count, and the
//! row-locked SKIP LOCKED selection prevents the same contact from
//! being picked twice.

pub mod locks;

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::database::Database;
use crate::error::Result;
use crate::executor::CallExecutor;
use crate::models::{Campaign, CampaignId, CampaignStatus};

use locks::CampaignLocks;

/// Periodic tick cadence
pub const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Upper bound on contacts promoted per process pass
pub const BATCH_MAX: i64 = 20;

/// Minimum rest before a FAILED contact may be retried
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Cadence of the stale-lock sweeper
const LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Maintains per-campaign dialing at the configured concurrency
pub struct CampaignScheduler {
    db: Database,
    executor: Arc<CallExecutor>,
    locks: Arc<CampaignLocks>,
    poke_tx: mpsc::UnboundedSender<CampaignId>,
    poke_rx: Mutex<Option<mpsc::UnboundedReceiver<CampaignId>>>,
}

impl CampaignScheduler {
    pub fn new(
        db: Database,
        executor: Arc<CallExecutor>,
        poke_tx: mpsc::UnboundedSender<CampaignId>,
        poke_rx: mpsc::UnboundedReceiver<CampaignId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            executor,
            locks: Arc::new(CampaignLocks::new()),
            poke_tx,
            poke_rx: Mutex::new(Some(poke_rx)),
        })
    }

    /// Sender used to request a `process` pass for a campaign
    pub fn poke_handle(&self) -> mpsc::UnboundedSender<CampaignId> {
        self.poke_tx.clone()
    }

    /// Spawn the tick loop, the poke consumer, and the lock sweeper
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let scheduler = self.clone();
        let tick_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULER_TICK);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = scheduler.run_tick().await {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }
                    _ = tick_shutdown.cancelled() => {
                        info!("Scheduler tick loop shutting down");
                        return;
                    }
                }
            }
        });

        let scheduler = self.clone();
        let poke_shutdown = shutdown.clone();
        let mut poke_rx = self
            .poke_rx
            .lock()
            .take()
            .expect("scheduler started twice");
        tokio::spawn(async move {
            loop {
                let campaign_id = tokio::select! {
                    id = poke_rx.recv() => match id {
                        Some(id) => id,
                        None => return,
                    },
                    _ = poke_shutdown.cancelled() => return,
                };
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    scheduler.process_campaign(campaign_id).await;
                });
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LOCK_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => { scheduler.locks.sweep(); }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    /// One periodic pass over SCHEDULED/RUNNING campaigns
    async fn run_tick(self: &Arc<Self>) -> Result<()> {
        let now = Local::now().naive_local();
        let campaigns = self.db.campaigns_for_tick().await?;

        for campaign in campaigns {
            if now >= campaign.end_date {
                info!(
                    "⏰ Campaign {} past its end date, completing",
                    campaign.id
                );
                self.db
                    .finish_campaign(campaign.id, CampaignStatus::Completed)
                    .await?;
                continue;
            }

            if campaign.status == CampaignStatus::Scheduled && campaign.in_window(now) {
                info!("▶️ Campaign {} entering its window, now RUNNING", campaign.id);
                self.db
                    .set_campaign_status(campaign.id, CampaignStatus::Running)
                    .await?;
            } else if campaign.status != CampaignStatus::Running {
                continue;
            }

            let scheduler = self.clone();
            let campaign_id = campaign.id;
            tokio::spawn(async move {
                scheduler.process_campaign(campaign_id).await;
            });
        }
        Ok(())
    }

    /// Run one `process` pass under the campaign's lock
    pub async fn process_campaign(self: &Arc<Self>, campaign_id: CampaignId) {
        if !self.locks.try_acquire(campaign_id) {
            debug!("Campaign {} already being processed", campaign_id);
            return;
        }
        let result = self.process_locked(campaign_id).await;
        self.locks.release(campaign_id);
        if let Err(e) = result {
            error!("Processing campaign {} failed: {}", campaign_id, e);
        }
    }

    async fn process_locked(&self, campaign_id: CampaignId) -> Result<()> {
        let campaign = self.db.get_campaign(campaign_id).await?;
        let now = Local::now().naive_local();

        if campaign.status != CampaignStatus::Running {
            return Ok(());
        }
        if now >= campaign.end_date {
            self.db
                .finish_campaign(campaign_id, CampaignStatus::Completed)
                .await?;
            return Ok(());
        }
        if !campaign.in_window(now) {
            return Ok(());
        }

        let active = self.db.count_active_calling(campaign_id).await?;
        let free = (campaign.concurrent_calls as i64 - active).max(0);
        if free == 0 {
            return Ok(());
        }
        self.dispatch_batch(&campaign, free.min(BATCH_MAX)).await?;

        // Completion: nothing left to process and nothing in flight
        let (processable, calling) = self
            .db
            .completion_counts(campaign_id, campaign.max_retries, campaign.retry_on_answer)
            .await?;
        if processable == 0 && calling == 0 {
            info!("🏁 Campaign {} exhausted all contacts, completing", campaign_id);
            self.db
                .finish_campaign(campaign_id, CampaignStatus::Completed)
                .await?;
        }
        Ok(())
    }

    /// Fill up to `slots` with fresh contacts, then with retryable
    /// failures past the backoff. No-answer failures re-enter the pool
    /// only for campaigns with `retry_on_answer` set.
    async fn dispatch_batch(&self, campaign: &Campaign, slots: i64) -> Result<()> {
        let fresh = self
            .db
            .pick_fresh_contacts(campaign.id, campaign.max_retries, slots)
            .await?;
        let mut launched = fresh.len() as i64;
        self.launch_jobs(campaign, fresh);

        let remaining = slots - launched;
        if remaining > 0 {
            let backoff = chrono::Duration::from_std(RETRY_BACKOFF)
                .unwrap_or_else(|_| chrono::Duration::seconds(5));
            let retries = self
                .db
                .pick_retry_contacts(
                    campaign.id,
                    campaign.max_retries,
                    campaign.retry_on_answer,
                    backoff,
                    remaining,
                )
                .await?;
            launched += retries.len() as i64;
            self.launch_jobs(campaign, retries);
        }

        if launched > 0 {
            debug!(
                "Campaign {} dispatched {} contacts into {} free slots",
                campaign.id, launched, slots
            );
        }
        Ok(())
    }

    fn launch_jobs(&self, campaign: &Campaign, jobs: Vec<crate::database::contacts::DialJob>) {
        for job in jobs {
            let executor = self.executor.clone();
            let owner_id = campaign.user_id;
            tokio::spawn(async move {
                executor.call_with_tts(job, owner_id).await;
            });
        }
    }
}
