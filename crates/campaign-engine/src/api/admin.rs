//! # Administrative API
//!
//! Campaign lifecycle and configuration operations. Creating a
//! campaign reserves its channel budget; refusal carries the
//! structured budget fields so callers can render a precise error.
//!
//! ## Examples
//!
//! ```no_run
//! use outdial_engine::api::AdminApi;
//! use outdial_engine::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(engine: Arc<OutdialEngine>) -> Result<()> {
//! let admin = AdminApi::new(engine);
//!
//! let campaign = admin
//!     .create_campaign(NewCampaign {
//!         name: "march-collections".into(),
//!         start_date: "2026-03-02T09:00:00".parse().unwrap(),
//!         end_date: "2026-03-06T18:00:00".parse().unwrap(),
//!         max_retries: 2,
//!         concurrent_calls: 5,
//!         retry_on_answer: true,
//!         user_id: 12,
//!     })
//!     .await?;
//!
//! admin.add_contact(campaign.id, "0991234567", "Your bill is due.").await?;
//! admin.pause_campaign(campaign.id).await?;
//! admin.resume_campaign(campaign.id).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::database::campaigns::NewCampaign;
use crate::engine::OutdialEngine;
use crate::error::Result;
use crate::models::{Campaign, CampaignId, ContactId, PostCallMenu};

/// Administrative operations on campaigns and menus
pub struct AdminApi {
    engine: Arc<OutdialEngine>,
}

impl AdminApi {
    pub fn new(engine: Arc<OutdialEngine>) -> Self {
        Self { engine }
    }

    /// Create a campaign, reserving `concurrent_calls` channels from
    /// the owner's budget.
    ///
    /// # Errors
    ///
    /// [`EngineError::BudgetExceeded`](crate::error::EngineError::BudgetExceeded)
    /// when the budget cannot cover the request; nothing is persisted.
    pub async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        self.engine.create_campaign(new).await
    }

    /// Pause dialing; in-flight calls run to completion
    pub async fn pause_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.engine.pause_campaign(campaign_id).await
    }

    /// Resume a paused campaign into its time window
    pub async fn resume_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.engine.resume_campaign(campaign_id).await
    }

    /// Cancel a campaign, releasing its channel budget exactly once
    pub async fn cancel_campaign(&self, campaign_id: CampaignId) -> Result<()> {
        self.engine.cancel_campaign(campaign_id).await
    }

    /// Load one campaign
    pub async fn get_campaign(&self, campaign_id: CampaignId) -> Result<Campaign> {
        self.engine.database().get_campaign(campaign_id).await
    }

    /// All campaigns owned by a user, newest first
    pub async fn list_campaigns(&self, user_id: crate::models::UserId) -> Result<Vec<Campaign>> {
        self.engine.database().list_campaigns_for_user(user_id).await
    }

    /// Append a contact; dial order follows insertion order
    pub async fn add_contact(
        &self,
        campaign_id: CampaignId,
        phone: &str,
        message: &str,
    ) -> Result<ContactId> {
        self.engine.database().add_contact(campaign_id, phone, message).await
    }

    /// Persist a post-call menu. Every save (identical content
    /// included) invalidates the campaign's TTS cache.
    pub async fn save_menu(&self, menu: &PostCallMenu) -> Result<()> {
        self.engine.save_menu(menu).await
    }

    /// Load a campaign's menu
    pub async fn get_menu(&self, campaign_id: CampaignId) -> Result<Option<PostCallMenu>> {
        self.engine.database().get_menu(campaign_id).await
    }
}
