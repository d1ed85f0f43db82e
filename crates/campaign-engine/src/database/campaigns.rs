//! Campaign rows and budget-coupled status transitions.
//!
//! The channel budget is reserved when a campaign is created and must
//! be released exactly once when the campaign leaves any
//! channel-holding status. Both sides run inside one transaction with
//! the campaign row locked, so concurrent completion paths cannot
//! release twice.

use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::models::{Campaign, CampaignId, CampaignStatus, UserId};

use super::Database;

/// Contact counts for one running campaign
#[derive(Debug, Clone)]
pub struct CampaignProgress {
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    pub total: i64,
    pub not_called: i64,
    pub calling: i64,
    pub success: i64,
    pub failed: i64,
}

/// Campaign fields supplied on creation
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub start_date: chrono::NaiveDateTime,
    pub end_date: chrono::NaiveDateTime,
    pub max_retries: i32,
    pub concurrent_calls: i32,
    pub retry_on_answer: bool,
    pub user_id: UserId,
}

pub(crate) fn campaign_from_row(row: &PgRow) -> Result<Campaign> {
    let status: String = row.try_get("status")?;
    Ok(Campaign {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        max_retries: row.try_get("max_retries")?,
        concurrent_calls: row.try_get("concurrent_calls")?,
        retry_on_answer: row.try_get("retry_on_answer")?,
        status: CampaignStatus::from_str(&status).map_err(EngineError::invalid_input)?,
        user_id: row.try_get("user_id")?,
    })
}

const CAMPAIGN_COLUMNS: &str = "id, name, start_date, end_date, max_retries, \
     concurrent_calls, retry_on_answer, status, user_id";

impl Database {
    /// Load one campaign
    pub async fn get_campaign(&self, campaign_id: CampaignId) -> Result<Campaign> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM campaigns WHERE id = $1",
            CAMPAIGN_COLUMNS
        ))
        .bind(campaign_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| EngineError::not_found(format!("campaign {}", campaign_id)))?;
        campaign_from_row(&row)
    }

    /// All campaigns owned by a user, newest first
    pub async fn list_campaigns_for_user(&self, user_id: UserId) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM campaigns WHERE user_id = $1 ORDER BY id DESC",
            CAMPAIGN_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    /// Campaigns the scheduler tick scans
    pub async fn campaigns_for_tick(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM campaigns WHERE status IN ('SCHEDULED', 'RUNNING')",
            CAMPAIGN_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    /// Create a campaign, reserving its channel budget atomically.
    ///
    /// Fails with [`EngineError::BudgetExceeded`] without inserting
    /// anything when the user's budget cannot cover `concurrent_calls`.
    pub async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        if new.concurrent_calls < 1 {
            return Err(EngineError::invalid_input("concurrentCalls must be >= 1"));
        }
        if new.max_retries < 0 {
            return Err(EngineError::invalid_input("maxRetries must be >= 0"));
        }

        let mut tx = self.pool().begin().await?;

        let reserved = sqlx::query(
            "UPDATE channel_budgets
             SET used_channels = used_channels + $2
             WHERE user_id = $1 AND used_channels + $2 <= max_channels",
        )
        .bind(new.user_id)
        .bind(new.concurrent_calls)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            let budget = sqlx::query(
                "SELECT max_channels, used_channels FROM channel_budgets WHERE user_id = $1",
            )
            .bind(new.user_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            let (max, used) = match budget {
                Some(row) => (row.try_get("max_channels")?, row.try_get("used_channels")?),
                None => (0, 0),
            };
            return Err(EngineError::BudgetExceeded {
                max,
                used,
                requested: new.concurrent_calls,
            });
        }

        let row = sqlx::query(&format!(
            "INSERT INTO campaigns
                 (name, start_date, end_date, max_retries, concurrent_calls,
                  retry_on_answer, status, user_id)
             VALUES ($1, $2, $3, $4, $5, $6, 'SCHEDULED', $7)
             RETURNING {}",
            CAMPAIGN_COLUMNS
        ))
        .bind(&new.name)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(new.max_retries)
        .bind(new.concurrent_calls)
        .bind(new.retry_on_answer)
        .bind(new.user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let campaign = campaign_from_row(&row)?;
        info!(
            "📣 Campaign {} created for user {} ({} channels reserved)",
            campaign.id, campaign.user_id, campaign.concurrent_calls
        );
        Ok(campaign)
    }

    /// Move a campaign between non-terminal statuses
    /// (SCHEDULED ↔ RUNNING ↔ PAUSED)
    pub async fn set_campaign_status(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> Result<()> {
        if status.is_terminal() {
            return Err(EngineError::invalid_input(
                "terminal transitions go through finish_campaign",
            ));
        }
        sqlx::query("UPDATE campaigns SET status = $2 WHERE id = $1")
            .bind(campaign_id)
            .bind(status.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Terminal transition (COMPLETED or CANCELLED) releasing the
    /// channel budget exactly once.
    ///
    /// The campaign row is locked for the duration, so a racing second
    /// call observes the terminal status and releases nothing.
    pub async fn finish_campaign(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(EngineError::invalid_input(
                "finish_campaign requires a terminal status",
            ));
        }

        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT status, concurrent_calls, user_id FROM campaigns WHERE id = $1 FOR UPDATE",
        )
        .bind(campaign_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("campaign {}", campaign_id)))?;

        let previous: String = row.try_get("status")?;
        let previous =
            CampaignStatus::from_str(&previous).map_err(EngineError::invalid_input)?;
        if previous.is_terminal() {
            tx.rollback().await?;
            return Ok(false);
        }

        let concurrent_calls: i32 = row.try_get("concurrent_calls")?;
        let user_id: UserId = row.try_get("user_id")?;

        sqlx::query("UPDATE campaigns SET status = $2 WHERE id = $1")
            .bind(campaign_id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE channel_budgets
             SET used_channels = GREATEST(0, used_channels - $2)
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(concurrent_calls)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "🏁 Campaign {} -> {} ({} channels released for user {})",
            campaign_id,
            status.as_str(),
            concurrent_calls,
            user_id
        );
        Ok(true)
    }

    /// Per-campaign contact progress for every RUNNING campaign
    pub async fn running_campaign_progress(&self) -> Result<Vec<CampaignProgress>> {
        let rows = sqlx::query(
            "SELECT c.id, c.user_id, c.name,
                 COUNT(ct.id) AS total,
                 COUNT(*) FILTER (WHERE ct.call_status = 'NOT_CALLED') AS not_called,
                 COUNT(*) FILTER (WHERE ct.call_status = 'CALLING') AS calling,
                 COUNT(*) FILTER (WHERE ct.call_status = 'SUCCESS') AS success,
                 COUNT(*) FILTER (WHERE ct.call_status = 'FAILED') AS failed
             FROM campaigns c
             LEFT JOIN contacts ct ON ct.campaign_id = c.id
             WHERE c.status = 'RUNNING'
             GROUP BY c.id, c.user_id, c.name",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CampaignProgress {
                    campaign_id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    name: row.try_get("name")?,
                    total: row.try_get("total")?,
                    not_called: row.try_get("not_called")?,
                    calling: row.try_get("calling")?,
                    success: row.try_get("success")?,
                    failed: row.try_get("failed")?,
                })
            })
            .collect()
    }

    /// Campaigns currently in `status`
    pub async fn count_campaigns_with_status(&self, status: CampaignStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM campaigns WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("total")?)
    }

}
