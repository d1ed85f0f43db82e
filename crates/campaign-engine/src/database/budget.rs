//! Per-tenant channel budget accounting.
//!
//! Every atomic step is a single conditional UPDATE so concurrent
//! campaign creations cannot interleave between read and write. A
//! reservation succeeds iff the post-increment still satisfies
//! `used_channels <= max_channels`; violations surface as the
//! structured [`EngineError::BudgetExceeded`] domain error, never as a
//! partial reservation.

use sqlx::Row;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::models::{ChannelBudget, UserId};

use super::Database;

impl Database {
    /// Read the budget row for a user
    pub async fn get_budget(&self, user_id: UserId) -> Result<ChannelBudget> {
        let row = sqlx::query(
            "SELECT user_id, max_channels, used_channels FROM channel_budgets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| EngineError::not_found(format!("channel budget for user {}", user_id)))?;
        Ok(ChannelBudget {
            user_id: row.try_get("user_id")?,
            max_channels: row.try_get("max_channels")?,
            used_channels: row.try_get("used_channels")?,
        })
    }

    /// Whether `n` more channels currently fit the user's budget
    pub async fn can_assign_channels(&self, user_id: UserId, n: i32) -> Result<bool> {
        let budget = self.get_budget(user_id).await?;
        Ok(budget.used_channels + n <= budget.max_channels)
    }

    /// Atomically reserve `n` channels.
    pub async fn reserve_channels(&self, user_id: UserId, n: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE channel_budgets
             SET used_channels = used_channels + $2
             WHERE user_id = $1 AND used_channels + $2 <= max_channels",
        )
        .bind(user_id)
        .bind(n)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            let budget = self.get_budget(user_id).await.unwrap_or(ChannelBudget {
                user_id,
                max_channels: 0,
                used_channels: 0,
            });
            return Err(EngineError::BudgetExceeded {
                max: budget.max_channels,
                used: budget.used_channels,
                requested: n,
            });
        }
        Ok(())
    }

    /// Atomically release `n` channels, flooring at zero
    pub async fn release_channels(&self, user_id: UserId, n: i32) -> Result<()> {
        sqlx::query(
            "UPDATE channel_budgets
             SET used_channels = GREATEST(0, used_channels - $2)
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(n)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Recovery tool: replace `used_channels` by the sum of
    /// `concurrent_calls` over the user's non-terminal campaigns.
    pub async fn recompute_budget(&self, user_id: UserId) -> Result<i32> {
        let row = sqlx::query(
            "UPDATE channel_budgets
             SET used_channels = COALESCE((
                 SELECT SUM(concurrent_calls) FROM campaigns
                 WHERE user_id = $1 AND status IN ('SCHEDULED', 'RUNNING', 'PAUSED')
             ), 0)
             WHERE user_id = $1
             RETURNING used_channels",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) => Ok(row.try_get("used_channels")?),
            None => Ok(0),
        }
    }

    /// Recompute every user's budget, logging corrected drift.
    /// Run once at startup recovery.
    pub async fn recompute_all_budgets(&self) -> Result<()> {
        let rows = sqlx::query("SELECT user_id, used_channels FROM channel_budgets")
            .fetch_all(self.pool())
            .await?;

        for row in rows {
            let user_id: UserId = row.try_get("user_id")?;
            let before: i32 = row.try_get("used_channels")?;
            let after = self.recompute_budget(user_id).await?;
            if before != after {
                warn!(
                    "Channel budget drift for user {}: {} -> {}",
                    user_id, before, after
                );
            }
        }
        info!("✅ Channel budgets recomputed");
        Ok(())
    }
}
