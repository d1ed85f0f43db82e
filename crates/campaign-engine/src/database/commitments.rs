//! Payment commitment persistence.

use chrono::NaiveDate;
use sqlx::Row;
use tracing::info;

use crate::error::Result;
use crate::models::{CampaignId, CommitmentSource, ContactId, UserId};

use super::Database;

/// Commitment fields supplied on insert
#[derive(Debug, Clone)]
pub struct NewCommitment {
    pub contact_id: ContactId,
    pub campaign_id: CampaignId,
    pub commitment_date: NaiveDate,
    pub source: CommitmentSource,
    pub agent_id: Option<UserId>,
    pub note: Option<String>,
}

impl Database {
    /// Persist a commitment; returns its id
    pub async fn insert_commitment(&self, new: NewCommitment) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO commitments
                 (contact_id, campaign_id, commitment_date, source, agent_id, note)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(new.contact_id)
        .bind(new.campaign_id)
        .bind(new.commitment_date)
        .bind(new.source.as_str())
        .bind(new.agent_id)
        .bind(&new.note)
        .fetch_one(self.pool())
        .await?;

        let id: i64 = row.try_get("id")?;
        info!(
            "🤝 Commitment {} recorded for contact {} ({} on {})",
            id,
            new.contact_id,
            new.source.as_str(),
            new.commitment_date
        );
        Ok(id)
    }
}
