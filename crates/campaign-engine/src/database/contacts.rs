//! Contact selection and call-lifecycle persistence.
//!
//! The pick path is the scheduler's hot loop: a short transaction
//! selects candidate rows with `FOR UPDATE SKIP LOCKED` (so concurrent
//! process runs can never pick the same contact) and promotes them to
//! CALLING before the transaction commits. `attempt_count` is
//! incremented here, at selection time, and never again for the same
//! attempt.

use std::str::FromStr;

use chrono::{Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::models::{CallStatus, CampaignId, Contact, ContactId};

use super::Database;

/// Distinguished cause for contacts stranded in CALLING by a crash
pub const ZOMBIE_CAUSE: &str = "SYSTEM_RESTART";

/// A contact promoted to CALLING and handed to the call executor
#[derive(Debug, Clone)]
pub struct DialJob {
    pub contact_id: ContactId,
    pub campaign_id: CampaignId,
    pub phone: String,
    pub message: String,
    pub attempt_count: i32,
}

pub(crate) fn contact_from_row(row: &PgRow) -> Result<Contact> {
    let status: String = row.try_get("call_status")?;
    Ok(Contact {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        phone: row.try_get("phone")?,
        message: row.try_get("message")?,
        sequence: row.try_get("sequence")?,
        attempt_count: row.try_get("attempt_count")?,
        call_status: CallStatus::from_str(&status).map_err(EngineError::invalid_input)?,
        hangup_code: row.try_get("hangup_code")?,
        hangup_cause: row.try_get("hangup_cause")?,
        started_at: row.try_get("started_at")?,
        answered_at: row.try_get("answered_at")?,
        finished_at: row.try_get("finished_at")?,
        active_channel_id: row.try_get("active_channel_id")?,
    })
}

const CONTACT_COLUMNS: &str = "id, campaign_id, phone, message, sequence, attempt_count, \
     call_status, hangup_code, hangup_cause, started_at, answered_at, finished_at, \
     active_channel_id";

fn collect_ids(rows: Vec<PgRow>) -> Result<Vec<ContactId>> {
    rows.iter()
        .map(|row| row.try_get("id").map_err(EngineError::from))
        .collect()
}

impl Database {
    pub async fn get_contact(&self, contact_id: ContactId) -> Result<Contact> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM contacts WHERE id = $1",
            CONTACT_COLUMNS
        ))
        .bind(contact_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| EngineError::not_found(format!("contact {}", contact_id)))?;
        contact_from_row(&row)
    }

    /// Find the contact currently owning a live channel
    pub async fn find_contact_by_channel(&self, channel_id: &str) -> Result<Option<Contact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM contacts WHERE active_channel_id = $1",
            CONTACT_COLUMNS
        ))
        .bind(channel_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    /// Append a contact to a campaign; `sequence` assigns the dial order
    pub async fn add_contact(
        &self,
        campaign_id: CampaignId,
        phone: &str,
        message: &str,
    ) -> Result<ContactId> {
        let row = sqlx::query(
            "INSERT INTO contacts (campaign_id, phone, message) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(campaign_id)
        .bind(phone)
        .bind(message)
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("id")?)
    }

    /// Promote up to `limit` NOT_CALLED contacts to CALLING, in
    /// `sequence` order, under row locks with SKIP LOCKED.
    ///
    /// The attempt bound applies to first attempts too: a campaign
    /// with `max_retries = 0` never dials.
    pub async fn pick_fresh_contacts(
        &self,
        campaign_id: CampaignId,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<DialJob>> {
        let mut tx = self.pool().begin().await?;
        let picked = collect_ids(
            sqlx::query(
                "SELECT id FROM contacts
                 WHERE campaign_id = $1 AND call_status = 'NOT_CALLED'
                   AND attempt_count < $3
                 ORDER BY sequence ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(campaign_id)
            .bind(limit)
            .bind(max_retries)
            .fetch_all(&mut *tx)
            .await?,
        )?;
        self.promote_picked(tx, picked).await
    }

    /// Promote up to `limit` retryable FAILED contacts (attempts left,
    /// past the retry backoff), oldest finish first.
    ///
    /// No-answer failures (cause 19) are retried only when the
    /// campaign opted in with `retry_no_answer`.
    pub async fn pick_retry_contacts(
        &self,
        campaign_id: CampaignId,
        max_retries: i32,
        retry_no_answer: bool,
        backoff: Duration,
        limit: i64,
    ) -> Result<Vec<DialJob>> {
        let cutoff = Utc::now() - backoff;
        let mut tx = self.pool().begin().await?;
        let picked = collect_ids(
            sqlx::query(
                "SELECT id FROM contacts
                 WHERE campaign_id = $1 AND call_status = 'FAILED'
                   AND attempt_count < $3 AND finished_at < $4
                   AND ($5 OR hangup_code IS DISTINCT FROM '19')
                 ORDER BY finished_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(campaign_id)
            .bind(limit)
            .bind(max_retries)
            .bind(cutoff)
            .bind(retry_no_answer)
            .fetch_all(&mut *tx)
            .await?,
        )?;
        self.promote_picked(tx, picked).await
    }

    async fn promote_picked(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        picked: Vec<ContactId>,
    ) -> Result<Vec<DialJob>> {
        if picked.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "UPDATE contacts
             SET call_status = 'CALLING', attempt_count = attempt_count + 1,
                 started_at = now(), hangup_code = NULL, hangup_cause = NULL,
                 answered_at = NULL, finished_at = NULL
             WHERE id = ANY($1)
             RETURNING id, campaign_id, phone, message, attempt_count",
        )
        .bind(&picked)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        rows.iter()
            .map(|row| {
                Ok(DialJob {
                    contact_id: row.try_get("id")?,
                    campaign_id: row.try_get("campaign_id")?,
                    phone: row.try_get("phone")?,
                    message: row.try_get("message")?,
                    attempt_count: row.try_get("attempt_count")?,
                })
            })
            .collect()
    }

    /// Contacts currently CALLING with a live channel attached
    pub async fn count_active_calling(&self, campaign_id: CampaignId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS active FROM contacts
             WHERE campaign_id = $1 AND call_status = 'CALLING'
               AND active_channel_id IS NOT NULL",
        )
        .bind(campaign_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("active")?)
    }

    /// `(processable, calling)` counts driving campaign completion.
    /// Processable mirrors exactly what the pick queries can take:
    /// NOT_CALLED or FAILED with attempts left, minus no-answer rows
    /// when the campaign does not retry them. NOT_CALLED rows carry a
    /// NULL hangup code and pass the cause predicate unconditionally.
    pub async fn completion_counts(
        &self,
        campaign_id: CampaignId,
        max_retries: i32,
        retry_no_answer: bool,
    ) -> Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE call_status IN ('NOT_CALLED', 'FAILED')
                     AND attempt_count < $2
                     AND ($3 OR hangup_code IS DISTINCT FROM '19')) AS processable,
                 COUNT(*) FILTER (WHERE call_status = 'CALLING') AS calling
             FROM contacts WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .bind(max_retries)
        .bind(retry_no_answer)
        .fetch_one(self.pool())
        .await?;
        Ok((row.try_get("processable")?, row.try_get("calling")?))
    }

    /// Attach the live channel id to a CALLING contact
    pub async fn set_active_channel(&self, contact_id: ContactId, channel_id: &str) -> Result<()> {
        sqlx::query("UPDATE contacts SET active_channel_id = $2 WHERE id = $1")
            .bind(contact_id)
            .bind(channel_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record the answer instant. Guarded so a late answer event
    /// cannot stamp a contact that already went terminal.
    pub async fn mark_contact_answered(&self, contact_id: ContactId) -> Result<()> {
        sqlx::query(
            "UPDATE contacts SET answered_at = now()
             WHERE id = $1 AND call_status = 'CALLING'",
        )
        .bind(contact_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal success. Only valid from CALLING; the guard keeps a
    /// racing duplicate from re-stamping `finished_at`.
    pub async fn mark_contact_success(
        &self,
        contact_id: ContactId,
        hangup_code: &str,
        hangup_cause: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE contacts
             SET call_status = 'SUCCESS', hangup_code = $2, hangup_cause = $3,
                 finished_at = now(), active_channel_id = NULL
             WHERE id = $1 AND call_status = 'CALLING'",
        )
        .bind(contact_id)
        .bind(hangup_code)
        .bind(hangup_cause)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Terminal failure. Only valid from CALLING.
    pub async fn mark_contact_failed(
        &self,
        contact_id: ContactId,
        hangup_code: &str,
        hangup_cause: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE contacts
             SET call_status = 'FAILED', hangup_code = $2, hangup_cause = $3,
                 finished_at = now(), active_channel_id = NULL
             WHERE id = $1 AND call_status = 'CALLING'",
        )
        .bind(contact_id)
        .bind(hangup_code)
        .bind(hangup_cause)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Contacts in CALLING across all campaigns
    pub async fn count_calling_total(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM contacts WHERE call_status = 'CALLING'")
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("total")?)
    }

    /// Sweep contacts stranded in CALLING (startup, reconnect).
    ///
    /// A contact persisted as CALLING without a live engine is a
    /// zombie; it fails with the distinguished [`ZOMBIE_CAUSE`].
    pub async fn sweep_zombie_contacts(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE contacts
             SET call_status = 'FAILED', hangup_code = $1, hangup_cause = $1,
                 finished_at = now(), active_channel_id = NULL
             WHERE call_status = 'CALLING'",
        )
        .bind(ZOMBIE_CAUSE)
        .execute(self.pool())
        .await?;
        let swept = result.rows_affected();
        if swept > 0 {
            info!("🧟 Swept {} zombie contacts to FAILED", swept);
        }
        Ok(swept)
    }
}
