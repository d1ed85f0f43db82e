//! Agent seeds, break history, and the agent-call event log.
//!
//! Live agent state is owned by the in-memory dispatcher; this module
//! covers what survives a restart: which users are call-center agents,
//! their append-only break history, and the ASSIGNED / CONNECTED /
//! FINISHED / TIMEOUT / CLIENT_ABANDONED event log.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::error::Result;
use crate::models::{BreakEndReason, CallEventKind, CampaignId, ContactId, UserId};

use super::Database;

/// A call-center user loaded to seed the dispatcher
#[derive(Debug, Clone)]
pub struct AgentSeed {
    pub user_id: UserId,
    pub name: String,
    pub extension: String,
}

/// One row of the append-only break history
#[derive(Debug, Clone)]
pub struct BreakRecord {
    pub id: i64,
    pub agent_id: UserId,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub initiated_by: String,
    pub end_reason: String,
}

fn break_from_row(row: &PgRow) -> Result<BreakRecord> {
    Ok(BreakRecord {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        reason: row.try_get("reason")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        initiated_by: row.try_get("initiated_by")?,
        end_reason: row.try_get("end_reason")?,
    })
}

impl Database {
    /// Users with the call-center role and an extension set
    pub async fn load_agent_seeds(&self) -> Result<Vec<AgentSeed>> {
        let rows = sqlx::query(
            "SELECT id, name, extension FROM users
             WHERE role = 'callcenter' AND extension IS NOT NULL",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AgentSeed {
                    user_id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    extension: row.try_get("extension")?,
                })
            })
            .collect()
    }

    /// Open a break record; returns its id
    pub async fn open_break(
        &self,
        agent_id: UserId,
        reason: &str,
        initiated_by: &str,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO agent_breaks (agent_id, reason, initiated_by)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(agent_id)
        .bind(reason)
        .bind(initiated_by)
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("id")?)
    }

    /// Close the agent's open break record, stamping the duration
    pub async fn close_break(&self, agent_id: UserId, end_reason: BreakEndReason) -> Result<()> {
        sqlx::query(
            "UPDATE agent_breaks
             SET ended_at = now(),
                 duration_seconds = EXTRACT(EPOCH FROM (now() - started_at))::BIGINT,
                 end_reason = $2
             WHERE agent_id = $1 AND ended_at IS NULL",
        )
        .bind(agent_id)
        .bind(end_reason.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Break history for an agent, newest first
    pub async fn list_breaks(
        &self,
        agent_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BreakRecord>> {
        let rows = sqlx::query(
            "SELECT id, agent_id, reason, started_at, ended_at, duration_seconds,
                    initiated_by, end_reason
             FROM agent_breaks
             WHERE agent_id = $1 AND started_at >= $2
             ORDER BY started_at DESC",
        )
        .bind(agent_id)
        .bind(since)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(break_from_row).collect()
    }

    /// Append an entry to the agent-call event log
    pub async fn insert_call_event(
        &self,
        contact_id: ContactId,
        campaign_id: Option<CampaignId>,
        agent_id: Option<UserId>,
        event: CallEventKind,
        duration_seconds: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_events (contact_id, campaign_id, agent_id, event, duration_seconds)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(contact_id)
        .bind(campaign_id)
        .bind(agent_id)
        .bind(event.as_str())
        .bind(duration_seconds)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Whether a FINISHED event for the contact was persisted within
    /// the last `within_seconds` (the duplicate-report guard)
    pub async fn recent_finished_exists(
        &self,
        contact_id: ContactId,
        within_seconds: i64,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM call_events
                 WHERE contact_id = $1 AND event = 'FINISHED'
                   AND created_at > now() - make_interval(secs => $2)
             ) AS hit",
        )
        .bind(contact_id)
        .bind(within_seconds as f64)
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("hit")?)
    }
}
