//! # Agent API
//!
//! Operations an agent performs from the dashboard: break management
//! and finished-call reporting. Breaks persist as an append-only
//! history; duplicate finished reports inside the dedupe window are
//! dropped silently.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};

use crate::database::commitments::NewCommitment;
use crate::engine::OutdialEngine;
use crate::error::{EngineError, Result};
use crate::models::{CampaignId, CommitmentSource, ContactId, UserId};

/// Self-service operations for call-center agents
pub struct AgentApi {
    engine: Arc<OutdialEngine>,
}

impl AgentApi {
    pub fn new(engine: Arc<OutdialEngine>) -> Self {
        Self { engine }
    }

    /// Start a break with the given reason
    pub async fn set_break(&self, agent_id: UserId, reason: &str) -> Result<()> {
        self.engine.set_agent_break(agent_id, reason).await
    }

    /// Return from break
    pub async fn clear_break(&self, agent_id: UserId) -> Result<()> {
        self.engine.clear_agent_break(agent_id).await
    }

    /// Report a finished agent call.
    ///
    /// Identical reports for the same contact within the dedupe
    /// window are no-ops (no double decrement).
    pub async fn report_call_finished(
        &self,
        contact_id: ContactId,
        campaign_id: CampaignId,
        agent_id: UserId,
        duration_seconds: i64,
    ) {
        self.engine
            .dispatcher()
            .on_agent_call_finished(contact_id, campaign_id, agent_id, duration_seconds)
            .await
    }

    /// Register a commitment negotiated on a live call.
    ///
    /// Day is bounded like the automated capture (1..=28); the record
    /// carries the attending agent and the optional note.
    pub async fn record_commitment(
        &self,
        contact_id: ContactId,
        campaign_id: CampaignId,
        agent_id: UserId,
        commitment_date: NaiveDate,
        note: Option<String>,
    ) -> Result<i64> {
        if commitment_date.day0() >= 28 {
            return Err(EngineError::invalid_input(
                "commitment day must fall within 1..=28",
            ));
        }
        self.engine
            .record_manual_commitment(NewCommitment {
                contact_id,
                campaign_id,
                commitment_date,
                source: CommitmentSource::Manual,
                agent_id: Some(agent_id),
                note,
            })
            .await
    }
}
