//! # Persistence Layer (sqlx + PostgreSQL)
//!
//! Fully async, Send-safe database access for the campaign engine.
//! Contact selection relies on `FOR UPDATE SKIP LOCKED`; budget
//! accounting on single conditional UPDATE statements; both are the
//! reason this store requires PostgreSQL semantics.
//!
//! Domain operations are split per area:
//!
//! - [`campaigns`]: campaign rows, status transitions, budget-coupled
//!   create/complete/cancel
//! - [`contacts`]: row-locked contact selection and terminal persistence
//! - [`menus`]: post-call menu documents
//! - [`commitments`]: payment commitments
//! - [`budget`]: per-user channel budget accounting
//! - [`agents`]: agent seeds, break history, agent-call event log

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseSettings;
use crate::error::Result;

pub mod agents;
pub mod budget;
pub mod campaigns;
pub mod commitments;
pub mod contacts;
pub mod menus;

/// Statements applied idempotently at startup
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS campaigns (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        start_date TIMESTAMP NOT NULL,
        end_date TIMESTAMP NOT NULL,
        max_retries INTEGER NOT NULL DEFAULT 0,
        concurrent_calls INTEGER NOT NULL DEFAULT 1,
        retry_on_answer BOOLEAN NOT NULL DEFAULT FALSE,
        status TEXT NOT NULL DEFAULT 'SCHEDULED',
        user_id BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS contacts (
        id BIGSERIAL PRIMARY KEY,
        campaign_id BIGINT NOT NULL REFERENCES campaigns(id),
        phone TEXT NOT NULL,
        message TEXT NOT NULL,
        sequence BIGSERIAL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        call_status TEXT NOT NULL DEFAULT 'NOT_CALLED',
        hangup_code TEXT,
        hangup_cause TEXT,
        started_at TIMESTAMPTZ,
        answered_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        active_channel_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_contacts_campaign_status
        ON contacts (campaign_id, call_status)",
    "CREATE INDEX IF NOT EXISTS idx_contacts_campaign_sequence
        ON contacts (campaign_id, sequence)",
    "CREATE TABLE IF NOT EXISTS post_call_menus (
        campaign_id BIGINT PRIMARY KEY REFERENCES campaigns(id),
        active BOOLEAN NOT NULL DEFAULT FALSE,
        document JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS commitments (
        id BIGSERIAL PRIMARY KEY,
        contact_id BIGINT NOT NULL,
        campaign_id BIGINT NOT NULL,
        commitment_date DATE NOT NULL,
        source TEXT NOT NULL,
        agent_id BIGINT,
        note TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS channel_budgets (
        user_id BIGINT PRIMARY KEY,
        max_channels INTEGER NOT NULL DEFAULT 0,
        used_channels INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        role TEXT NOT NULL,
        extension TEXT
    )",
    "CREATE TABLE IF NOT EXISTS agent_breaks (
        id BIGSERIAL PRIMARY KEY,
        agent_id BIGINT NOT NULL,
        reason TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        ended_at TIMESTAMPTZ,
        duration_seconds BIGINT,
        initiated_by TEXT NOT NULL,
        end_reason TEXT NOT NULL DEFAULT 'STILL_ACTIVE'
    )",
    "CREATE TABLE IF NOT EXISTS call_events (
        id BIGSERIAL PRIMARY KEY,
        contact_id BIGINT NOT NULL,
        campaign_id BIGINT,
        agent_id BIGINT,
        event TEXT NOT NULL,
        duration_seconds BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_call_events_contact
        ON call_events (contact_id, created_at)",
];

/// Pooled handle to the primary store
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the primary store and apply the schema
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        info!(
            "🗄️ Connecting to primary store {}:{}/{}",
            settings.host, settings.port, settings.database
        );
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&settings.url())
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("✅ Primary store ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
