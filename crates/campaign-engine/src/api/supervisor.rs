//! # Supervisor API
//!
//! Real-time oversight of agents, the wait queue, and live calls:
//! engine statistics, agent snapshots, forced status changes with
//! break-history bookkeeping, and call snooping from the supervisor's
//! extension.
//!
//! ## Examples
//!
//! ```no_run
//! use outdial_engine::api::SupervisorApi;
//! use outdial_engine::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(engine: Arc<OutdialEngine>) -> Result<()> {
//! let supervisor = SupervisorApi::new(engine);
//!
//! let stats = supervisor.stats().await?;
//! println!("📊 Engine overview:");
//! println!("  Running campaigns: {}", stats.running_campaigns);
//! println!("  Live calls: {}", stats.calling_contacts);
//! println!("  Waiting callers: {}", stats.queued_calls);
//!
//! for agent in supervisor.list_agents() {
//!     println!(
//!         "  {} ({}): {} - {} calls today",
//!         agent.name,
//!         agent.extension,
//!         agent.status.as_str(),
//!         agent.total_calls_today
//!     );
//! }
//!
//! // Listen in on a live call
//! supervisor.spy_call(42, "2001").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::database::agents::BreakRecord;
use crate::dispatcher::agents::AgentState;
use crate::dispatcher::queue::QueueEntry;
use crate::engine::{EngineStats, OutdialEngine};
use crate::error::Result;
use crate::models::{AgentStatus, ContactId, UserId};

/// Oversight operations for supervisors
pub struct SupervisorApi {
    engine: Arc<OutdialEngine>,
}

impl SupervisorApi {
    pub fn new(engine: Arc<OutdialEngine>) -> Self {
        Self { engine }
    }

    /// Current engine snapshot
    pub async fn stats(&self) -> Result<EngineStats> {
        self.engine.stats().await
    }

    /// Live agent states in registration order
    pub fn list_agents(&self) -> Vec<AgentState> {
        self.engine.dispatcher().agents_snapshot()
    }

    /// Callers currently waiting, positions 1..n
    pub fn list_queue(&self) -> Vec<QueueEntry> {
        self.engine.dispatcher().queue_snapshot()
    }

    /// Longest current queue wait in seconds
    pub fn longest_wait_seconds(&self) -> i64 {
        self.engine.dispatcher().longest_wait_seconds()
    }

    /// Force an agent's status, closing or opening break records as
    /// the transition requires
    pub async fn force_agent_status(
        &self,
        agent_id: UserId,
        status: AgentStatus,
        supervisor_id: UserId,
    ) -> Result<()> {
        self.engine
            .dispatcher()
            .force_status(agent_id, status, supervisor_id)
            .await
    }

    /// Snoop both directions of a contact's live call from the
    /// supervisor's extension
    pub async fn spy_call(&self, contact_id: ContactId, supervisor_extension: &str) -> Result<()> {
        self.engine.spy_call(contact_id, supervisor_extension).await
    }

    /// An agent's break history since `since`, newest first
    pub async fn agent_breaks(
        &self,
        agent_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BreakRecord>> {
        self.engine.database().list_breaks(agent_id, since).await
    }
}
