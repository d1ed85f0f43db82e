//! # outdial Campaign Engine
//!
//! Call-dispatch and call-lifecycle engine for outbound voice
//! campaigns. Given campaigns of phone contacts with a text message,
//! it keeps a bounded number of live calls per campaign under each
//! tenant's channel budget, drives every call through
//! originate → ringing → answered → playback → post-call IVR → hangup
//! over the telephony control plane, interprets per-campaign IVR
//! menus (payment commitments, agent transfer), and routes live
//! callees to call-center agents through an in-memory wait queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 OutdialEngine                  │
//! ├───────────────────────────────────────────────┤
//! │ ┌───────────┐ ┌───────────┐ ┌───────────────┐ │
//! │ │ Campaign  │ │   Call    │ │   Post-call   │ │
//! │ │ Scheduler │ │ Executor  │ │      IVR      │ │
//! │ └───────────┘ └───────────┘ └───────────────┘ │
//! │ ┌───────────┐ ┌───────────┐ ┌───────────────┐ │
//! │ │  Agent    │ │    TTS    │ │  Persistence  │ │
//! │ │Dispatcher │ │   Cache   │ │  (PostgreSQL) │ │
//! │ └───────────┘ └───────────┘ └───────────────┘ │
//! └──────────────┬───────────────────┬────────────┘
//!                │                   │
//!        ┌───────────────┐   ┌───────────────┐
//!        │  outdial-ari  │   │ outdial-push  │
//!        │  (telephony)  │   │  (dashboard)  │
//!        └───────────────┘   └───────────────┘
//! ```
//!
//! The scheduler selects contacts under row locks and launches the
//! executor into the campaign's free slots; answered channels enter
//! Stasis, play their message, and run the menu; an agent transfer
//! bridges the callee or parks it in the wait queue; every state
//! change fans out to the dashboard hub.

pub mod api;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ivr;
pub mod models;
pub mod monitor;
pub mod scheduler;
pub mod server;
pub mod tts;

pub use config::EngineConfig;
pub use engine::{EngineStats, OutdialEngine};
pub use error::{EngineError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::api::{AdminApi, AgentApi, SupervisorApi};
    pub use crate::config::{AriSettings, DatabaseSettings, EngineConfig};
    pub use crate::database::agents::AgentSeed;
    pub use crate::database::campaigns::{CampaignProgress, NewCampaign};
    pub use crate::database::commitments::NewCommitment;
    pub use crate::database::contacts::DialJob;
    pub use crate::database::Database;
    pub use crate::dispatcher::agents::{AgentState, ContactDescriptor};
    pub use crate::dispatcher::queue::QueueEntry;
    pub use crate::dispatcher::{AgentDispatcher, TransferOutcome};
    pub use crate::engine::{EngineStats, OutdialEngine};
    pub use crate::error::{EngineError, Result};
    pub use crate::models::{
        AgentStatus, BreakEndReason, CallEventKind, CallStatus, Campaign, CampaignId,
        CampaignStatus, CaptureMode, ChannelBudget, Commitment, CommitmentSource, Contact,
        ContactId, MenuAction, MenuOption, MenuStep, PostCallMenu, StepValidation, UserId,
    };
    pub use crate::scheduler::CampaignScheduler;
    pub use crate::tts::TtsEngine;
}
