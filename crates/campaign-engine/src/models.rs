//! Domain model shared across the engine.
//!
//! Campaigns, contacts, menus, and commitments are persisted in the
//! primary store; agent state and the wait queue live only in process
//! memory and are owned by the dispatcher. Enumerations are stored as
//! TEXT through their `as_str`/`parse` pairs.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub type CampaignId = i64;
pub type ContactId = i64;
pub type UserId = i64;

/// Campaign life-cycle status.
///
/// Transitions are monotonic toward COMPLETED/CANCELLED except for the
/// SCHEDULED ↔ RUNNING ↔ PAUSED cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignStatus {
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Scheduled => "SCHEDULED",
            CampaignStatus::Running => "RUNNING",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Cancelled => "CANCELLED",
            CampaignStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Cancelled | CampaignStatus::Completed)
    }

    /// Whether the status holds reserved channel budget
    pub fn holds_channels(&self) -> bool {
        !self.is_terminal()
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(CampaignStatus::Scheduled),
            "RUNNING" => Ok(CampaignStatus::Running),
            "PAUSED" => Ok(CampaignStatus::Paused),
            "CANCELLED" => Ok(CampaignStatus::Cancelled),
            "COMPLETED" => Ok(CampaignStatus::Completed),
            _ => Err(format!("unknown campaign status: {}", s)),
        }
    }
}

/// Contact dial status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    NotCalled,
    Calling,
    Success,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::NotCalled => "NOT_CALLED",
            CallStatus::Calling => "CALLING",
            CallStatus::Success => "SUCCESS",
            CallStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NOT_CALLED" => Ok(CallStatus::NotCalled),
            "CALLING" => Ok(CallStatus::Calling),
            "SUCCESS" => Ok(CallStatus::Success),
            "FAILED" => Ok(CallStatus::Failed),
            _ => Err(format!("unknown call status: {}", s)),
        }
    }
}

/// A dialing campaign.
///
/// `start_date`/`end_date` are local wall-clock; the scheduler compares
/// them against the host's local time.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    pub max_retries: i32,
    pub concurrent_calls: i32,
    pub retry_on_answer: bool,
    pub status: CampaignStatus,
    pub user_id: UserId,
}

impl Campaign {
    /// Whether `now` falls inside the campaign window
    pub fn in_window(&self, now: NaiveDateTime) -> bool {
        self.start_date <= now && now < self.end_date
    }
}

/// A phone contact belonging to a campaign
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: ContactId,
    pub campaign_id: CampaignId,
    pub phone: String,
    pub message: String,
    pub sequence: i64,
    pub attempt_count: i32,
    pub call_status: CallStatus,
    pub hangup_code: Option<String>,
    pub hangup_cause: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub active_channel_id: Option<String>,
}

/// Post-call menu attached 1-1 to a campaign.
///
/// Stored as a JSON document; message texts may carry the textual
/// placeholders `{position}` and `{day}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCallMenu {
    pub campaign_id: CampaignId,
    pub active: bool,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub queue_message: Option<String>,
    #[serde(default)]
    pub confirmation_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub options: Vec<MenuOption>,
}

/// One selectable option of a post-call menu
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuOption {
    /// DTMF key selecting this option
    pub key: String,
    pub action: MenuAction,
    /// Descriptor used when auto-assembling the greeting
    pub text: String,
    #[serde(default)]
    pub steps: Vec<MenuStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuAction {
    TransferAgent,
    PaymentCommitment,
}

/// One data-capture step inside a menu option
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuStep {
    pub prompt: String,
    pub capture: CaptureMode,
    #[serde(default)]
    pub validation: StepValidation,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Key under which the captured value lands in the answer map
    pub save_as: String,
}

/// DTMF capture mode of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaptureMode {
    SingleDigit,
    Numeric {
        #[serde(rename = "maxDigits")]
        max_digits: u32,
    },
}

/// Validation applied to a captured value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepValidation {
    #[default]
    None,
    #[serde(rename = "day_1_28")]
    Day1To28,
    DayLaborable,
}

/// Source of a payment commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentSource {
    Automatic,
    Manual,
}

impl CommitmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentSource::Automatic => "AUTOMATIC",
            CommitmentSource::Manual => "MANUAL",
        }
    }
}

/// A persisted payment commitment
#[derive(Debug, Clone)]
pub struct Commitment {
    pub id: i64,
    pub contact_id: ContactId,
    pub campaign_id: CampaignId,
    pub commitment_date: NaiveDate,
    pub source: CommitmentSource,
    pub agent_id: Option<UserId>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user channel budget row
#[derive(Debug, Clone, Copy)]
pub struct ChannelBudget {
    pub user_id: UserId,
    pub max_channels: i32,
    pub used_channels: i32,
}

/// In-memory agent availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Available,
    OnCall,
    OnBreak,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Available => "AVAILABLE",
            AgentStatus::OnCall => "ON_CALL",
            AgentStatus::OnBreak => "ON_BREAK",
            AgentStatus::Offline => "OFFLINE",
        }
    }
}

/// Why a break record was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakEndReason {
    Returned,
    Disconnected,
    ForcedBySupervisor,
    StillActive,
}

impl BreakEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakEndReason::Returned => "RETURNED",
            BreakEndReason::Disconnected => "DISCONNECTED",
            BreakEndReason::ForcedBySupervisor => "FORCED_BY_SUPERVISOR",
            BreakEndReason::StillActive => "STILL_ACTIVE",
        }
    }
}

/// Agent-call event log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEventKind {
    Assigned,
    Connected,
    Finished,
    Timeout,
    ClientAbandoned,
}

impl CallEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallEventKind::Assigned => "ASSIGNED",
            CallEventKind::Connected => "CONNECTED",
            CallEventKind::Finished => "FINISHED",
            CallEventKind::Timeout => "TIMEOUT",
            CallEventKind::ClientAbandoned => "CLIENT_ABANDONED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_status_round_trips() {
        for status in [
            CampaignStatus::Scheduled,
            CampaignStatus::Running,
            CampaignStatus::Paused,
            CampaignStatus::Cancelled,
            CampaignStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<CampaignStatus>().unwrap(), status);
        }
        assert!("DRAFT".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn terminal_statuses_release_channels() {
        assert!(CampaignStatus::Running.holds_channels());
        assert!(CampaignStatus::Paused.holds_channels());
        assert!(!CampaignStatus::Completed.holds_channels());
        assert!(!CampaignStatus::Cancelled.holds_channels());
    }

    #[test]
    fn menu_document_round_trips() {
        let raw = r#"{
            "campaignId": 7,
            "active": true,
            "greeting": "Press 1 for commitment.",
            "options": [
                {
                    "key": "1",
                    "action": "payment_commitment",
                    "text": "register a payment commitment",
                    "steps": [
                        {
                            "prompt": "Enter day",
                            "capture": {"mode": "numeric", "maxDigits": 2},
                            "validation": "day_1_28",
                            "errorMessage": "Invalid day",
                            "saveAs": "commitmentDay"
                        }
                    ]
                },
                {"key": "2", "action": "transfer_agent", "text": "talk to an agent"}
            ]
        }"#;
        let menu: PostCallMenu = serde_json::from_str(raw).unwrap();
        assert_eq!(menu.campaign_id, 7);
        assert_eq!(menu.options.len(), 2);
        assert_eq!(menu.options[0].action, MenuAction::PaymentCommitment);
        match menu.options[0].steps[0].capture {
            CaptureMode::Numeric { max_digits } => assert_eq!(max_digits, 2),
            other => panic!("unexpected capture: {:?}", other),
        }
        assert_eq!(menu.options[1].steps.len(), 0);
        assert_eq!(menu.options[1].action, MenuAction::TransferAgent);

        let back = serde_json::to_string(&menu).unwrap();
        let reparsed: PostCallMenu = serde_json::from_str(&back).unwrap();
        assert_eq!(reparsed.options[0].steps[0].save_as, "commitmentDay");
    }

    #[test]
    fn campaign_window_bounds() {
        let campaign = Campaign {
            id: 1,
            name: "test".into(),
            start_date: "2026-03-01T08:00:00".parse().unwrap(),
            end_date: "2026-03-01T20:00:00".parse().unwrap(),
            max_retries: 2,
            concurrent_calls: 3,
            retry_on_answer: false,
            status: CampaignStatus::Running,
            user_id: 1,
        };
        assert!(!campaign.in_window("2026-03-01T07:59:59".parse().unwrap()));
        assert!(campaign.in_window("2026-03-01T08:00:00".parse().unwrap()));
        assert!(!campaign.in_window("2026-03-01T20:00:00".parse().unwrap()));
    }
}
