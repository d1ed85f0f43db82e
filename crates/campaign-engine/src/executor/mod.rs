//! Call executor: the per-attempt channel state machine.
//!
//! One invocation of [`CallExecutor::call_with_tts`] drives one dial
//! attempt for one contact and guarantees exactly one terminal
//! persistence. Trunks are tried in configured order; an attempt
//! resolves on the first answer, on channel destruction, or on the
//! hard attempt timeout. Answered calls stay CALLING: their end is
//! signalled by `StasisEnd` and persisted by the engine's event
//! router, so a slot is released only on real hangup.

pub mod causes;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use outdial_ari::{AriClient, AriEvent};
use outdial_push::{names, PushEvent, PushHub};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::contacts::DialJob;
use crate::database::Database;
use crate::models::{CampaignId, ContactId, UserId};
use crate::tts::TtsEngine;

use causes::{hangup_cause_text, is_final_cause};

/// Ring timeout passed to the platform per trunk attempt
pub const RING_TIMEOUT_SECS: u32 = 45;

/// Hard bound on one attempt, from originate to resolution
pub const ATTEMPT_HARD_TIMEOUT: Duration = Duration::from_secs(70);

/// Per-channel call progress flags
#[derive(Debug, Clone)]
pub struct CallFlags {
    pub contact_id: ContactId,
    pub campaign_id: CampaignId,
    pub owner_id: UserId,
    pub rang: bool,
    pub up: bool,
    /// Cause observed on `ChannelDestroyed`, consumed at `StasisEnd`
    pub destroy_cause: Option<i32>,
}

/// Registry of live outbound channels.
///
/// The only mutable structure shared between the executor and the
/// engine's event router; keyed by channel id.
pub struct ChannelRegistry {
    channels: DashMap<String, CallFlags>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn insert(&self, channel_id: &str, flags: CallFlags) {
        self.channels.insert(channel_id.to_string(), flags);
    }

    pub fn remove(&self, channel_id: &str) -> Option<CallFlags> {
        self.channels.remove(channel_id).map(|(_, flags)| flags)
    }

    pub fn get(&self, channel_id: &str) -> Option<CallFlags> {
        self.channels.get(channel_id).map(|entry| entry.clone())
    }

    pub fn set_rang(&self, channel_id: &str) {
        if let Some(mut entry) = self.channels.get_mut(channel_id) {
            entry.rang = true;
        }
    }

    /// Mark the channel answered; returns `false` if it already was
    /// (the Up transition is handled at most once)
    pub fn set_up(&self, channel_id: &str) -> bool {
        match self.channels.get_mut(channel_id) {
            Some(mut entry) if !entry.up => {
                entry.up = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_destroy_cause(&self, channel_id: &str, cause: i32) {
        if let Some(mut entry) = self.channels.get_mut(channel_id) {
            entry.destroy_cause = Some(cause);
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Drop every tracked channel (control-plane outage recovery)
    pub fn clear(&self) {
        self.channels.clear();
    }
}

/// Outcome of one trunk attempt
#[derive(Debug, Clone, PartialEq)]
enum AttemptOutcome {
    /// Channel answered; cause 16 by convention
    Answered,
    /// Channel never made it up
    Failed { cause: i32 },
}

/// Drives outbound attempts through the telephony adapter
pub struct CallExecutor {
    ari: Arc<AriClient>,
    tts: Arc<TtsEngine>,
    db: Database,
    hub: Arc<PushHub>,
    channels: Arc<ChannelRegistry>,
    poke_tx: mpsc::UnboundedSender<CampaignId>,
    trunks: Vec<String>,
    caller_id: String,
}

impl CallExecutor {
    pub fn new(
        ari: Arc<AriClient>,
        tts: Arc<TtsEngine>,
        db: Database,
        hub: Arc<PushHub>,
        channels: Arc<ChannelRegistry>,
        poke_tx: mpsc::UnboundedSender<CampaignId>,
        trunks: Vec<String>,
        caller_id: String,
    ) -> Self {
        Self {
            ari,
            tts,
            db,
            hub,
            channels,
            poke_tx,
            trunks,
            caller_id,
        }
    }

    /// Run one dial attempt for a contact already promoted to CALLING.
    ///
    /// Never returns an error to the caller; failures are persisted on
    /// the contact and logged with correlation ids.
    pub async fn call_with_tts(&self, job: DialJob, owner_id: UserId) {
        let contact_id = job.contact_id;
        let campaign_id = job.campaign_id;

        info!(
            "📞 Dialing contact {} (campaign {}, attempt {})",
            contact_id, campaign_id, job.attempt_count
        );
        self.emit_call_initiated(&job, owner_id);

        // Synthesize before touching any trunk: a TTS failure is
        // terminal for the whole attempt
        if let Err(e) = self.tts.get_audio(campaign_id, &job.message).await {
            error!(
                "TTS failed for contact {} (campaign {}): {}",
                contact_id, campaign_id, e
            );
            self.finish_failed(&job, owner_id, "TTS ERROR", "TTS ERROR").await;
            return;
        }

        let mut last_cause: i32 = 31;
        for trunk in &self.trunks {
            match self.attempt_trunk(&job, owner_id, trunk).await {
                AttemptOutcome::Answered => {
                    // Contact stays CALLING; StasisEnd completes it
                    return;
                }
                AttemptOutcome::Failed { cause } => {
                    last_cause = cause;
                    if is_final_cause(cause) {
                        break;
                    }
                    warn!(
                        "Trunk {} failed for contact {} (cause {}), trying next",
                        trunk, contact_id, cause
                    );
                }
            }
        }

        self.finish_failed(
            &job,
            owner_id,
            &last_cause.to_string(),
            &hangup_cause_text(last_cause),
        )
        .await;
    }

    /// One originate on one trunk, resolved by the channel state
    /// machine below.
    async fn attempt_trunk(&self, job: &DialJob, owner_id: UserId, trunk: &str) -> AttemptOutcome {
        let channel_id = Uuid::new_v4().to_string();
        let endpoint = format!("SIP/{}/{}", trunk, job.phone);

        self.channels.insert(
            &channel_id,
            CallFlags {
                contact_id: job.contact_id,
                campaign_id: job.campaign_id,
                owner_id,
                rang: false,
                up: false,
                destroy_cause: None,
            },
        );

        if let Err(e) = self.db.set_active_channel(job.contact_id, &channel_id).await {
            error!(
                "Failed to store channel {} on contact {}: {}",
                channel_id, job.contact_id, e
            );
        }

        // Subscribe to the firehose before the originate so no early
        // event is missed
        let events = self.ari.events();

        if let Err(e) = self
            .ari
            .originate(
                &endpoint,
                &self.caller_id,
                &channel_id,
                RING_TIMEOUT_SECS,
                HashMap::new(),
            )
            .await
        {
            warn!(
                "Originate on {} failed for contact {}: {}",
                trunk, job.contact_id, e
            );
            self.channels.remove(&channel_id);
            return AttemptOutcome::Failed { cause: 31 };
        }

        let outcome = self.drive_attempt(&channel_id, events).await;

        if let AttemptOutcome::Failed { .. } = outcome {
            self.channels.remove(&channel_id);
        }
        outcome
    }

    /// Channel state machine for one attempt.
    ///
    /// - `Ringing` sets the rang flag
    /// - the first `Up` (or Stasis entry) resolves the attempt answered
    /// - `ChannelDestroyed` before Up resolves it failed with that cause
    /// - the hard timeout forces a hangup
    async fn drive_attempt(
        &self,
        channel_id: &str,
        mut events: tokio::sync::broadcast::Receiver<AriEvent>,
    ) -> AttemptOutcome {
        let deadline = tokio::time::Instant::now() + ATTEMPT_HARD_TIMEOUT;

        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("Attempt listener lagged {} events on {}", skipped, channel_id);
                    continue;
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                    return self.timeout_attempt(channel_id).await;
                }
                Err(_) => {
                    return self.timeout_attempt(channel_id).await;
                }
            };

            if event.channel_id() != Some(channel_id) {
                continue;
            }

            match event {
                AriEvent::ChannelStateChange { channel } => match channel.state.as_str() {
                    "Ringing" => self.channels.set_rang(channel_id),
                    "Up" => {
                        if self.on_answered(channel_id).await {
                            return AttemptOutcome::Answered;
                        }
                    }
                    _ => {}
                },
                AriEvent::StasisStart { .. } => {
                    // Stasis entry implies the channel is up even when
                    // the state-change frame was lost
                    if self.on_answered(channel_id).await {
                        return AttemptOutcome::Answered;
                    }
                }
                AriEvent::ChannelDestroyed { cause, .. } => {
                    let up = self
                        .channels
                        .get(channel_id)
                        .map(|f| f.up)
                        .unwrap_or(false);
                    if up {
                        return AttemptOutcome::Answered;
                    }
                    return AttemptOutcome::Failed { cause };
                }
                _ => {}
            }
        }
    }

    /// Record the answer; `true` exactly once per channel
    async fn on_answered(&self, channel_id: &str) -> bool {
        if !self.channels.set_up(channel_id) {
            return false;
        }
        let contact_id = match self.channels.get(channel_id) {
            Some(flags) => flags.contact_id,
            None => return false,
        };
        info!("✅ Contact {} answered on channel {}", contact_id, channel_id);
        if let Err(e) = self.db.mark_contact_answered(contact_id).await {
            error!("Failed to stamp answeredAt on contact {}: {}", contact_id, e);
        }
        true
    }

    /// Hard-timeout resolution: force a hangup, then classify
    async fn timeout_attempt(&self, channel_id: &str) -> AttemptOutcome {
        if let Err(e) = self.ari.hangup(channel_id).await {
            warn!("Forced hangup of {} failed: {}", channel_id, e);
        }
        let up = self
            .channels
            .get(channel_id)
            .map(|f| f.up)
            .unwrap_or(false);
        if up {
            warn!("Channel {} answered but truncated by attempt timeout", channel_id);
            AttemptOutcome::Answered
        } else {
            AttemptOutcome::Failed { cause: 19 }
        }
    }

    /// Terminal failure persistence plus the scheduler poke.
    ///
    /// The status-guarded UPDATE makes the persistence at-most-once:
    /// when another path already finished the contact (e.g. a success
    /// persisted at StasisEnd), nothing is written or emitted.
    async fn finish_failed(&self, job: &DialJob, owner_id: UserId, code: &str, cause: &str) {
        match self.db.mark_contact_failed(job.contact_id, code, cause).await {
            Ok(true) => {
                self.emit_call_finished(job, owner_id, "FAILED");
                let _ = self.poke_tx.send(job.campaign_id);
            }
            Ok(false) => {
                warn!(
                    "Contact {} was no longer CALLING at terminal persistence",
                    job.contact_id
                );
            }
            Err(e) => {
                error!("Failed to persist failure for contact {}: {}", job.contact_id, e);
            }
        }
    }

    fn emit_call_initiated(&self, job: &DialJob, owner_id: UserId) {
        let data = json!({
            "contactId": job.contact_id,
            "campaignId": job.campaign_id,
            "phone": job.phone,
            "attempt": job.attempt_count,
        });
        self.hub
            .emit_to_user(owner_id, PushEvent::new(names::CALL_INITIATED, data.clone()));
        self.hub
            .emit_to_admins(PushEvent::new(names::CALL_INITIATED, data));
    }

    fn emit_call_finished(&self, job: &DialJob, owner_id: UserId, status: &str) {
        let data = json!({
            "contactId": job.contact_id,
            "campaignId": job.campaign_id,
            "status": status,
        });
        self.hub
            .emit_to_user(owner_id, PushEvent::new(names::CALL_FINISHED, data.clone()));
        self.hub
            .emit_to_admins(PushEvent::new(names::CALL_FINISHED, data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(contact_id: ContactId) -> CallFlags {
        CallFlags {
            contact_id,
            campaign_id: 1,
            owner_id: 1,
            rang: false,
            up: false,
            destroy_cause: None,
        }
    }

    #[test]
    fn registry_set_up_fires_once() {
        let registry = ChannelRegistry::new();
        registry.insert("ch-1", flags(10));

        assert!(registry.set_up("ch-1"));
        assert!(!registry.set_up("ch-1"));
        assert!(!registry.set_up("ch-unknown"));
        assert!(registry.get("ch-1").unwrap().up);
    }

    #[test]
    fn registry_tracks_ring_and_destroy_cause() {
        let registry = ChannelRegistry::new();
        registry.insert("ch-2", flags(11));

        registry.set_rang("ch-2");
        registry.set_destroy_cause("ch-2", 16);

        let flags = registry.get("ch-2").unwrap();
        assert!(flags.rang);
        assert_eq!(flags.destroy_cause, Some(16));

        let removed = registry.remove("ch-2").unwrap();
        assert_eq!(removed.contact_id, 11);
        assert_eq!(registry.len(), 0);
    }
}
