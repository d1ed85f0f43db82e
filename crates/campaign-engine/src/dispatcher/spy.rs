//! Supervisor call snooping.
//!
//! `spy_call` originates a local leg to the supervisor's extension,
//! tagged with `SPY_LEG`/`SPY_MASTER_ID` channel variables. When that
//! leg enters Stasis the engine's router hands it back here: the leg
//! is answered and the waiting `spy_call` resumes through a oneshot
//! keyed `supervisor_answered_<id>` (or `supervisor_failed_<id>` when
//! the leg dies first). A snoop channel against the callee's live
//! channel and the supervisor leg are then mixed into a fresh bridge,
//! torn down when the supervisor hangs up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use outdial_ari::AriClient;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// How long the supervisor's leg may ring
const SPY_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Live spy session resources, torn down on the supervisor's hangup
struct SpySession {
    bridge_id: String,
    snoop_channel_id: String,
}

/// Coordinates supervisor snoop legs
pub struct SpyCoordinator {
    ari: Arc<AriClient>,
    /// Supervisor legs we originated, awaiting Stasis entry
    pending_legs: DashMap<String, String>,
    /// Oneshot waiters keyed `supervisor_{answered,failed}_<id>`
    waiters: DashMap<String, oneshot::Sender<()>>,
    /// Active sessions keyed by supervisor leg channel id
    sessions: DashMap<String, SpySession>,
}

impl SpyCoordinator {
    pub fn new(ari: Arc<AriClient>) -> Self {
        Self {
            ari,
            pending_legs: DashMap::new(),
            waiters: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Listen in on a live call, both directions mixed to the
    /// supervisor's extension.
    pub async fn spy_call(
        &self,
        callee_channel_id: &str,
        supervisor_extension: &str,
    ) -> Result<()> {
        let correlation_id = Uuid::new_v4().to_string();
        let leg_channel_id = Uuid::new_v4().to_string();

        let (answered_tx, answered_rx) = oneshot::channel();
        let (failed_tx, failed_rx) = oneshot::channel();
        self.waiters
            .insert(format!("supervisor_answered_{}", correlation_id), answered_tx);
        self.waiters
            .insert(format!("supervisor_failed_{}", correlation_id), failed_tx);
        self.pending_legs
            .insert(leg_channel_id.clone(), correlation_id.clone());

        let mut variables = HashMap::new();
        variables.insert("SPY_LEG".to_string(), "true".to_string());
        variables.insert("SPY_MASTER_ID".to_string(), correlation_id.clone());

        let endpoint = format!("SIP/{}", supervisor_extension);
        if let Err(e) = self
            .ari
            .originate(
                &endpoint,
                "supervisor",
                &leg_channel_id,
                SPY_ANSWER_TIMEOUT.as_secs() as u32,
                variables,
            )
            .await
        {
            self.abandon(&leg_channel_id, &correlation_id);
            return Err(e.into());
        }

        let answered = tokio::select! {
            r = answered_rx => r.is_ok(),
            r = failed_rx => { let _ = r; false }
            _ = tokio::time::sleep(SPY_ANSWER_TIMEOUT) => false,
        };

        if !answered {
            warn!(
                "Supervisor leg {} never answered (correlation {})",
                leg_channel_id, correlation_id
            );
            self.abandon(&leg_channel_id, &correlation_id);
            self.ari.hangup(&leg_channel_id).await.ok();
            return Err(EngineError::dispatcher("supervisor did not answer"));
        }
        self.cleanup_waiters(&correlation_id);

        // Snoop both directions of the live call and mix with the
        // supervisor leg
        let snoop_channel_id = self.ari.snoop(callee_channel_id, "both").await?;
        let bridge_id = match self.ari.create_bridge().await {
            Ok(id) => id,
            Err(e) => {
                self.ari.hangup(&snoop_channel_id).await.ok();
                self.ari.hangup(&leg_channel_id).await.ok();
                return Err(e.into());
            }
        };
        self.ari
            .add_channel_to_bridge(&bridge_id, &snoop_channel_id)
            .await?;
        self.ari
            .add_channel_to_bridge(&bridge_id, &leg_channel_id)
            .await?;

        self.sessions.insert(
            leg_channel_id.clone(),
            SpySession {
                bridge_id,
                snoop_channel_id,
            },
        );
        info!(
            "🕵️ Spy session up: supervisor leg {} on channel {}",
            leg_channel_id, callee_channel_id
        );
        Ok(())
    }

    /// Router hook: a channel entered Stasis. Returns `true` when it
    /// was a pending supervisor leg (now answered).
    pub async fn on_stasis_start(&self, channel_id: &str) -> bool {
        let correlation_id = match self.pending_legs.remove(channel_id) {
            Some((_, id)) => id,
            None => return false,
        };
        if let Err(e) = self.ari.answer(channel_id).await {
            warn!("Failed to answer spy leg {}: {}", channel_id, e);
            self.fire(&format!("supervisor_failed_{}", correlation_id));
            return true;
        }
        self.fire(&format!("supervisor_answered_{}", correlation_id));
        true
    }

    /// Router hook: a channel was destroyed before entering Stasis
    pub fn on_channel_destroyed(&self, channel_id: &str) {
        if let Some((_, correlation_id)) = self.pending_legs.remove(channel_id) {
            self.fire(&format!("supervisor_failed_{}", correlation_id));
        }
    }

    /// Router hook: a channel left Stasis. Tears down the session
    /// when it was a supervisor leg.
    pub async fn on_stasis_end(&self, channel_id: &str) -> bool {
        let session = match self.sessions.remove(channel_id) {
            Some((_, session)) => session,
            None => return false,
        };
        info!("🕵️ Spy session on leg {} ended", channel_id);
        self.ari.destroy_bridge(&session.bridge_id).await.ok();
        self.ari.hangup(&session.snoop_channel_id).await.ok();
        true
    }

    fn fire(&self, key: &str) {
        if let Some((_, tx)) = self.waiters.remove(key) {
            let _ = tx.send(());
        }
    }

    fn cleanup_waiters(&self, correlation_id: &str) {
        self.waiters
            .remove(&format!("supervisor_answered_{}", correlation_id));
        self.waiters
            .remove(&format!("supervisor_failed_{}", correlation_id));
    }

    fn abandon(&self, leg_channel_id: &str, correlation_id: &str) {
        self.pending_legs.remove(leg_channel_id);
        self.cleanup_waiters(correlation_id);
    }
}
