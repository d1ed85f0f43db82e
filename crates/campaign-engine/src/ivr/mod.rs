//! Post-call IVR.
//!
//! Entered when an answered outbound channel reaches Stasis: the
//! campaign message is played, then the campaign's menu (when active)
//! runs a greeting with DTMF anticipation, an option's capture steps,
//! and finally the option's action. A digit pressed during any prompt
//! cancels the playback and counts immediately.
//!
//! Timeouts: 8 s for the menu selection after the greeting, 15 s per
//! step after its prompt, 2 s between digits of a numeric capture.

pub mod template;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local};
use outdial_ari::{AriClient, AriEvent, ChannelEvents};
use outdial_push::{names, PushEvent, PushHub};
use serde_json::json;
#[cfg(test)]
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::database::commitments::NewCommitment;
use crate::database::Database;
use crate::dispatcher::{AgentDispatcher, TransferOutcome};
use crate::error::{EngineError, Result};
use crate::models::{
    CaptureMode, CommitmentSource, Contact, MenuAction, MenuOption, MenuStep, PostCallMenu,
};
use crate::tts::TtsEngine;

/// Wait for a selection this long after the greeting finishes
pub const MENU_DTMF_TIMEOUT: Duration = Duration::from_secs(8);

/// Wait for a step's first/only capture this long after its prompt
pub const STEP_DTMF_TIMEOUT: Duration = Duration::from_secs(15);

/// Numeric capture: digit-to-digit gap that ends the capture
pub const INTER_DIGIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on the campaign message playback itself
const MESSAGE_PLAYBACK_TIMEOUT: Duration = Duration::from_secs(600);

/// Channel-scoped events reduced to what capture cares about
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CaptureEvent {
    Digit(String),
    PlaybackDone(String),
    ChannelGone,
}

/// Result of one capture
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Capture {
    /// Digits captured; `interrupted` when the prompt was still playing
    Value { digits: String, interrupted: bool },
    NoInput,
    HungUp,
}

/// Runs the post-call sequence for one answered channel
pub struct MenuRunner {
    ari: Arc<AriClient>,
    tts: Arc<TtsEngine>,
    db: Database,
    dispatcher: Arc<AgentDispatcher>,
    hub: Arc<PushHub>,
}

impl MenuRunner {
    pub fn new(
        ari: Arc<AriClient>,
        tts: Arc<TtsEngine>,
        db: Database,
        dispatcher: Arc<AgentDispatcher>,
        hub: Arc<PushHub>,
    ) -> Self {
        Self {
            ari,
            tts,
            db,
            dispatcher,
            hub,
        }
    }

    /// Drive an answered campaign channel: message playback, then the
    /// menu. Errors are logged by the caller; the channel is hung up
    /// on every path except a successful agent transfer.
    pub async fn run_call_flow(&self, channel_id: &str, contact: &Contact) -> Result<()> {
        let mut events = EventFeed::subscribe(&self.ari, channel_id);

        // The campaign message itself
        let audio = self
            .tts
            .get_audio(contact.campaign_id, &contact.message)
            .await?;
        let playback_id = self.ari.play(channel_id, &audio).await?;
        if !events
            .await_playback_done(&playback_id, MESSAGE_PLAYBACK_TIMEOUT)
            .await
        {
            debug!("Channel {} gone during message playback", channel_id);
            return Ok(());
        }

        let menu = match self.db.get_menu(contact.campaign_id).await? {
            Some(menu) if menu.active => menu,
            _ => {
                debug!(
                    "No active menu for campaign {}, hanging up {}",
                    contact.campaign_id, channel_id
                );
                self.ari.hangup(channel_id).await.ok();
                return Ok(());
            }
        };

        self.run_menu(channel_id, contact, &menu, &mut events).await
    }

    async fn run_menu(
        &self,
        channel_id: &str,
        contact: &Contact,
        menu: &PostCallMenu,
        events: &mut EventFeed,
    ) -> Result<()> {
        let greeting = greeting_text(menu);
        let selection = self
            .prompt_and_capture(
                channel_id,
                contact.campaign_id,
                &greeting,
                CaptureMode::SingleDigit,
                MENU_DTMF_TIMEOUT,
                events,
            )
            .await?;

        let digit = match selection {
            Capture::Value { digits, .. } => digits,
            Capture::NoInput => {
                self.play_error_and_hangup(
                    channel_id,
                    contact.campaign_id,
                    menu.error_message.as_deref(),
                    events,
                )
                .await;
                return Ok(());
            }
            Capture::HungUp => return Ok(()),
        };

        let option = match menu.options.iter().find(|o| o.key == digit) {
            Some(option) => option,
            None => {
                info!("Unknown menu key '{}' on channel {}", digit, channel_id);
                self.play_error_and_hangup(
                    channel_id,
                    contact.campaign_id,
                    menu.error_message.as_deref(),
                    events,
                )
                .await;
                return Ok(());
            }
        };

        let answers = match self
            .run_steps(channel_id, contact, &option.steps, events)
            .await?
        {
            Some(answers) => answers,
            None => return Ok(()), // step aborted; channel already closed
        };

        self.dispatch_action(channel_id, contact, menu, option, answers, events)
            .await
    }

    /// Execute an option's steps in order; `None` aborts the option
    async fn run_steps(
        &self,
        channel_id: &str,
        contact: &Contact,
        steps: &[MenuStep],
        events: &mut EventFeed,
    ) -> Result<Option<HashMap<String, String>>> {
        let mut answers = HashMap::new();
        let today = Local::now().date_naive();

        for step in steps {
            let captured = self
                .prompt_and_capture(
                    channel_id,
                    contact.campaign_id,
                    &step.prompt,
                    step.capture,
                    STEP_DTMF_TIMEOUT,
                    events,
                )
                .await?;

            let digits = match captured {
                Capture::Value { digits, .. } => digits,
                Capture::NoInput => {
                    self.play_error_and_hangup(
                        channel_id,
                        contact.campaign_id,
                        step.error_message.as_deref(),
                        events,
                    )
                    .await;
                    return Ok(None);
                }
                Capture::HungUp => return Ok(None),
            };

            if !validate::validate(step.validation, &digits, today) {
                info!(
                    "Step '{}' failed validation with '{}' on channel {}",
                    step.save_as, digits, channel_id
                );
                self.play_error_and_hangup(
                    channel_id,
                    contact.campaign_id,
                    step.error_message.as_deref(),
                    events,
                )
                .await;
                return Ok(None);
            }

            answers.insert(step.save_as.clone(), digits);
        }
        Ok(Some(answers))
    }

    async fn dispatch_action(
        &self,
        channel_id: &str,
        contact: &Contact,
        menu: &PostCallMenu,
        option: &MenuOption,
        answers: HashMap<String, String>,
        events: &mut EventFeed,
    ) -> Result<()> {
        match option.action {
            MenuAction::PaymentCommitment => {
                self.record_commitment(channel_id, contact, menu, &answers, events)
                    .await
            }
            MenuAction::TransferAgent => {
                self.transfer_to_agent(channel_id, contact, menu, events).await
            }
        }
    }

    async fn record_commitment(
        &self,
        channel_id: &str,
        contact: &Contact,
        menu: &PostCallMenu,
        answers: &HashMap<String, String>,
        events: &mut EventFeed,
    ) -> Result<()> {
        let day = answers
            .get("commitmentDay")
            .and_then(|d| validate::parse_day(d))
            .ok_or_else(|| EngineError::ivr("commitmentDay missing from answers"))?;

        let today = Local::now().date_naive();
        let commitment_date = today
            .with_day(day)
            .ok_or_else(|| EngineError::ivr(format!("day {} invalid for current month", day)))?;

        self.db
            .insert_commitment(NewCommitment {
                contact_id: contact.id,
                campaign_id: contact.campaign_id,
                commitment_date,
                source: CommitmentSource::Automatic,
                agent_id: None,
                note: None,
            })
            .await?;

        self.hub.emit_to_admins(PushEvent::new(
            names::COMMITMENT_CREATED,
            json!({
                "contactId": contact.id,
                "campaignId": contact.campaign_id,
                "day": day,
                "date": commitment_date.to_string(),
            }),
        ));

        if let Some(confirmation) = &menu.confirmation_message {
            let text = template::render_one(confirmation, "day", &day.to_string());
            self.play_text(channel_id, contact.campaign_id, &text, events)
                .await;
        }
        self.ari.hangup(channel_id).await.ok();
        Ok(())
    }

    async fn transfer_to_agent(
        &self,
        channel_id: &str,
        contact: &Contact,
        menu: &PostCallMenu,
        events: &mut EventFeed,
    ) -> Result<()> {
        match self.dispatcher.transfer(contact, channel_id).await? {
            TransferOutcome::Bridged { agent_id } => {
                info!(
                    "Channel {} bridged to agent {} from the menu",
                    channel_id, agent_id
                );
                Ok(())
            }
            TransferOutcome::Queued { position } => {
                if let Some(queue_message) = &menu.queue_message {
                    let text =
                        template::render_one(queue_message, "position", &position.to_string());
                    self.play_text(channel_id, contact.campaign_id, &text, events)
                        .await;
                }
                // Queue removal on hangup is handled by the engine's
                // StasisEnd routing
                Ok(())
            }
        }
    }

    /// Synthesize and play `text`, waiting for completion (digits
    /// cancel nothing here)
    async fn play_text(
        &self,
        channel_id: &str,
        campaign_id: i64,
        text: &str,
        events: &mut EventFeed,
    ) {
        match self.tts.get_audio(campaign_id, text).await {
            Ok(audio) => match self.ari.play(channel_id, &audio).await {
                Ok(playback_id) => {
                    events
                        .await_playback_done(&playback_id, MESSAGE_PLAYBACK_TIMEOUT)
                        .await;
                }
                Err(e) => warn!("Playback failed on {}: {}", channel_id, e),
            },
            Err(e) => warn!("TTS failed for campaign {}: {}", campaign_id, e),
        }
    }

    async fn play_error_and_hangup(
        &self,
        channel_id: &str,
        campaign_id: i64,
        error_message: Option<&str>,
        events: &mut EventFeed,
    ) {
        if let Some(message) = error_message {
            self.play_text(channel_id, campaign_id, message, events).await;
        }
        self.ari.hangup(channel_id).await.ok();
    }

    /// Play a prompt and capture per the mode, with DTMF anticipation:
    /// a digit during the prompt cancels the playback.
    async fn prompt_and_capture(
        &self,
        channel_id: &str,
        campaign_id: i64,
        prompt: &str,
        mode: CaptureMode,
        after_playback: Duration,
        events: &mut EventFeed,
    ) -> Result<Capture> {
        let audio = self.tts.get_audio(campaign_id, prompt).await?;
        let playback_id = self.ari.play(channel_id, &audio).await?;

        let captured = match mode {
            CaptureMode::SingleDigit => {
                events.capture_single(&playback_id, after_playback).await
            }
            CaptureMode::Numeric { max_digits } => {
                events
                    .capture_numeric(&playback_id, max_digits as usize, after_playback)
                    .await
            }
        };

        if let Capture::Value {
            interrupted: true, ..
        } = &captured
        {
            self.ari.stop_playback(&playback_id).await.ok();
        }
        Ok(captured)
    }
}

/// Auto-assemble the greeting when the menu has no explicit text
pub(crate) fn greeting_text(menu: &PostCallMenu) -> String {
    if let Some(greeting) = &menu.greeting {
        return greeting.clone();
    }
    menu.options
        .iter()
        .map(|option| format!("Press {} to {}.", option.key, option.text))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Channel event feed reduced to capture events.
///
/// Wraps the per-channel adapter subscription; the test suite drives
/// the same capture logic through [`EventFeed::from_receiver`].
pub(crate) struct EventFeed {
    source: FeedSource,
}

enum FeedSource {
    Channel(ChannelEvents),
    #[cfg(test)]
    Raw(mpsc::UnboundedReceiver<CaptureEvent>),
}

impl EventFeed {
    pub(crate) fn subscribe(ari: &AriClient, channel_id: &str) -> Self {
        Self {
            source: FeedSource::Channel(ari.subscribe_channel(channel_id)),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(rx: mpsc::UnboundedReceiver<CaptureEvent>) -> Self {
        Self {
            source: FeedSource::Raw(rx),
        }
    }

    async fn next(&mut self) -> Option<CaptureEvent> {
        loop {
            match &mut self.source {
                #[cfg(test)]
                FeedSource::Raw(rx) => return rx.recv().await,
                FeedSource::Channel(events) => match events.recv().await? {
                    AriEvent::ChannelDtmfReceived { digit, .. } => {
                        return Some(CaptureEvent::Digit(digit))
                    }
                    AriEvent::PlaybackFinished { playback } => {
                        return Some(CaptureEvent::PlaybackDone(playback.id))
                    }
                    AriEvent::StasisEnd { .. } | AriEvent::ChannelDestroyed { .. } => {
                        return Some(CaptureEvent::ChannelGone)
                    }
                    _ => continue,
                },
            }
        }
    }

    /// Wait until `playback_id` completes. `false` when the channel
    /// went away first (or the bound elapsed).
    pub(crate) async fn await_playback_done(
        &mut self,
        playback_id: &str,
        bound: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            match tokio::time::timeout_at(deadline, self.next()).await {
                Ok(Some(CaptureEvent::PlaybackDone(id))) if id == playback_id => return true,
                Ok(Some(CaptureEvent::ChannelGone)) | Ok(None) => return false,
                Ok(Some(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Single-digit capture with anticipation: the first digit wins,
    /// even during the prompt; `after_playback` past the prompt's end
    /// with no digit is NoInput.
    pub(crate) async fn capture_single(
        &mut self,
        playback_id: &str,
        after_playback: Duration,
    ) -> Capture {
        let mut playback_done = false;
        loop {
            let event = if playback_done {
                match tokio::time::timeout(after_playback, self.next()).await {
                    Ok(event) => event,
                    Err(_) => return Capture::NoInput,
                }
            } else {
                self.next().await
            };

            match event {
                Some(CaptureEvent::Digit(digit)) => {
                    return Capture::Value {
                        digits: digit,
                        interrupted: !playback_done,
                    }
                }
                Some(CaptureEvent::PlaybackDone(id)) if id == playback_id => {
                    playback_done = true;
                }
                Some(CaptureEvent::PlaybackDone(_)) => continue,
                Some(CaptureEvent::ChannelGone) | None => return Capture::HungUp,
            }
        }
    }

    /// Numeric capture: digits collected in order; the inter-digit
    /// timer ends the capture once at least one digit arrived;
    /// `max_digits` ends it immediately.
    pub(crate) async fn capture_numeric(
        &mut self,
        playback_id: &str,
        max_digits: usize,
        after_playback: Duration,
    ) -> Capture {
        let mut digits = String::new();
        let mut playback_done = false;
        let mut interrupted = false;

        loop {
            if digits.len() >= max_digits {
                return Capture::Value { digits, interrupted };
            }

            let event = if !digits.is_empty() {
                match tokio::time::timeout(INTER_DIGIT_TIMEOUT, self.next()).await {
                    Ok(event) => event,
                    Err(_) => return Capture::Value { digits, interrupted },
                }
            } else if playback_done {
                match tokio::time::timeout(after_playback, self.next()).await {
                    Ok(event) => event,
                    Err(_) => return Capture::NoInput,
                }
            } else {
                self.next().await
            };

            match event {
                Some(CaptureEvent::Digit(digit)) => {
                    if !playback_done {
                        interrupted = true;
                    }
                    digits.push_str(&digit);
                }
                Some(CaptureEvent::PlaybackDone(id)) if id == playback_id => {
                    playback_done = true;
                }
                Some(CaptureEvent::PlaybackDone(_)) => continue,
                Some(CaptureEvent::ChannelGone) | None => return Capture::HungUp,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MenuAction, MenuOption};

    fn feed(events: Vec<CaptureEvent>) -> EventFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        // Keep the sender alive inside the feed? Dropping it closes the
        // stream, which reads as a hangup; tests that need timeouts
        // leak the sender instead.
        std::mem::forget(tx);
        EventFeed::from_receiver(rx)
    }

    fn feed_closing(events: Vec<CaptureEvent>) -> EventFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        EventFeed::from_receiver(rx)
    }

    #[tokio::test(start_paused = true)]
    async fn single_digit_during_playback_interrupts() {
        let mut feed = feed(vec![CaptureEvent::Digit("1".into())]);
        let captured = feed.capture_single("pb", MENU_DTMF_TIMEOUT).await;
        assert_eq!(
            captured,
            Capture::Value {
                digits: "1".into(),
                interrupted: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_digit_after_playback() {
        let mut feed = feed(vec![
            CaptureEvent::PlaybackDone("pb".into()),
            CaptureEvent::Digit("2".into()),
        ]);
        let captured = feed.capture_single("pb", MENU_DTMF_TIMEOUT).await;
        assert_eq!(
            captured,
            Capture::Value {
                digits: "2".into(),
                interrupted: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_digit_times_out_after_playback() {
        let mut feed = feed(vec![CaptureEvent::PlaybackDone("pb".into())]);
        let captured = feed.capture_single("pb", MENU_DTMF_TIMEOUT).await;
        assert_eq!(captured, Capture::NoInput);
    }

    #[tokio::test(start_paused = true)]
    async fn hangup_during_capture() {
        let mut feed = feed_closing(vec![CaptureEvent::ChannelGone]);
        let captured = feed.capture_single("pb", MENU_DTMF_TIMEOUT).await;
        assert_eq!(captured, Capture::HungUp);
    }

    #[tokio::test(start_paused = true)]
    async fn numeric_stops_at_max_digits() {
        let mut feed = feed(vec![
            CaptureEvent::PlaybackDone("pb".into()),
            CaptureEvent::Digit("1".into()),
            CaptureEvent::Digit("5".into()),
        ]);
        let captured = feed.capture_numeric("pb", 2, STEP_DTMF_TIMEOUT).await;
        assert_eq!(
            captured,
            Capture::Value {
                digits: "15".into(),
                interrupted: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn numeric_inter_digit_pause_ends_capture() {
        // One digit arrives, then silence: the 2 s inter-digit timer
        // must close the capture with what was collected
        let mut feed = feed(vec![
            CaptureEvent::PlaybackDone("pb".into()),
            CaptureEvent::Digit("7".into()),
        ]);
        let captured = feed.capture_numeric("pb", 4, STEP_DTMF_TIMEOUT).await;
        assert_eq!(
            captured,
            Capture::Value {
                digits: "7".into(),
                interrupted: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn numeric_digits_during_prompt_anticipate() {
        // Digits before the prompt finishes mark the capture
        // interrupted so the caller can cancel the playback
        let mut feed = feed(vec![
            CaptureEvent::Digit("1".into()),
            CaptureEvent::Digit("5".into()),
        ]);
        let captured = feed.capture_numeric("pb", 2, STEP_DTMF_TIMEOUT).await;
        assert_eq!(
            captured,
            Capture::Value {
                digits: "15".into(),
                interrupted: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn numeric_no_digits_is_no_input() {
        let mut feed = feed(vec![CaptureEvent::PlaybackDone("pb".into())]);
        let captured = feed.capture_numeric("pb", 2, STEP_DTMF_TIMEOUT).await;
        assert_eq!(captured, Capture::NoInput);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_playback_ids_are_ignored() {
        let mut feed = feed(vec![
            CaptureEvent::PlaybackDone("other".into()),
            CaptureEvent::PlaybackDone("pb".into()),
        ]);
        assert!(feed.await_playback_done("pb", Duration::from_secs(60)).await);
    }

    #[test]
    fn greeting_auto_assembles_from_options() {
        let menu = PostCallMenu {
            campaign_id: 1,
            active: true,
            greeting: None,
            queue_message: None,
            confirmation_message: None,
            error_message: None,
            options: vec![
                MenuOption {
                    key: "1".into(),
                    action: MenuAction::PaymentCommitment,
                    text: "register a commitment".into(),
                    steps: vec![],
                },
                MenuOption {
                    key: "2".into(),
                    action: MenuAction::TransferAgent,
                    text: "talk to an agent".into(),
                    steps: vec![],
                },
            ],
        };
        assert_eq!(
            greeting_text(&menu),
            "Press 1 to register a commitment. Press 2 to talk to an agent."
        );

        let with_greeting = PostCallMenu {
            greeting: Some("Welcome.".into()),
            ..menu
        };
        assert_eq!(greeting_text(&with_greeting), "Welcome.");
    }
}
