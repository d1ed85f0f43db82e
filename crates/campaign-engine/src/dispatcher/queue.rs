//! FIFO wait queue for callers awaiting an agent.
//!
//! Positions are 1-based and renumbered after every mutation, so they
//! always form a contiguous `1..n` sequence.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::models::{CampaignId, ContactId};

/// One caller waiting in line
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub contact_id: ContactId,
    pub campaign_id: CampaignId,
    pub phone: String,
    pub channel_id: String,
    pub queued_at: DateTime<Utc>,
    pub position: usize,
}

impl QueueEntry {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "contactId": self.contact_id,
            "campaignId": self.campaign_id,
            "position": self.position,
            "queuedAt": self.queued_at.to_rfc3339(),
        })
    }
}

/// In-memory FIFO of waiting callers
pub struct WaitQueue {
    entries: VecDeque<QueueEntry>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a caller; returns its 1-based position
    pub fn enqueue(
        &mut self,
        contact_id: ContactId,
        campaign_id: CampaignId,
        phone: &str,
        channel_id: &str,
    ) -> usize {
        self.entries.push_back(QueueEntry {
            contact_id,
            campaign_id,
            phone: phone.to_string(),
            channel_id: channel_id.to_string(),
            queued_at: Utc::now(),
            position: 0,
        });
        self.renumber();
        self.entries.len()
    }

    /// Take the longest-waiting caller
    pub fn dequeue_head(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front();
        self.renumber();
        entry
    }

    /// Return a caller to the head of the line (failed assignment)
    pub fn push_front(&mut self, entry: QueueEntry) {
        self.entries.push_front(entry);
        self.renumber();
    }

    /// Remove a caller by contact id
    pub fn remove_by_contact(&mut self, contact_id: ContactId) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.contact_id == contact_id)?;
        let entry = self.entries.remove(index);
        self.renumber();
        entry
    }

    /// Remove a caller by its channel id (hangup while waiting)
    pub fn remove_by_channel(&mut self, channel_id: &str) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.channel_id == channel_id)?;
        let entry = self.entries.remove(index);
        self.renumber();
        entry
    }

    /// Drain entries waiting longer than `timeout`
    pub fn drain_expired(&mut self, timeout: Duration) -> Vec<QueueEntry> {
        let now = Utc::now();
        let mut expired = Vec::new();
        self.entries.retain(|entry| {
            if now.signed_duration_since(entry.queued_at) > timeout {
                expired.push(entry.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            self.renumber();
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest current wait in seconds
    pub fn longest_wait_seconds(&self) -> i64 {
        let now = Utc::now();
        self.entries
            .iter()
            .map(|e| now.signed_duration_since(e.queued_at).num_seconds())
            .max()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    fn renumber(&mut self) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            entry.position = index + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous(queue: &WaitQueue) {
        for (index, entry) in queue.snapshot().iter().enumerate() {
            assert_eq!(entry.position, index + 1);
        }
    }

    #[test]
    fn enqueue_assigns_sequential_positions() {
        let mut queue = WaitQueue::new();
        assert_eq!(queue.enqueue(1, 10, "0991", "ch-1"), 1);
        assert_eq!(queue.enqueue(2, 10, "0992", "ch-2"), 2);
        assert_eq!(queue.enqueue(3, 10, "0993", "ch-3"), 3);
        assert_contiguous(&queue);
    }

    #[test]
    fn positions_recompute_after_any_removal() {
        let mut queue = WaitQueue::new();
        queue.enqueue(1, 10, "0991", "ch-1");
        queue.enqueue(2, 10, "0992", "ch-2");
        queue.enqueue(3, 10, "0993", "ch-3");

        let removed = queue.remove_by_contact(2).unwrap();
        assert_eq!(removed.position, 2);
        assert_contiguous(&queue);
        assert_eq!(queue.snapshot()[1].contact_id, 3);
        assert_eq!(queue.snapshot()[1].position, 2);
    }

    #[test]
    fn dequeue_is_fifo_and_renumbers() {
        let mut queue = WaitQueue::new();
        queue.enqueue(1, 10, "0991", "ch-1");
        queue.enqueue(2, 10, "0992", "ch-2");

        let head = queue.dequeue_head().unwrap();
        assert_eq!(head.contact_id, 1);
        assert_eq!(queue.snapshot()[0].position, 1);
        assert_eq!(queue.snapshot()[0].contact_id, 2);
    }

    #[test]
    fn push_front_returns_caller_to_head() {
        let mut queue = WaitQueue::new();
        queue.enqueue(1, 10, "0991", "ch-1");
        queue.enqueue(2, 10, "0992", "ch-2");

        let head = queue.dequeue_head().unwrap();
        queue.push_front(head);

        assert_eq!(queue.snapshot()[0].contact_id, 1);
        assert_contiguous(&queue);
    }

    #[test]
    fn remove_by_channel_covers_mid_wait_hangup() {
        let mut queue = WaitQueue::new();
        queue.enqueue(1, 10, "0991", "ch-1");
        queue.enqueue(2, 10, "0992", "ch-2");

        let removed = queue.remove_by_channel("ch-1").unwrap();
        assert_eq!(removed.contact_id, 1);
        assert!(queue.remove_by_channel("ch-1").is_none());
        assert_contiguous(&queue);
    }

    #[test]
    fn drain_expired_respects_timeout() {
        let mut queue = WaitQueue::new();
        queue.enqueue(1, 10, "0991", "ch-1");

        assert!(queue.drain_expired(Duration::seconds(300)).is_empty());
        let expired = queue.drain_expired(Duration::seconds(-1));
        assert_eq!(expired.len(), 1);
        assert!(queue.is_empty());
    }
}
