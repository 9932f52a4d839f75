//! Multi-reply arbitration.
//!
//! When several replies are requested at once they race. The first one that
//! is finished, or that has been edited often enough while holding the lowest
//! id, wins; every other candidate is discarded for good.

use std::collections::{BTreeMap, HashSet};

use slackline_common::MessageId;

#[derive(Debug, Default, Clone)]
pub struct Reconciler {
    candidates: BTreeMap<MessageId, u32>,
    rejected: HashSet<MessageId>,
    canonical: Option<MessageId>,
    total_candidates_seen: usize,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canonical(&self) -> Option<&MessageId> {
        self.canonical.as_ref()
    }

    pub fn rejected(&self) -> &HashSet<MessageId> {
        &self.rejected
    }

    pub fn is_rejected(&self, id: &MessageId) -> bool {
        self.rejected.contains(id)
    }

    pub fn candidates(&self) -> &BTreeMap<MessageId, u32> {
        &self.candidates
    }

    pub fn edit_count(&self, id: &MessageId) -> u32 {
        self.candidates.get(id).copied().unwrap_or(0)
    }

    pub fn total_candidates_seen(&self) -> usize {
        self.total_candidates_seen
    }

    /// Start tracking `id` if it is new. Returns whether it was.
    pub fn observe(&mut self, id: &MessageId) -> bool {
        if self.candidates.contains_key(id) {
            return false;
        }
        self.candidates.insert(id.clone(), 0);
        true
    }

    /// Count one edit that passed the content filter.
    pub fn record_edit(&mut self, id: &MessageId) -> u32 {
        let count = self.candidates.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Whether `id` should become canonical now.
    ///
    /// Finished replies always qualify. With a single reply requested the
    /// first passing edit qualifies. Otherwise the candidate needs
    /// `2 × min(multi_response, 2)` edits, at least `multi_response − 1`
    /// candidates must have shown up, and it must hold the lowest id.
    pub fn should_commit(&self, id: &MessageId, is_final: bool, multi_response: u32) -> bool {
        if self.canonical.is_some() || self.rejected.contains(id) {
            return false;
        }
        if is_final || multi_response <= 1 {
            return true;
        }
        let threshold = 2 * multi_response.min(2);
        let enough_edits = self.edit_count(id) >= threshold;
        let enough_seen = self.candidates.len() >= (multi_response - 1) as usize;
        let lowest = self.candidates.keys().next() == Some(id);
        enough_edits && enough_seen && lowest
    }

    /// Make `id` canonical and discard every other candidate. Returns how many
    /// were discarded. Has no effect once a canonical reply exists.
    pub fn commit(&mut self, id: &MessageId) -> usize {
        if self.canonical.is_some() {
            return 0;
        }
        let count = self.candidates.remove(id).unwrap_or(0);
        let discarded = std::mem::take(&mut self.candidates);
        let discarded_count = discarded.len();
        self.rejected.extend(discarded.into_keys());
        self.total_candidates_seen += discarded_count;
        self.candidates.insert(id.clone(), count);
        self.canonical = Some(id.clone());
        discarded_count
    }

    /// Permanently exclude `id`.
    pub fn reject(&mut self, id: &MessageId) {
        self.candidates.remove(id);
        if self.rejected.insert(id.clone()) {
            self.total_candidates_seen += 1;
        }
    }

    /// Forget in-flight candidates before a fresh delivery attempt. Rejected
    /// ids stay rejected.
    pub fn reset_candidates(&mut self) {
        self.candidates.clear();
    }
}
