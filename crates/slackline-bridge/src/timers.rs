use std::time::Duration;

use tokio::time::Instant;

/// The three liveness timers a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No reply at all after the prompt was delivered.
    InitialResponse,
    /// A reply was filtered and the remaining reply slots did not rescue the
    /// request in time.
    MultiReplySettle,
    /// The agent stopped editing its reply.
    UpdateLiveness,
}

impl TimerKind {
    pub const ALL: [TimerKind; 3] = [
        TimerKind::InitialResponse,
        TimerKind::MultiReplySettle,
        TimerKind::UpdateLiveness,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::InitialResponse => 0,
            TimerKind::MultiReplySettle => 1,
            TimerKind::UpdateLiveness => 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    deadline: Option<Instant>,
    arm_count: u32,
}

/// Deadline slots, one per [`TimerKind`].
///
/// The ladder never sleeps itself. The session driver waits on
/// [`next_deadline`](Self::next_deadline) and hands the expired kinds from
/// [`take_due`](Self::take_due) back to the session, so timer fires and
/// platform events are handled on the same task.
#[derive(Debug, Default, Clone)]
pub struct TimeoutLadder {
    slots: [Slot; 3],
}

impl TimeoutLadder {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)arm `kind` to fire `after` from `now`. A zero duration leaves the
    /// timer disarmed. Returns whether it was armed.
    pub fn arm(&mut self, kind: TimerKind, now: Instant, after: Duration) -> bool {
        let slot = &mut self.slots[kind.slot()];
        if after.is_zero() {
            slot.deadline = None;
            return false;
        }
        slot.deadline = Some(now + after);
        slot.arm_count += 1;
        true
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.slots[kind.slot()].deadline = None;
    }

    pub fn cancel_all(&mut self) {
        for slot in &mut self.slots {
            slot.deadline = None;
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.slot()].deadline.is_some()
    }

    /// How many times `kind` has been armed over the session's lifetime.
    pub fn arm_count(&self, kind: TimerKind) -> u32 {
        self.slots[kind.slot()].arm_count
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.slots[kind.slot()].deadline
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().filter_map(|s| s.deadline).min()
    }

    /// Disarm and return every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = TimerKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let deadline = self.deadline(kind)?;
                (deadline <= now).then_some((deadline, kind))
            })
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);
        for (_, kind) in &due {
            self.cancel(*kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}
