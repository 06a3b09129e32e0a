use std::{
    collections::VecDeque,
    fmt,
    time::Instant,
};

use interlink_common::{envelope::TIMEOUT_MESSAGE, Answer};

/// Callback invoked with the answer to one call
pub type AnswerCallback = Box<dyn FnOnce(Answer)>;

struct PendingCall {
    method:   String,
    /// `None` once the deadline fired; the entry then only absorbs the late
    /// response so later answers stay aligned.
    callback: Option<AnswerCallback>,
    deadline: Option<Instant>,
}

/// What happened to an answer handed to [`PendingCalls::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The head callback was invoked
    Delivered {
        /// Method of the call that was answered
        method: String,
    },
    /// The head call had already timed out; the answer was dropped
    Late {
        /// Method of the call that was answered
        method: String,
    },
    /// No call was waiting
    Unexpected,
}

/// FIFO queue of calls awaiting answers on one channel.
///
/// There are no request identifiers on the wire: the n-th answer read from a
/// channel belongs to the n-th call written to it.
#[derive(Default)]
pub struct PendingCalls {
    queue: VecDeque<PendingCall>,
}

impl fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCalls")
            .field("in_flight", &self.in_flight())
            .field("awaiting", &self.awaiting())
            .finish()
    }
}

impl PendingCalls {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a call at the tail
    pub fn push(&mut self, method: &str, callback: AnswerCallback, deadline: Option<Instant>) {
        self.queue.push_back(PendingCall {
            method: method.to_string(),
            callback: Some(callback),
            deadline,
        });
    }

    /// Matches `answer` to the oldest outstanding call
    pub fn resolve(&mut self, answer: Answer) -> Resolution {
        let Some(call) = self.queue.pop_front() else {
            return Resolution::Unexpected;
        };

        match call.callback {
            Some(callback) => {
                callback(answer);
                Resolution::Delivered {
                    method: call.method,
                }
            }
            None => {
                Resolution::Late {
                    method: call.method,
                }
            }
        }
    }

    /// Fires the timeout answer for every live call whose deadline is at or
    /// before `now`, oldest first. Returns how many fired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for call in self.queue.iter_mut() {
            let overdue = call.deadline.is_some_and(|deadline| deadline <= now);
            if !overdue {
                continue;
            }
            if let Some(callback) = call.callback.take() {
                tracing::debug!(method = %call.method, "Pending call timed out");
                callback(Answer::error(TIMEOUT_MESSAGE));
                fired += 1;
            }
        }
        fired
    }

    /// Calls written but not yet answered, including timed-out ones
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Calls whose callback has not fired yet
    pub fn awaiting(&self) -> usize {
        self.queue
            .iter()
            .filter(|call| call.callback.is_some())
            .count()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every entry without invoking any callback. Returns how many
    /// live callbacks were abandoned.
    pub fn abandon(&mut self) -> usize {
        let abandoned = self.awaiting();
        self.queue.clear();
        abandoned
    }
}
