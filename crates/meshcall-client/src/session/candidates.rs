//! Per-peer buffering of remote ICE candidates

use meshcall_protocol::IceCandidate;
use std::collections::VecDeque;

/// Outcome of handing a candidate to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The remote description is in place; apply right away
    Apply(IceCandidate),
    /// Buffered; `first` is set for the candidate that started the backlog
    Queued { first: bool },
}

/// FIFO of candidates that arrived before the remote description.
///
/// The backlog drains exactly once. Candidates admitted after that are
/// handed straight back for immediate application.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, candidate: IceCandidate) -> Admission {
        if self.drained {
            return Admission::Apply(candidate);
        }
        self.pending.push_back(candidate);
        Admission::Queued {
            first: self.pending.len() == 1,
        }
    }

    /// Release the backlog in arrival order. Returns `None` on every call
    /// after the first.
    pub fn drain(&mut self) -> Option<Vec<IceCandidate>> {
        if self.drained {
            return None;
        }
        self.drained = true;
        Some(self.pending.drain(..).collect())
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
