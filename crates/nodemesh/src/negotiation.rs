//! Lock negotiation state machine.
//!
//! One [`LockNegotiation`] exists per lock while that lock is in
//! resolution. An *own* negotiation drives this node's acquire or release
//! and waits for every subscribed peer to ratify it. A *tracking*
//! negotiation mirrors a peer's announced acquire or release, so that
//! callers asking about the lock meanwhile are told the outcome instead of
//! a guess.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::warn;

use nodemesh_proto::error::PeerResult;
use nodemesh_proto::lock::{Lock, LockIntent};

use crate::inbound::ConnId;

/// Where the answer of a lock call is delivered: the node now holding the
/// lock, or `None` if nobody does.
pub(crate) type LockReply = oneshot::Sender<PeerResult<Option<String>>>;

/// Life cycle of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    NegotiatingAcquire,
    NegotiatingRelease,
    Activated,
    Cancelled,
}

/// Inputs driving [`NegotiationPhase`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationInput {
    /// The acquire or release was announced.
    Begin(LockIntent),
    /// Every member of the quorum ratified (own negotiations).
    Ratified,
    /// The timeout fired first.
    TimedOut,
    /// The owning peer published the outcome (tracking negotiations).
    Concluded,
    /// Another negotiation took over the lock.
    Superseded,
}

impl NegotiationPhase {
    /// Pure transition function. `None` means the input is not valid in
    /// this phase.
    pub fn next(self, input: NegotiationInput) -> Option<NegotiationPhase> {
        use NegotiationInput::*;
        use NegotiationPhase::*;

        match (self, input) {
            (Idle, Begin(LockIntent::Acquire)) => Some(NegotiatingAcquire),
            (Idle, Begin(LockIntent::Release)) => Some(NegotiatingRelease),
            (NegotiatingAcquire | NegotiatingRelease, Ratified | TimedOut | Concluded) => {
                Some(Activated)
            }
            (Idle | NegotiatingAcquire | NegotiatingRelease, Superseded) => Some(Cancelled),
            _ => None,
        }
    }
}

/// What happens to a waiter when the negotiation it waits on resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Followup {
    /// Hand the outcome to the caller as is.
    Report,
    /// The caller wants the lock: retry the acquire if it came out free.
    Acquire,
    /// The caller wants to release: retry if this node still holds it.
    Release,
}

pub(crate) struct Waiter {
    pub reply: LockReply,
    pub followup: Followup,
}

impl Waiter {
    pub fn report(reply: LockReply) -> Self {
        Self {
            reply,
            followup: Followup::Report,
        }
    }

    pub fn then(reply: LockReply, followup: Followup) -> Self {
        Self { reply, followup }
    }
}

/// A lock in the process of resolution.
pub(crate) struct LockNegotiation {
    pub lock: Lock,
    pub intent: LockIntent,
    /// Node performing the acquire or release.
    pub owner: String,
    /// True if `owner` is this node.
    pub own: bool,
    pub phase: NegotiationPhase,
    /// Subscribers that still have to ratify (own negotiations only).
    pub pending: BTreeSet<ConnId>,
    pub waiters: Vec<Waiter>,
    /// Identifies the timer armed for this negotiation.
    pub serial: u64,
    pub started: Instant,
}

impl LockNegotiation {
    /// Negotiation for this node's own acquire or release, with the
    /// current subscribers as quorum.
    pub fn own(
        lock: Lock,
        intent: LockIntent,
        owner: &str,
        quorum: BTreeSet<ConnId>,
        serial: u64,
    ) -> Self {
        let mut neg = Self::blank(lock, intent, owner, true, serial);
        neg.pending = quorum;
        neg.advance(NegotiationInput::Begin(intent));
        neg
    }

    /// Negotiation mirroring a peer's acquire or release.
    pub fn tracking(lock: Lock, intent: LockIntent, owner: &str, serial: u64) -> Self {
        let mut neg = Self::blank(lock, intent, owner, false, serial);
        neg.advance(NegotiationInput::Begin(intent));
        neg
    }

    fn blank(lock: Lock, intent: LockIntent, owner: &str, own: bool, serial: u64) -> Self {
        Self {
            lock,
            intent,
            owner: owner.to_string(),
            own,
            phase: NegotiationPhase::Idle,
            pending: BTreeSet::new(),
            waiters: Vec::new(),
            serial,
            started: Instant::now(),
        }
    }

    /// Apply a transition; invalid inputs are logged and ignored.
    pub fn advance(&mut self, input: NegotiationInput) -> bool {
        match self.phase.next(input) {
            Some(next) => {
                self.phase = next;
                true
            }
            None => {
                warn!("lock: ignoring {:?} for {} in {:?}", input, self, self.phase);
                false
            }
        }
    }

    /// Record a ratification from `conn`. Returns false if `conn` was not
    /// expected to ratify.
    pub fn ratify(&mut self, conn: ConnId) -> bool {
        self.pending.remove(&conn)
    }

    pub fn is_ratified(&self) -> bool {
        self.pending.is_empty()
    }

    /// Move every waiter of `other` onto this negotiation.
    pub fn adopt_waiters(&mut self, other: &mut LockNegotiation) {
        self.waiters.append(&mut other.waiters);
    }
}

impl fmt::Display for LockNegotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[node={}, lock={}, {}]", self.owner, self.lock, self.intent)
    }
}
