//! Cluster-wide lock protocol.
//!
//! A node acquires or releases a lock by raising the `acquiring_lock` or
//! `releasing_lock` signal on its own `NodeState` and waiting until every
//! peer subscribed at that moment has ratified, or until the lock timeout
//! passes. Peers watch those signals through their sessions, track the
//! negotiation and ratify it; conflicting acquisitions are settled by
//! [`has_priority`].
//!
//! Everything here runs on the coordinator task.

use std::time::Duration;

use tokio::time;
use tracing::{debug, info, warn};

use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::lock::{has_priority, Lock, LockIntent};
use nodemesh_proto::message::{PeerReply, PeerRequest};
use nodemesh_proto::state::NodeEvent;

use crate::coordinator::{Command, State};
use crate::inbound::ConnId;
use crate::negotiation::{Followup, LockNegotiation, LockReply, NegotiationInput, Waiter};

impl State {
    /// The node holding `lock` as far as this node can tell: itself first,
    /// then each connected peer in name order.
    pub(crate) fn query_lock(&self, lock: &Lock) -> Option<String> {
        if self.node.holds(lock) {
            return Some(self.node.node_name.clone());
        }
        self.sessions
            .values()
            .filter_map(|s| s.state())
            .find(|state| state.holds(lock))
            .map(|state| state.node_name.clone())
    }

    pub(crate) fn acquire(&mut self, lock: Lock, reply: LockReply) {
        if let Some(neg) = self.negotiations.get_mut(&lock) {
            debug!("lock: {} in resolution, waiting on {}", lock, neg);
            neg.waiters.push(Waiter::then(reply, Followup::Acquire));
            return;
        }

        if let Some(owner) = self.query_lock(&lock) {
            let _ = reply.send(Ok(Some(owner)));
            return;
        }

        // nobody is watching, so nobody can race us
        if self.node_fanout.subscribers.is_empty() {
            self.lock_acquired(lock);
            let _ = reply.send(Ok(Some(self.node_name().to_string())));
            return;
        }

        self.begin(lock, LockIntent::Acquire, reply);
    }

    pub(crate) fn release(&mut self, lock: Lock, reply: LockReply) {
        if let Some(neg) = self.negotiations.get_mut(&lock) {
            debug!("lock: {} in resolution, waiting on {}", lock, neg);
            neg.waiters.push(Waiter::then(reply, Followup::Release));
            return;
        }

        match self.query_lock(&lock) {
            Some(owner) if owner == self.node_name() => {
                if self.node_fanout.subscribers.is_empty() {
                    self.lock_released(lock);
                    let _ = reply.send(Ok(None));
                } else {
                    self.begin(lock, LockIntent::Release, reply);
                }
            }
            Some(owner) => {
                warn!("lock: asked to release {} held by {}", lock, owner);
                let _ = reply.send(Ok(Some(owner)));
            }
            None => {
                debug!("lock: release of unheld {}", lock);
                let _ = reply.send(Ok(None));
            }
        }
    }

    /// Abort an own release that has not activated yet.
    pub(crate) fn reacquire(&mut self, lock: Lock, reply: LockReply) {
        let releasing = matches!(
            self.negotiations.get(&lock),
            Some(neg) if neg.own && neg.intent == LockIntent::Release
        );
        if !releasing {
            warn!("lock: no pending release of {} to cancel", lock);
            let _ = reply.send(Ok(self.query_lock(&lock)));
            return;
        }

        let Some(mut neg) = self.negotiations.remove(&lock) else {
            return;
        };
        info!("lock: reacquiring {}", lock);
        // tell the peers the release is off
        self.post_node_event(NodeEvent::LockUpdated(lock.clone()));
        neg.advance(NegotiationInput::Superseded);
        self.clear_signal(LockIntent::Release, &lock);

        let me = Some(self.node_name().to_string());
        self.resolve(neg, me.clone());
        let _ = reply.send(Ok(me));
    }

    /// Start an own negotiation with the current subscribers as quorum.
    fn begin(&mut self, lock: Lock, intent: LockIntent, reply: LockReply) {
        let serial = self.next_serial();
        let quorum = self.node_fanout.subscribers.clone();
        let owner = self.node_name().to_string();
        let mut neg = LockNegotiation::own(lock.clone(), intent, &owner, quorum, serial);
        neg.waiters.push(Waiter::report(reply));
        debug!("lock: negotiating {} with {} peer(s)", neg, neg.pending.len());
        self.negotiations.insert(lock.clone(), neg);

        let signal = match intent {
            LockIntent::Acquire => NodeEvent::AcquiringLock(Some(lock.clone())),
            LockIntent::Release => NodeEvent::ReleasingLock(Some(lock.clone())),
        };
        self.post_node_event(signal);
        self.arm_timer(lock, serial, self.config.lock_timeout);
    }

    /// Mirror a peer's acquire or release and ratify it.
    fn track(&mut self, peer: &str, lock: Lock, intent: LockIntent) {
        let serial = self.next_serial();
        let neg = LockNegotiation::tracking(lock.clone(), intent, peer, serial);
        debug!("lock: tracking {}", neg);
        self.negotiations.insert(lock.clone(), neg);
        self.arm_timer(lock.clone(), serial, self.config.tracking_timeout());

        let request = PeerRequest::RatifyLock { lock, intent };
        let sent = match self.sessions.get_mut(peer) {
            Some(session) => session.invoke(request, None),
            None => Err(PeerError::NotConnected(peer.to_string())),
        };
        if let Err(e) = sent {
            warn!("lock: failed to ratify {} for {}: {}", intent, peer, e);
        }
    }

    fn arm_timer(&self, lock: Lock, serial: u64, after: Duration) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            time::sleep(after).await;
            let _ = commands.send(Command::NegotiationTimeout { lock, serial });
        });
    }

    /// Finish an own negotiation: the lock changes hands and every waiter
    /// learns the outcome.
    fn activate(&mut self, lock: &Lock, input: NegotiationInput) {
        let Some(mut neg) = self.negotiations.remove(lock) else {
            return;
        };
        neg.advance(input);
        debug!("lock: activating {}", neg);

        let result = match neg.intent {
            LockIntent::Acquire => {
                self.lock_acquired(lock.clone());
                self.clear_signal(LockIntent::Acquire, lock);
                Some(self.node_name().to_string())
            }
            LockIntent::Release => {
                self.lock_released(lock.clone());
                self.clear_signal(LockIntent::Release, lock);
                None
            }
        };
        self.resolve(neg, result);
    }

    /// Hand `result` to the waiters of a finished negotiation. Waiters that
    /// queued their own acquire or release behind it go again.
    fn resolve(&mut self, neg: LockNegotiation, result: Option<String>) {
        let LockNegotiation { lock, waiters, .. } = neg;
        for waiter in waiters {
            match waiter.followup {
                Followup::Acquire if result.is_none() => self.acquire(lock.clone(), waiter.reply),
                Followup::Release if result.as_deref() == Some(self.node_name()) => {
                    self.release(lock.clone(), waiter.reply)
                }
                _ => {
                    let _ = waiter.reply.send(Ok(result.clone()));
                }
            }
        }
    }

    fn clear_signal(&mut self, intent: LockIntent, lock: &Lock) {
        match intent {
            LockIntent::Acquire if self.node.acquiring_lock.as_ref() == Some(lock) => {
                self.post_node_event(NodeEvent::AcquiringLock(None));
            }
            LockIntent::Release if self.node.releasing_lock.as_ref() == Some(lock) => {
                self.post_node_event(NodeEvent::ReleasingLock(None));
            }
            _ => {}
        }
    }

    /// Drop whatever negotiation exists for `lock` in favour of `peer`.
    fn cancel_negotiation(&mut self, lock: &Lock, input: NegotiationInput) -> Option<LockNegotiation> {
        let mut neg = self.negotiations.remove(lock)?;
        neg.advance(input);
        if neg.own {
            self.clear_signal(neg.intent, lock);
        }
        Some(neg)
    }

    fn lock_acquired(&mut self, lock: Lock) {
        info!("lock: acquired {}", lock);
        self.stats.lock_acquired();
        self.post_node_event(NodeEvent::LockAdded(lock));
    }

    fn lock_released(&mut self, lock: Lock) {
        info!("lock: released {}", lock);
        self.stats.lock_released();
        self.post_node_event(NodeEvent::LockRemoved(lock));
    }

    /// Give up a lock another node turned out to hold.
    fn dropped_lock(&mut self, lock: &Lock) {
        self.post_node_event(NodeEvent::LockRemoved(lock.clone()));
        for observer in &self.drop_observers {
            observer.dropped_lock(lock);
        }
    }

    pub(crate) fn negotiation_timed_out(&mut self, lock: Lock, serial: u64) {
        let (own, current) = match self.negotiations.get(&lock) {
            Some(neg) => (neg.own, neg.serial == serial),
            None => return,
        };
        if !current {
            return;
        }

        if own {
            self.stats.lock_timed_out();
            if let Some(neg) = self.negotiations.get(&lock) {
                let missing: Vec<String> = neg
                    .pending
                    .iter()
                    .map(|conn| {
                        self.conns
                            .get(conn)
                            .map(|c| c.node_name.clone())
                            .unwrap_or_else(|| conn.to_string())
                    })
                    .collect();
                warn!(
                    "lock: timed out after {:?} waiting for ratification of {} by {:?}",
                    neg.started.elapsed(),
                    neg,
                    missing
                );
            }
            self.activate(&lock, NegotiationInput::TimedOut);
        } else if let Some(mut neg) = self.negotiations.remove(&lock) {
            warn!("lock: {} never concluded", neg);
            neg.advance(NegotiationInput::TimedOut);
            let owner = self.query_lock(&lock);
            self.resolve(neg, owner);
        }
    }

    // ─── Requests from peers ───

    pub(crate) fn handle_request(&mut self, conn: ConnId, request: PeerRequest) -> PeerResult<PeerReply> {
        match request {
            PeerRequest::RatifyLock { lock, intent } => {
                self.on_ratify(conn, lock, intent);
                Ok(PeerReply::Ratified)
            }
            PeerRequest::Node { name, payload } => self.on_node_request(conn, &name, &payload),
        }
    }

    fn on_ratify(&mut self, conn: ConnId, lock: Lock, intent: LockIntent) {
        let peer = self
            .conns
            .get(&conn)
            .map(|c| c.node_name.clone())
            .unwrap_or_else(|| conn.to_string());

        let Some(neg) = self.negotiations.get_mut(&lock) else {
            warn!("lock: {} ratified {} {} with no negotiation", peer, intent, lock);
            return;
        };
        if !neg.own || neg.intent != intent {
            warn!("lock: {} ratified {} {} but negotiating {}", peer, intent, lock, neg);
            return;
        }
        if !neg.ratify(conn) {
            warn!("lock: unexpected ratification of {} by {}", neg, peer);
            return;
        }
        debug!("lock: {} ratified {}", peer, neg);
        if neg.is_ratified() {
            self.activate(&lock, NegotiationInput::Ratified);
        }
    }

    /// A subscriber left: it no longer has to ratify anything.
    pub(crate) fn subscriber_gone(&mut self, conn: ConnId) {
        self.node_fanout.subscribers.remove(&conn);
        let ratified: Vec<Lock> = self
            .negotiations
            .values_mut()
            .filter_map(|neg| {
                let done = neg.own && neg.ratify(conn) && neg.is_ratified();
                done.then(|| neg.lock.clone())
            })
            .collect();
        for lock in ratified {
            self.activate(&lock, NegotiationInput::Ratified);
        }
    }

    // ─── Peer lock signals ───

    pub(crate) fn peer_acquiring_lock(&mut self, peer: &str, lock: Lock) {
        if let Some(owner) = self.query_lock(&lock) {
            warn!("lock: refusing to ratify {} acquiring {} held by {}", peer, lock, owner);
            return;
        }

        let mut yielded = None;
        if let Some(neg) = self.negotiations.get(&lock) {
            if has_priority(&neg.owner, peer) {
                debug!("lock: {} outranks {} for {}", neg, peer, lock);
                return;
            }
            info!("lock: yielding {} to {}", neg, peer);
            yielded = self.cancel_negotiation(&lock, NegotiationInput::Superseded);
        }
        self.track(peer, lock.clone(), LockIntent::Acquire);

        // our callers now wait on the peer's outcome
        if let (Some(mut lost), Some(neg)) = (yielded, self.negotiations.get_mut(&lock)) {
            neg.adopt_waiters(&mut lost);
        }
    }

    pub(crate) fn peer_releasing_lock(&mut self, peer: &str, lock: Lock) {
        match self.query_lock(&lock) {
            Some(owner) if owner == peer => {}
            owner => {
                warn!("lock: {} releasing {} held by {:?}", peer, lock, owner);
                return;
            }
        }
        if let Some(neg) = self.negotiations.get(&lock) {
            warn!("lock: {} releasing {} during {}", peer, lock, neg);
            return;
        }
        self.track(peer, lock, LockIntent::Release);
    }

    pub(crate) fn peer_added_lock(&mut self, peer: &str, lock: Lock) {
        if self.node.holds(&lock) {
            warn!("lock: {} hijacked {}, dropping it", peer, lock);
            self.stats.lock_hijacked();
            self.dropped_lock(&lock);
        }

        let concluded = matches!(
            self.negotiations.get(&lock),
            Some(neg) if neg.intent == LockIntent::Acquire && neg.owner == peer
        );
        let input = if concluded {
            NegotiationInput::Concluded
        } else {
            NegotiationInput::Superseded
        };
        if let Some(neg) = self.cancel_negotiation(&lock, input) {
            if !concluded {
                warn!("lock: {} took {} during {}", peer, lock, neg);
            }
            self.resolve(neg, Some(peer.to_string()));
        }
    }

    pub(crate) fn peer_updated_lock(&mut self, peer: &str, lock: Lock) {
        let concluded = matches!(
            self.negotiations.get(&lock),
            Some(neg) if neg.intent == LockIntent::Release && neg.owner == peer
        );
        let input = if concluded {
            NegotiationInput::Concluded
        } else {
            NegotiationInput::Superseded
        };
        if let Some(neg) = self.cancel_negotiation(&lock, input) {
            if !concluded {
                warn!("lock: {} updated {} during {}", peer, lock, neg);
            }
            self.resolve(neg, Some(peer.to_string()));
        }
    }

    pub(crate) fn peer_removed_lock(&mut self, peer: &str, lock: Lock) {
        let owned_by_peer = match self.negotiations.get(&lock) {
            Some(neg) if neg.owner == peer => true,
            Some(neg) => {
                warn!("lock: {} dropped {} during {}", peer, lock, neg);
                false
            }
            None => false,
        };
        if owned_by_peer {
            if let Some(neg) = self.cancel_negotiation(&lock, NegotiationInput::Concluded) {
                self.resolve(neg, None);
            }
        }
    }

    /// A peer's state became visible: anything it holds that we think is
    /// ours or in resolution is settled in its favour.
    pub(crate) fn peer_did_logon(&mut self, peer: &str) {
        let locks: Vec<Lock> = match self.sessions.get(peer).and_then(|s| s.state()) {
            Some(state) => state.locks.iter().cloned().collect(),
            None => return,
        };
        for lock in locks {
            self.peer_added_lock(peer, lock);
        }
    }

    /// A peer went away: its locks are free and whatever it was negotiating
    /// is abandoned.
    pub(crate) fn peer_did_logoff(&mut self, peer: &str, locks: Vec<Lock>) {
        for lock in locks {
            self.peer_removed_lock(peer, lock);
        }
        let abandoned: Vec<Lock> = self
            .negotiations
            .values()
            .filter(|neg| !neg.own && neg.owner == peer)
            .map(|neg| neg.lock.clone())
            .collect();
        for lock in abandoned {
            if let Some(neg) = self.cancel_negotiation(&lock, NegotiationInput::Superseded) {
                debug!("lock: {} abandoned", neg);
                self.resolve(neg, None);
            }
        }
    }
}
