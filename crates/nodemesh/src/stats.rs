//! Coordination counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the coordinator task and the link pumps.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    locks_acquired: AtomicU64,
    locks_released: AtomicU64,
    locks_hijacked: AtomicU64,
    lock_timeouts: AtomicU64,
    node_actions_invoked: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

macro_rules! note {
    ($($fn:ident => $field:ident),* $(,)?) => {
        impl StatCounters {
            $(
                pub fn $fn(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

note! {
    lock_acquired => locks_acquired,
    lock_released => locks_released,
    lock_hijacked => locks_hijacked,
    lock_timed_out => lock_timeouts,
    node_action_invoked => node_actions_invoked,
    message_in => messages_in,
    message_out => messages_out,
}

impl StatCounters {
    pub fn snapshot(&self) -> PeerStats {
        PeerStats {
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            locks_hijacked: self.locks_hijacked.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            node_actions_invoked: self.node_actions_invoked.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a coordinator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Locks this node acquired.
    pub locks_acquired: u64,
    /// Locks this node released.
    pub locks_released: u64,
    /// Locks this node held that a peer claimed anyway.
    pub locks_hijacked: u64,
    /// Own acquires or releases that activated without every ratification.
    pub lock_timeouts: u64,
    pub node_actions_invoked: u64,
    /// Messages received from peers after logon, over every link.
    pub messages_in: u64,
    /// Messages sent to peers after logon, over every link.
    pub messages_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let counters = StatCounters::default();
        counters.lock_acquired();
        counters.lock_acquired();
        counters.lock_timed_out();
        counters.message_out();

        let stats = counters.snapshot();
        assert_eq!(stats.locks_acquired, 2);
        assert_eq!(stats.lock_timeouts, 1);
        assert_eq!(stats.messages_out, 1);
        assert_eq!(stats.locks_hijacked, 0);
        assert_eq!(PeerStats::default().messages_in, 0);
    }
}
