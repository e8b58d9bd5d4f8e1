//! # nodemesh
//!
//! Peer coordination for a small cluster of cooperating server nodes.
//!
//! Each node publishes a replicated `NodeState` (its clients, the locks it
//! holds and its in-flight lock signals) and subscribes to the state of
//! every peer found in the node registry. On top of that, the
//! [`PeerCoordinator`] offers cluster-wide locks, stale-cache broadcasts, a
//! client directory, node actions and requests, proxies of peers' objects
//! and coordination counters, and the
//! [`ScheduledJobCoordinator`] runs scheduled jobs on exactly one node.

pub mod auth;
pub mod config;
mod coordinator;
pub mod cron;
mod inbound;
mod locks;
pub mod negotiation;
mod objects;
pub mod observer;
mod peers;
pub mod requests;
mod session;
mod stats;

pub use auth::{Authenticator, PeerAuthenticator, Principal};
pub use config::CoordinatorConfig;
pub use coordinator::{ObjectWatch, PeerCoordinator, PeerCoordinatorBuilder};
pub use cron::{CronJob, ScheduledJobCoordinator};
pub use negotiation::{NegotiationInput, NegotiationPhase};
pub use observer::{DroppedLockObserver, StaleCacheObserver};
pub use requests::NodeRequestHandler;
pub use session::SessionStatus;
pub use stats::PeerStats;
