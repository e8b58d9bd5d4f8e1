//! Peer authentication.
//!
//! A peer proves its identity by presenting `hash(node_name, secret)` as its
//! password. Credentials that are not peer credentials are handed to the
//! host server's own authenticator, if one was chained in.

use std::sync::Arc;

use tracing::debug;

use nodemesh_proto::error::{PeerError, PeerResult};
use nodemesh_proto::hash::peer_password;
use nodemesh_proto::node::{Credentials, PeerCreds};

/// Authenticator for ordinary (non-peer) users, supplied by the host server.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> PeerResult<()>;
}

/// Who a set of credentials turned out to belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Another node of the cluster.
    Peer(String),
    /// An end user, vouched for by the delegate authenticator.
    User(String),
}

/// Validates peer credentials against the shared secret.
#[derive(Clone)]
pub struct PeerAuthenticator {
    shared_secret: String,
    delegate: Option<Arc<dyn Authenticator>>,
}

impl PeerAuthenticator {
    pub fn new(shared_secret: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            delegate: None,
        }
    }

    /// Chain an authenticator for non-peer credentials.
    pub fn with_delegate(mut self, delegate: Arc<dyn Authenticator>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Whether `password` is the right password for `claimed_name`.
    pub fn is_authentic_peer(&self, claimed_name: &str, password: &str) -> bool {
        password == peer_password(claimed_name, &self.shared_secret)
    }

    /// Authenticate any kind of credentials.
    pub fn authenticate(&self, creds: &Credentials) -> PeerResult<Principal> {
        match creds {
            Credentials::Peer(PeerCreds {
                node_name,
                password,
            }) => {
                if self.is_authentic_peer(node_name, password) {
                    Ok(Principal::Peer(node_name.clone()))
                } else {
                    Err(PeerError::AuthRejected)
                }
            }
            Credentials::User { username, password } => match &self.delegate {
                Some(delegate) => {
                    delegate.authenticate(username, password)?;
                    Ok(Principal::User(username.clone()))
                }
                None => {
                    debug!("peer: no user authenticator, rejecting {}", username);
                    Err(PeerError::AuthRejected)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OnlyBob;

    impl Authenticator for OnlyBob {
        fn authenticate(&self, username: &str, password: &str) -> PeerResult<()> {
            if username == "bob" && password == "hunter2" {
                Ok(())
            } else {
                Err(PeerError::AuthRejected)
            }
        }
    }

    #[test]
    fn test_peer_creds() {
        let auth = PeerAuthenticator::new("s3cret");
        let good = PeerCreds::new("beta", "s3cret");
        assert!(auth.is_authentic_peer(&good.node_name, &good.password));
        assert_eq!(
            auth.authenticate(&Credentials::Peer(good)).unwrap(),
            Principal::Peer("beta".into())
        );

        let bad = PeerCreds::new("beta", "wrong");
        assert_eq!(
            auth.authenticate(&Credentials::Peer(bad)).unwrap_err(),
            PeerError::AuthRejected
        );

        // A valid password for one name does not work for another.
        let stolen = PeerCreds {
            node_name: "gamma".into(),
            password: PeerCreds::new("beta", "s3cret").password,
        };
        assert!(!auth.is_authentic_peer(&stolen.node_name, &stolen.password));
    }

    #[test]
    fn test_user_creds_go_to_delegate() {
        let user = Credentials::User {
            username: "bob".into(),
            password: "hunter2".into(),
        };
        let bare = PeerAuthenticator::new("s3cret");
        assert_eq!(bare.authenticate(&user).unwrap_err(), PeerError::AuthRejected);

        let chained = PeerAuthenticator::new("s3cret").with_delegate(Arc::new(OnlyBob));
        assert_eq!(
            chained.authenticate(&user).unwrap(),
            Principal::User("bob".into())
        );
        let eve = Credentials::User {
            username: "eve".into(),
            password: "x".into(),
        };
        assert!(chained.authenticate(&eve).is_err());
    }
}
