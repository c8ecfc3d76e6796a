//! Connect-request admission.
//!
//! [`ConnectionNegotiator::evaluate`] turns a parsed [`DomainConnectRequest`]
//! into a [`ConnectDecision`] without touching the network; the coordinator
//! reactor carries the decision out. The steps, in order:
//!
//! 1. Substitute the observed sender address for an unset public socket,
//!    unless the sender is on loopback.
//! 2. A deploy UUID with a pending record is an assignment fulfilment: the
//!    queued assignment must still match by UUID and type family, or the
//!    request is silently dropped.
//! 3. A statically assigned node type without a pending record is silently
//!    dropped.
//! 4. Everyone else goes through the allow-list: local senders always pass,
//!    an empty list lets everybody in, otherwise the username must be listed
//!    and signed with its key. Rejections are explicit denials.
//! 5. The admitted node keeps the UUID of an ICE-connected peer, or gets a
//!    fresh one.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use uuid::Uuid;
use waypost_core::{NodeType, RandomProvider};
use waypost_transport::IcePeers;
use waypost_transport::protocol::DomainConnectRequest;

use crate::keys::{KeyLookup, UserKeyCache, verify_username_signature};
use crate::registry::{AssignmentRegistry, PendingAssignedNode};

/// Everything the reactor needs to admit a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// UUID the node will be known by.
    pub node_uuid: Uuid,
    /// Node type.
    pub node_type: NodeType,
    /// Public socket after substitution.
    pub public_socket: Option<SocketAddr>,
    /// Local socket.
    pub local_socket: Option<SocketAddr>,
    /// Socket pinned by ICE, if the node came through rendezvous.
    pub pinned_socket: Option<SocketAddr>,
    /// Assignment the node fulfils.
    pub assignment: Option<PendingAssignedNode>,
    /// Authenticated username.
    pub username: Option<String>,
    /// Node types wanted in the peer list.
    pub interests: Vec<NodeType>,
}

/// Why a request was dropped without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Deploy UUID known, but its assignment is gone or of another family.
    UnmatchedAssignment,
    /// Statically assigned node type with no pending deploy.
    UnknownAssignment,
    /// The username's key is still loading.
    KeyPending,
}

/// Outcome of a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Admit the node.
    Admit(Admission),
    /// Drop silently; the sender's retry timer recovers.
    Drop(DropReason),
    /// Drop silently and start loading this user's key.
    FetchKey(String),
    /// Send an explicit denial.
    Deny(String),
}

/// Policy state for connect requests.
#[derive(Debug, Default)]
pub struct ConnectionNegotiator {
    allowed_users: HashSet<String>,
    keys: UserKeyCache,
}

impl ConnectionNegotiator {
    /// Negotiator with the given allow-list; empty admits everybody.
    pub fn new(allowed_users: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_users: allowed_users.into_iter().collect(),
            keys: UserKeyCache::new(),
        }
    }

    /// Key cache, for recording load results.
    pub fn keys_mut(&mut self) -> &mut UserKeyCache {
        &mut self.keys
    }

    /// Decide what to do with a connect request from `sender`.
    ///
    /// Consumes the pending record and the queued assignment on a successful
    /// fulfilment.
    pub fn evaluate<R: RandomProvider>(
        &mut self,
        request: &DomainConnectRequest,
        sender: SocketAddr,
        registry: &mut AssignmentRegistry<R>,
        ice_peers: &IcePeers,
        random: &R,
    ) -> ConnectDecision {
        let public_socket = substitute_public_socket(request.public_socket, sender);

        let pending = request
            .inbound_uuid
            .and_then(|uuid| registry.pending_assigned_node(&uuid).copied());

        let (assignment, username) = match pending {
            Some(pending) => {
                if registry
                    .matching_queued_assignment_for_check_in(
                        &pending.assignment_uuid,
                        request.node_type,
                    )
                    .is_none()
                {
                    return ConnectDecision::Drop(DropReason::UnmatchedAssignment);
                }
                (Some(pending), None)
            }
            None if request.node_type.is_statically_assigned() => {
                return ConnectDecision::Drop(DropReason::UnknownAssignment);
            }
            None => match self.check_allow_list(request, sender) {
                Ok(username) => (None, username),
                Err(decision) => return decision,
            },
        };

        let ice_peer = request
            .inbound_uuid
            .and_then(|uuid| ice_peers.connected_peer(&uuid));
        let (node_uuid, pinned_socket) = match ice_peer {
            Some(peer) => (peer.uuid(), peer.active_socket()),
            None => (random.new_uuid(), None),
        };

        ConnectDecision::Admit(Admission {
            node_uuid,
            node_type: request.node_type,
            public_socket,
            local_socket: request.local_socket,
            pinned_socket,
            assignment,
            username,
            interests: request.interests.clone(),
        })
    }

    /// `Ok(username)` when the request may proceed, the decision otherwise.
    fn check_allow_list(
        &mut self,
        request: &DomainConnectRequest,
        sender: SocketAddr,
    ) -> Result<Option<String>, ConnectDecision> {
        let username = (!request.username.is_empty()).then(|| request.username.clone());

        if is_local_address(sender.ip()) || self.allowed_users.is_empty() {
            // only a signed username counts as authenticated here
            let verified = username.filter(|name| match self.keys.lookup(name) {
                KeyLookup::Cached(key) => {
                    verify_username_signature(key, name, &request.username_signature)
                }
                _ => false,
            });
            return Ok(verified);
        }

        let Some(username) = username else {
            return Err(ConnectDecision::Deny("a username is required to connect".into()));
        };
        if !self.allowed_users.contains(&username) {
            return Err(ConnectDecision::Deny(format!("{username} is not allowed to connect")));
        }

        if matches!(self.keys.lookup(&username), KeyLookup::Unknown) {
            self.keys.mark_fetching(&username);
            return Err(ConnectDecision::FetchKey(username));
        }

        match self.keys.lookup(&username) {
            KeyLookup::Cached(key) => {
                if verify_username_signature(key, &username, &request.username_signature) {
                    Ok(Some(username))
                } else {
                    Err(ConnectDecision::Deny(format!("signature for {username} does not verify")))
                }
            }
            KeyLookup::Missing => {
                Err(ConnectDecision::Deny(format!("no public key for {username}")))
            }
            KeyLookup::Fetching | KeyLookup::Unknown => {
                Err(ConnectDecision::Drop(DropReason::KeyPending))
            }
        }
    }
}

/// The advertised public socket, or the observed sender address when none
/// was advertised and the sender is not on loopback.
pub fn substitute_public_socket(
    public_socket: Option<SocketAddr>,
    sender: SocketAddr,
) -> Option<SocketAddr> {
    match public_socket {
        None if !sender.ip().is_loopback() => Some(sender),
        public => public,
    }
}

/// Loopback, private and link-local senders bypass the allow-list.
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
                || v6.to_ipv4_mapped().is_some_and(|v4| is_local_address(IpAddr::V4(v4)))
        }
    }
}
