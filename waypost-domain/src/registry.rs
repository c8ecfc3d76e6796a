//! Assignment lifecycle.
//!
//! The registry keeps three collections:
//!
//! - **static assignments**: config-defined, keyed by their *current* UUID.
//!   When the node bound to one dies it is re-issued under a fresh UUID and
//!   the old UUID is forgotten everywhere.
//! - **queue**: FIFO of assignments waiting for a worker. Handing one out
//!   (an *offer*) moves it to the tail instead of removing it; only the
//!   connect handshake of the worker that received it removes it
//!   ([`AssignmentRegistry::matching_queued_assignment_for_check_in`]).
//! - **pending assigned nodes**: deploy UUID → original assignment, for
//!   workers that received an assignment and have not connected yet.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use tracing::{debug, info, warn};
use uuid::Uuid;
use waypost_core::{AssignmentType, NodeType, RandomProvider};
use waypost_transport::protocol::{Assignment, RequestAssignment};

use crate::config::DomainServerConfig;

/// Link from a deployed copy back to the assignment it fulfils.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAssignedNode {
    /// UUID of the queued assignment.
    pub assignment_uuid: Uuid,
    /// Wallet from the worker's request.
    pub wallet_uuid: Option<Uuid>,
}

/// Assignment queue, static set and pending deploys.
#[derive(Debug)]
pub struct AssignmentRegistry<R: RandomProvider> {
    random: R,
    static_assignments: HashMap<Uuid, Assignment>,
    queue: VecDeque<Assignment>,
    pending_assigned_nodes: HashMap<Uuid, PendingAssignedNode>,
    scripts_dir: Option<PathBuf>,
}

impl<R: RandomProvider> AssignmentRegistry<R> {
    /// Empty registry.
    pub fn new(random: R) -> Self {
        Self {
            random,
            static_assignments: HashMap::new(),
            queue: VecDeque::new(),
            pending_assigned_nodes: HashMap::new(),
            scripts_dir: None,
        }
    }

    /// Registry holding the static assignments described by `config`.
    ///
    /// Explicitly configured types get one instance per configured `count`.
    /// Every other concrete type gets a single default instance with no pool
    /// and no payload, except on-demand types. Disabled types get nothing.
    /// Nothing is queued until
    /// [`add_static_assignments_to_queue`](Self::add_static_assignments_to_queue).
    pub fn from_config(config: &DomainServerConfig, random: R) -> Self {
        let mut registry = Self::new(random);
        registry.scripts_dir = config.scripts_dir.clone();

        for assignment_type in AssignmentType::CONCRETE {
            if config.disabled_types.contains(&assignment_type) {
                continue;
            }
            match config.assignments.get(&assignment_type) {
                Some(groups) => {
                    for group in groups {
                        for _ in 0..group.count {
                            let payload = group.payload.as_bytes();
                            registry.add_static(assignment_type, &group.pool, payload);
                        }
                    }
                }
                None if !assignment_type.is_on_demand() => {
                    registry.add_static(assignment_type, "", &[]);
                }
                None => {}
            }
        }
        info!(count = registry.static_assignments.len(), "static assignments configured");
        registry
    }

    fn add_static(&mut self, assignment_type: AssignmentType, pool: &str, payload: &[u8]) -> Uuid {
        let assignment = Assignment::new(self.random.new_uuid(), assignment_type, pool)
            .with_payload(payload.to_vec())
            .with_static(true);
        let uuid = assignment.uuid;
        self.static_assignments.insert(uuid, assignment);
        uuid
    }

    /// Queue every static assignment that is neither queued nor bound to a
    /// live node, each under a fresh UUID. Returns how many were queued.
    pub async fn add_static_assignments_to_queue(&mut self, bound: &HashSet<Uuid>) -> usize {
        let idle: Vec<Uuid> = self
            .static_assignments
            .keys()
            .filter(|uuid| !bound.contains(uuid) && !self.is_queued(uuid))
            .copied()
            .collect();

        let mut queued = 0;
        for uuid in idle {
            if self.refresh_static_assignment_and_add_to_queue(&uuid).await.is_some() {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!(queued, "static assignments added to queue");
        }
        queued
    }

    /// Offer the first queued assignment matching `(assignment_type, pool)`.
    ///
    /// The entry is removed, a copy goes back to the tail of the queue, and
    /// the original is returned. Queue length is unchanged.
    pub fn deployable_assignment_for_request(
        &mut self,
        assignment_type: AssignmentType,
        pool: &str,
    ) -> Option<Assignment> {
        let index = self
            .queue
            .iter()
            .position(|assignment| assignment.matches_request(assignment_type, pool))?;
        let assignment = self.queue.remove(index)?;
        self.queue.push_back(assignment.clone());
        Some(assignment)
    }

    /// Answer a worker's request.
    ///
    /// Returns a unique copy of the offered assignment under a fresh deploy
    /// UUID and remembers which assignment that UUID stands for.
    pub fn deploy(&mut self, request: &RequestAssignment) -> Option<Assignment> {
        let offered =
            self.deployable_assignment_for_request(request.assignment_type, &request.pool)?;

        let mut unique = offered.clone();
        unique.uuid = self.random.new_uuid();
        unique.wallet_uuid = request.wallet_uuid;

        self.pending_assigned_nodes.insert(
            unique.uuid,
            PendingAssignedNode {
                assignment_uuid: offered.uuid,
                wallet_uuid: request.wallet_uuid,
            },
        );
        info!(
            assignment = %offered.uuid,
            deploy = %unique.uuid,
            assignment_type = %offered.assignment_type,
            pool = %offered.pool,
            "deploying assignment"
        );
        Some(unique)
    }

    /// Pending record for a deploy UUID.
    pub fn pending_assigned_node(&self, deploy_uuid: &Uuid) -> Option<&PendingAssignedNode> {
        self.pending_assigned_nodes.get(deploy_uuid)
    }

    /// Consume a queued assignment at the worker's connect handshake.
    ///
    /// The assignment must still be queued and its type must belong to
    /// `node_type`'s family. On success it leaves the queue for good, along
    /// with every pending deploy of it, including those handed to workers
    /// that lost the race.
    pub fn matching_queued_assignment_for_check_in(
        &mut self,
        assignment_uuid: &Uuid,
        node_type: NodeType,
    ) -> Option<Assignment> {
        let index = self.queue.iter().position(|assignment| {
            assignment.uuid == *assignment_uuid
                && assignment.assignment_type.node_type() == Some(node_type)
        })?;
        let assignment = self.queue.remove(index)?;
        self.pending_assigned_nodes
            .retain(|_, pending| pending.assignment_uuid != assignment.uuid);
        debug!(assignment = %assignment.uuid, %node_type, "assignment fulfilled");
        Some(assignment)
    }

    /// Re-issue a static assignment under a fresh UUID and queue it.
    ///
    /// Queued copies and pending deploys of the old UUID are dropped, so the
    /// old UUID never resolves again. A payload-less agent's persisted script
    /// follows it to the new UUID. Returns the new UUID, or `None` if
    /// `old_uuid` is not a static assignment.
    pub async fn refresh_static_assignment_and_add_to_queue(
        &mut self,
        old_uuid: &Uuid,
    ) -> Option<Uuid> {
        let mut assignment = self.static_assignments.remove(old_uuid)?;

        self.queue.retain(|queued| queued.uuid != *old_uuid);
        self.pending_assigned_nodes
            .retain(|_, pending| pending.assignment_uuid != *old_uuid);

        let new_uuid = self.random.new_uuid();
        assignment.uuid = new_uuid;

        if assignment.assignment_type == AssignmentType::Agent && assignment.payload.is_empty() {
            if let Some(dir) = &self.scripts_dir {
                let from = dir.join(old_uuid.to_string());
                let to = dir.join(new_uuid.to_string());
                match tokio::fs::rename(&from, &to).await {
                    Ok(()) => {
                        debug!(from = %from.display(), to = %to.display(), "moved agent script")
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => warn!(%error, from = %from.display(), "cannot move agent script"),
                }
            }
        }

        debug!(
            old = %old_uuid,
            new = %new_uuid,
            assignment_type = %assignment.assignment_type,
            "re-issued static assignment"
        );
        self.queue.push_back(assignment.clone());
        self.static_assignments.insert(new_uuid, assignment);
        Some(new_uuid)
    }

    /// Queue a one-shot assignment.
    pub fn create_dynamic_assignment(
        &mut self,
        assignment_type: AssignmentType,
        pool: &str,
        payload: Vec<u8>,
    ) -> Uuid {
        let assignment = Assignment::new(self.random.new_uuid(), assignment_type, pool)
            .with_payload(payload);
        let uuid = assignment.uuid;
        info!(%uuid, %assignment_type, pool, "dynamic assignment queued");
        self.queue.push_back(assignment);
        uuid
    }

    /// Whether a static assignment has this UUID.
    pub fn is_static(&self, uuid: &Uuid) -> bool {
        self.static_assignments.contains_key(uuid)
    }

    /// Whether an assignment with this UUID is queued.
    pub fn is_queued(&self, uuid: &Uuid) -> bool {
        self.queue.iter().any(|assignment| assignment.uuid == *uuid)
    }

    /// Whether this UUID resolves to any live record.
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.is_static(uuid)
            || self.is_queued(uuid)
            || self.pending_assigned_nodes.contains_key(uuid)
            || self
                .pending_assigned_nodes
                .values()
                .any(|pending| pending.assignment_uuid == *uuid)
    }

    /// Queued assignments, head first.
    pub fn queue(&self) -> impl Iterator<Item = &Assignment> {
        self.queue.iter()
    }

    /// Number of queued assignments.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Static assignments in no particular order.
    pub fn static_assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.static_assignments.values()
    }
}
