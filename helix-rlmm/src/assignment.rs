//! Metadata partition assignment.
//!
//! A metadata partition is assigned when it was added explicitly or when a
//! user partition that maps onto it is assigned. Roles follow from the same
//! state: a metadata partition is primary if it was added as primary or
//! carries at least one primary user partition, and secondary otherwise.
//! Nothing here looks at consumed offsets.
//!
//! Changes are published through a version counter. The consumer task picks
//! them up at its next subscription re-evaluation; an in-flight poll keeps
//! using the assignment it started with.
//!
//! A user partition that becomes primary is also queued for loading. The
//! consumer takes the queue with the assignment, re-reads the history of the
//! affected metadata partitions and then reports the user partitions ready.
//! Readiness sits next to the assignment but is not part of `AssignmentSet`.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::partitioner::Partitioner;
use crate::types::{MetadataPartition, Role, TopicIdPartition};

// -----------------------------------------------------------------------------
// AssignmentSet
// -----------------------------------------------------------------------------

/// Point-in-time view of what this instance owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentSet {
    /// Metadata partitions added directly.
    explicit: BTreeMap<MetadataPartition, Role>,
    /// User partitions with their role and metadata partition.
    user: HashMap<TopicIdPartition, (Role, MetadataPartition)>,
}

impl AssignmentSet {
    /// Returns true if `partition` is assigned.
    #[must_use]
    pub fn is_assigned(&self, partition: MetadataPartition) -> bool {
        self.explicit.contains_key(&partition)
            || self.user.values().any(|(_, mp)| *mp == partition)
    }

    /// Returns the role of `partition`, or `None` if it is not assigned.
    #[must_use]
    pub fn role(&self, partition: MetadataPartition) -> Option<Role> {
        let mut assigned = false;
        if let Some(role) = self.explicit.get(&partition) {
            if *role == Role::Primary {
                return Some(Role::Primary);
            }
            assigned = true;
        }
        for (role, mp) in self.user.values() {
            if *mp == partition {
                if *role == Role::Primary {
                    return Some(Role::Primary);
                }
                assigned = true;
            }
        }
        assigned.then_some(Role::Secondary)
    }

    /// Returns every assigned metadata partition.
    #[must_use]
    pub fn partitions(&self) -> BTreeSet<MetadataPartition> {
        self.explicit
            .keys()
            .copied()
            .chain(self.user.values().map(|(_, mp)| *mp))
            .collect()
    }

    /// Returns every assigned metadata partition with its role.
    #[must_use]
    pub fn roles(&self) -> BTreeMap<MetadataPartition, Role> {
        self.partitions()
            .into_iter()
            .filter_map(|p| self.role(p).map(|role| (p, role)))
            .collect()
    }

    /// Returns true if this instance is primary for the user partition.
    #[must_use]
    pub fn is_primary(&self, topic_partition: &TopicIdPartition) -> bool {
        matches!(self.user.get(topic_partition), Some((Role::Primary, _)))
    }

    /// Returns the metadata partition of an assigned user partition.
    #[must_use]
    pub fn partition_of(&self, topic_partition: &TopicIdPartition) -> Option<MetadataPartition> {
        self.user.get(topic_partition).map(|(_, mp)| *mp)
    }

    /// Returns true if events for `topic_partition` read from `partition`
    /// should be passed to the event handler.
    ///
    /// A user partition's own role decides when it is known. Events for
    /// user partitions this instance was not told about are handled only on
    /// metadata partitions added directly as primary.
    #[must_use]
    pub fn should_handle(
        &self,
        topic_partition: &TopicIdPartition,
        partition: MetadataPartition,
    ) -> bool {
        match self.user.get(topic_partition) {
            Some((role, _)) => *role == Role::Primary,
            None => self.explicit.get(&partition) == Some(&Role::Primary),
        }
    }

    /// Returns true if nothing is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && self.user.is_empty()
    }
}

// -----------------------------------------------------------------------------
// PartitionAssignment
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct State {
    set: AssignmentSet,
    /// Promoted to primary and not yet taken by the consumer.
    pending: BTreeSet<TopicIdPartition>,
    /// Primary user partitions whose history has been applied.
    ready: HashSet<TopicIdPartition>,
}

/// Shared, mutable assignment owned by the synchronization manager.
pub struct PartitionAssignment {
    state: RwLock<State>,
    version: AtomicU64,
    partitioner: Arc<dyn Partitioner>,
}

impl std::fmt::Debug for PartitionAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionAssignment")
            .field("state", &self.state)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl PartitionAssignment {
    /// Creates an empty assignment.
    #[must_use]
    pub fn new(partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            version: AtomicU64::new(0),
            partitioner,
        }
    }

    /// Returns the partitioner used for user partitions.
    #[must_use]
    pub fn partitioner(&self) -> &dyn Partitioner {
        self.partitioner.as_ref()
    }

    /// Adds metadata partitions as primary. Present partitions are left as is.
    pub fn add_partitions(&self, partitions: impl IntoIterator<Item = MetadataPartition>) {
        self.add_with_role(partitions, Role::Primary);
    }

    /// Adds metadata partitions as secondary. Present partitions are left as is.
    pub fn add_secondary_partitions(
        &self,
        partitions: impl IntoIterator<Item = MetadataPartition>,
    ) {
        self.add_with_role(partitions, Role::Secondary);
    }

    fn add_with_role(&self, partitions: impl IntoIterator<Item = MetadataPartition>, role: Role) {
        let changed = {
            let mut state = self.write();
            let mut changed = false;
            for partition in partitions {
                if !state.set.explicit.contains_key(&partition) {
                    state.set.explicit.insert(partition, role);
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.bump("add_partitions");
        }
    }

    /// Removes metadata partitions added with `add_partitions`.
    ///
    /// Partitions still carrying assigned user partitions stay assigned.
    pub fn remove_partitions(&self, partitions: impl IntoIterator<Item = MetadataPartition>) {
        let changed = {
            let mut state = self.write();
            let mut changed = false;
            for partition in partitions {
                changed |= state.set.explicit.remove(&partition).is_some();
            }
            changed
        };
        if changed {
            self.bump("remove_partitions");
        }
    }

    /// Assigns user partitions with `role`, replacing any previous role.
    ///
    /// A user partition that was not primary before and is now is queued for
    /// loading and stops being ready.
    pub fn assign_user_partitions(
        &self,
        topic_partitions: impl IntoIterator<Item = TopicIdPartition>,
        role: Role,
    ) {
        let changed = {
            let mut state = self.write();
            let mut changed = false;
            for tp in topic_partitions {
                let mp = self.partitioner.partition_for(&tp);
                let previous = state.set.user.insert(tp, (role, mp));
                if previous == Some((role, mp)) {
                    continue;
                }
                changed = true;
                state.ready.remove(&tp);
                if role == Role::Primary {
                    state.pending.insert(tp);
                } else {
                    state.pending.remove(&tp);
                }
            }
            changed
        };
        if changed {
            self.bump("assign_user_partitions");
        }
    }

    /// Removes user partitions.
    pub fn remove_user_partitions(
        &self,
        topic_partitions: impl IntoIterator<Item = TopicIdPartition>,
    ) {
        let changed = {
            let mut state = self.write();
            let mut changed = false;
            for tp in topic_partitions {
                state.pending.remove(&tp);
                state.ready.remove(&tp);
                changed |= state.set.user.remove(&tp).is_some();
            }
            changed
        };
        if changed {
            self.bump("remove_user_partitions");
        }
    }

    /// Returns true if `partition` is assigned.
    #[must_use]
    pub fn is_assigned(&self, partition: MetadataPartition) -> bool {
        self.read().set.is_assigned(partition)
    }

    /// Returns the role of `partition`.
    #[must_use]
    pub fn role(&self, partition: MetadataPartition) -> Option<Role> {
        self.read().set.role(partition)
    }

    /// Returns true if this instance is primary for the user partition.
    #[must_use]
    pub fn is_primary(&self, topic_partition: &TopicIdPartition) -> bool {
        self.read().set.is_primary(topic_partition)
    }

    /// Returns true if the user partition is primary and its history has been
    /// applied since it became primary.
    #[must_use]
    pub fn is_ready(&self, topic_partition: &TopicIdPartition) -> bool {
        let state = self.read();
        state.set.is_primary(topic_partition) && state.ready.contains(topic_partition)
    }

    /// Returns a copy of the current assignment.
    #[must_use]
    pub fn snapshot(&self) -> AssignmentSet {
        self.read().set.clone()
    }

    /// Returns the current assignment and takes the user partitions promoted
    /// to primary since the previous call.
    pub(crate) fn checkout(&self) -> (AssignmentSet, BTreeSet<TopicIdPartition>) {
        let mut state = self.write();
        let promoted = std::mem::take(&mut state.pending);
        (state.set.clone(), promoted)
    }

    /// Puts promotions taken by `checkout` back after a failed subscription.
    /// User partitions that stopped being primary are dropped.
    pub(crate) fn requeue(&self, promoted: impl IntoIterator<Item = TopicIdPartition>) {
        let mut state = self.write();
        for tp in promoted {
            if state.set.is_primary(&tp) {
                state.pending.insert(tp);
            }
        }
    }

    /// Marks user partitions as loaded. A partition that lost and regained
    /// primary in the meantime is queued again and stays not ready.
    pub(crate) fn mark_ready(&self, topic_partitions: impl IntoIterator<Item = TopicIdPartition>) {
        let mut state = self.write();
        for tp in topic_partitions {
            if state.set.is_primary(&tp) && !state.pending.contains(&tp) {
                state.ready.insert(tp);
            }
        }
    }

    /// Returns the change counter. Any mutation increments it.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self, operation: &'static str) {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(operation, version, "Assignment changed");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().expect("assignment lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().expect("assignment lock poisoned")
    }
}
