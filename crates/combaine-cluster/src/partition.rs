// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic work partitioning over a consistent-hash ring.
//!
//! Every worker computes the assignment locally from the same two inputs,
//! the sorted member list and the group list, and arrives at the same
//! answer. Each member is hashed onto the ring at [`VIRTUAL_NODES`] points;
//! a group is owned by the first member clockwise from the group's own hash.
//! Adding or removing one member only moves the groups adjacent to its
//! points, so ownership churn stays proportional to the membership change.

use std::collections::BTreeMap;
use std::hash::Hasher;

use fnv::FnvHasher;

use crate::coordination::WorkerId;
use crate::repository::GroupName;

const VIRTUAL_NODES: u32 = 128;

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Consistent-hash ring over the current members.
#[derive(Debug, Default)]
pub struct HashRing {
    slots: BTreeMap<u64, WorkerId>,
}

impl HashRing {
    pub fn new(members: &[WorkerId]) -> Self {
        let mut slots: BTreeMap<u64, WorkerId> = BTreeMap::new();
        for member in members {
            for replica in 0..VIRTUAL_NODES {
                let point = hash_key(format!("{member}#{replica}").as_bytes());
                // On a hash collision keep the lexicographically larger id
                // so the ring does not depend on member insertion order.
                match slots.get(&point) {
                    Some(existing) if *existing >= *member => {}
                    _ => {
                        slots.insert(point, member.clone());
                    }
                }
            }
        }
        Self { slots }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The member owning `group`: the first ring point at or after the
    /// group's hash, wrapping around to the start.
    pub fn owner(&self, group: &GroupName) -> Option<&WorkerId> {
        if self.slots.is_empty() {
            return None;
        }
        let point = hash_key(group.as_str().as_bytes());
        self.slots
            .range(point..)
            .next()
            .or_else(|| self.slots.iter().next())
            .map(|(_, member)| member)
    }
}

/// A full group-to-owner mapping computed from one membership view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    owners: BTreeMap<GroupName, WorkerId>,
}

impl Assignment {
    pub fn owner_of(&self, group: &GroupName) -> Option<&WorkerId> {
        self.owners.get(group)
    }

    pub fn owned_by(&self, worker: &WorkerId) -> Vec<GroupName> {
        self.owners
            .iter()
            .filter(|(_, owner)| *owner == worker)
            .map(|(group, _)| group.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Group counts per member, for logging.
    pub fn distribution(&self) -> BTreeMap<&WorkerId, usize> {
        let mut counts: BTreeMap<&WorkerId, usize> = BTreeMap::new();
        for owner in self.owners.values() {
            *counts.entry(owner).or_default() += 1;
        }
        counts
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupName, &WorkerId)> {
        self.owners.iter()
    }
}

/// Assigns every group to exactly one member. An empty member list yields an
/// empty assignment: with nobody alive there is nobody to own work.
pub fn assign(groups: &[GroupName], members: &[WorkerId]) -> Assignment {
    let ring = HashRing::new(members);
    let mut owners = BTreeMap::new();
    for group in groups {
        if let Some(owner) = ring.owner(group) {
            owners.insert(group.clone(), owner.clone());
        }
    }
    Assignment { owners }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn workers(ids: &[&str]) -> Vec<WorkerId> {
        ids.iter().copied().map(WorkerId::new).collect()
    }

    fn groups(n: usize) -> Vec<GroupName> {
        (0..n).map(|i| GroupName::new(format!("group-{i}"))).collect()
    }

    #[test]
    fn empty_members_yield_empty_assignment() {
        let assignment = assign(&groups(10), &[]);
        assert!(assignment.is_empty());
    }

    #[test]
    fn empty_groups_yield_empty_assignment() {
        let assignment = assign(&[], &workers(&["w1", "w2"]));
        assert!(assignment.is_empty());
    }

    #[test]
    fn every_group_gets_exactly_one_owner() {
        let members = workers(&["w1", "w2", "w3", "w4", "w5"]);
        let groups = groups(100);
        let assignment = assign(&groups, &members);

        assert_eq!(assignment.len(), groups.len());
        for group in &groups {
            let owner = assignment.owner_of(group).unwrap();
            assert!(members.contains(owner));
        }
    }

    #[test]
    fn assignment_ignores_member_order() {
        let groups = groups(50);
        let forward = assign(&groups, &workers(&["w1", "w2", "w3"]));
        let backward = assign(&groups, &workers(&["w3", "w2", "w1"]));
        assert_eq!(forward, backward);
    }

    #[test]
    fn removing_a_member_only_moves_its_groups() {
        let groups = groups(200);
        let before = assign(&groups, &workers(&["w1", "w2", "w3"]));
        let after = assign(&groups, &workers(&["w1", "w2"]));

        let removed = WorkerId::new("w3");
        for group in &groups {
            let old_owner = before.owner_of(group).unwrap();
            let new_owner = after.owner_of(group).unwrap();
            if *old_owner != removed {
                assert_eq!(old_owner, new_owner, "group {group} moved needlessly");
            }
        }
    }

    #[test]
    fn adding_a_member_only_moves_groups_to_it() {
        let groups = groups(200);
        let before = assign(&groups, &workers(&["w1", "w2"]));
        let after = assign(&groups, &workers(&["w1", "w2", "w3"]));

        let added = WorkerId::new("w3");
        for group in &groups {
            let old_owner = before.owner_of(group).unwrap();
            let new_owner = after.owner_of(group).unwrap();
            if new_owner != old_owner {
                assert_eq!(*new_owner, added, "group {group} moved to an old member");
            }
        }
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let members = workers(&["w1", "w2", "w3", "w4"]);
        let assignment = assign(&groups(1000), &members);
        let distribution = assignment.distribution();

        assert_eq!(distribution.len(), members.len());
        for (_, count) in distribution {
            // 250 expected per member; virtual nodes keep the spread well
            // within a factor of two.
            assert!((125..=500).contains(&count), "count {count} out of range");
        }
    }

    #[test]
    fn owned_by_partitions_the_groups() {
        let members = workers(&["w1", "w2", "w3"]);
        let groups = groups(60);
        let assignment = assign(&groups, &members);

        let total: usize = members
            .iter()
            .map(|member| assignment.owned_by(member).len())
            .sum();
        assert_eq!(total, groups.len());
    }

    proptest! {
        #[test]
        fn prop_totality(group_count in 0usize..64, member_count in 1usize..8) {
            let members: Vec<WorkerId> =
                (0..member_count).map(|i| WorkerId::new(format!("w{i}"))).collect();
            let groups: Vec<GroupName> =
                (0..group_count).map(|i| GroupName::new(format!("g{i}"))).collect();
            let assignment = assign(&groups, &members);
            prop_assert_eq!(assignment.len(), groups.len());
            for group in &groups {
                prop_assert!(members.contains(assignment.owner_of(group).unwrap()));
            }
        }

        #[test]
        fn prop_removal_locality(member_count in 2usize..8, drop_index in 0usize..8) {
            let drop_index = drop_index % member_count;
            let members: Vec<WorkerId> =
                (0..member_count).map(|i| WorkerId::new(format!("w{i}"))).collect();
            let groups: Vec<GroupName> =
                (0..64).map(|i| GroupName::new(format!("g{i}"))).collect();

            let before = assign(&groups, &members);
            let mut reduced = members.clone();
            let removed = reduced.remove(drop_index);
            let after = assign(&groups, &reduced);

            for group in &groups {
                let old_owner = before.owner_of(group).unwrap();
                if *old_owner != removed {
                    prop_assert_eq!(old_owner, after.owner_of(group).unwrap());
                }
            }
        }
    }
}
