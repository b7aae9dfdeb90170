use crate::member::{DynMemberRegistry, ServerDescriptor};
use rand::seq::IndexedRandom;
use std::collections::HashSet;

/// Servers already tried within one logical transfer, in the order they were tried.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the uuid was already excluded.
    pub fn insert(&mut self, uuid: &str) -> bool {
        if !self.seen.insert(uuid.to_string()) {
            return false;
        }
        self.order.push(uuid.to_string());
        true
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.seen.contains(uuid)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.order
    }
}

/// Criteria for one selection round. Empty `group` / `instance_id` match anything.
#[derive(Debug, Clone, Copy)]
pub struct SelectCriteria<'a> {
    pub group: &'a str,
    pub instance_id: &'a str,
    pub upload: bool,
}

impl SelectCriteria<'_> {
    pub fn matches(&self, member: &ServerDescriptor) -> bool {
        if self.upload && member.read_only {
            return false;
        }
        let group_match = self.group.is_empty() || self.group == member.group;
        let instance_match = self.instance_id.is_empty() || self.instance_id == member.instance_id;
        group_match && instance_match
    }
}

#[derive(Clone)]
pub struct StorageSelector {
    registry: DynMemberRegistry,
}

impl StorageSelector {
    pub fn new(registry: DynMemberRegistry) -> Self {
        Self { registry }
    }

    /// Pick one eligible, unexcluded member uniformly at random. `None` means the
    /// candidates are exhausted.
    pub async fn select(
        &self,
        criteria: SelectCriteria<'_>,
        excludes: &ExclusionSet,
    ) -> Option<ServerDescriptor> {
        let members = self.registry.list_live_members().await;
        let picked = pick_member(&members, criteria, excludes, &mut rand::rng()).cloned();

        match &picked {
            Some(member) => tracing::debug!(
                "selected storage uuid={} addr={} group={} instance={} upload={} excluded={}",
                member.uuid,
                member.access_addr(),
                criteria.group,
                criteria.instance_id,
                criteria.upload,
                excludes.len()
            ),
            None => tracing::debug!(
                "no storage matches group={} instance={} upload={} excluded={}",
                criteria.group,
                criteria.instance_id,
                criteria.upload,
                excludes.len()
            ),
        }

        picked
    }
}

pub fn pick_member<'a, R: rand::Rng + ?Sized>(
    members: &'a [ServerDescriptor],
    criteria: SelectCriteria<'_>,
    excludes: &ExclusionSet,
    rng: &mut R,
) -> Option<&'a ServerDescriptor> {
    let candidates: Vec<&ServerDescriptor> = members
        .iter()
        .filter(|member| !excludes.contains(&member.uuid) && criteria.matches(member))
        .collect();
    candidates.choose(rng).copied()
}
