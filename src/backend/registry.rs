//! Ordered target groups and the administrative operations on them.
//!
//! Groups are tried in order: the round-robin algorithm exhausts every
//! target of group 0 before moving on to group 1. Groups and targets can be
//! added and removed at runtime; readers always take a snapshot and
//! re-validate indices against it.

use crate::backend::algorithms::AlgorithmChain;
use crate::backend::target::{Target, TargetSnapshot};
use crate::config::{Config, TargetSettings};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from runtime changes to the target layout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("no target group {0}")]
    NoSuchGroup(usize),

    #[error("no target {address} in group {group}")]
    NoSuchTarget { group: usize, address: SocketAddr },

    #[error("target {0} already exists")]
    DuplicateTarget(SocketAddr),

    #[error("group index {index} out of range (0..={len})")]
    InvalidGroupIndex { index: usize, len: usize },
}

/// One failover group of targets.
#[derive(Debug, Default)]
pub struct TargetGroup {
    targets: RwLock<Vec<Arc<Target>>>,
}

impl TargetGroup {
    pub fn new(targets: Vec<Arc<Target>>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    /// Current members, in rotation order.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.targets.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<Arc<Target>> {
        self.targets.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, address: SocketAddr) -> Option<Arc<Target>> {
        self.targets.read().iter().find(|t| t.address() == address).cloned()
    }
}

/// Snapshot of one group for reporting.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub index: usize,
    pub targets: Vec<TargetSnapshot>,
}

/// All target groups of the balancer.
pub struct TargetRegistry {
    groups: RwLock<Vec<Arc<TargetGroup>>>,
    settings: TargetSettings,
    chain: AlgorithmChain,
}

impl TargetRegistry {
    /// An empty registry; targets added later share `settings` and `chain`.
    pub fn new(settings: TargetSettings, chain: AlgorithmChain) -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            settings,
            chain,
        }
    }

    /// Create every configured target. Must run inside a tokio runtime.
    pub fn from_config(config: &Config, chain: AlgorithmChain) -> Self {
        let settings = config.target_settings();
        let groups = config
            .target_groups
            .iter()
            .map(|group| {
                let targets = group
                    .targets
                    .iter()
                    .map(|address| Target::new(*address, settings, chain.clone()))
                    .collect();
                Arc::new(TargetGroup::new(targets))
            })
            .collect();

        Self {
            groups: RwLock::new(groups),
            settings,
            chain,
        }
    }

    pub fn group(&self, index: usize) -> Option<Arc<TargetGroup>> {
        self.groups.read().get(index).cloned()
    }

    pub fn groups(&self) -> Vec<Arc<TargetGroup>> {
        self.groups.read().clone()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Every target of every group, in group order.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.groups().iter().flat_map(|g| g.targets()).collect()
    }

    /// Find a target by address in any group.
    pub fn find(&self, address: SocketAddr) -> Option<Arc<Target>> {
        self.groups().iter().find_map(|g| g.find(address))
    }

    fn find_in(&self, group: usize, address: SocketAddr) -> Result<Arc<Target>, AdminError> {
        self.group(group)
            .ok_or(AdminError::NoSuchGroup(group))?
            .find(address)
            .ok_or(AdminError::NoSuchTarget { group, address })
    }

    /// Create a target at the end of `group`.
    pub fn add_target(&self, group: usize, address: SocketAddr) -> Result<Arc<Target>, AdminError> {
        // Holding the outer write lock keeps the duplicate check and the
        // insert atomic with respect to other admin changes.
        let groups = self.groups.write();
        let members = groups.get(group).ok_or(AdminError::NoSuchGroup(group))?;
        if groups.iter().any(|g| g.find(address).is_some()) {
            return Err(AdminError::DuplicateTarget(address));
        }

        let target = Target::new(address, self.settings, self.chain.clone());
        members.targets.write().push(Arc::clone(&target));
        info!(group, target = %address, "target added");
        Ok(target)
    }

    /// Remove a target from `group` and terminate its connections.
    pub fn remove_target(&self, group: usize, address: SocketAddr) -> Result<(), AdminError> {
        let removed = {
            let groups = self.groups.write();
            let members = groups.get(group).ok_or(AdminError::NoSuchGroup(group))?;
            let mut targets = members.targets.write();
            let position = targets
                .iter()
                .position(|t| t.address() == address)
                .ok_or(AdminError::NoSuchTarget { group, address })?;
            targets.remove(position)
        };

        removed.retire();
        info!(group, target = %address, "target removed");
        Ok(())
    }

    /// Insert an empty group at `index`; existing groups from `index` on
    /// shift back by one.
    pub fn add_group(&self, index: usize) -> Result<(), AdminError> {
        let mut groups = self.groups.write();
        if index > groups.len() {
            return Err(AdminError::InvalidGroupIndex {
                index,
                len: groups.len(),
            });
        }
        groups.insert(index, Arc::new(TargetGroup::default()));
        info!(group = index, "target group added");
        Ok(())
    }

    /// Remove the group at `index` and terminate all its targets' connections.
    pub fn remove_group(&self, index: usize) -> Result<(), AdminError> {
        let removed = {
            let mut groups = self.groups.write();
            if index >= groups.len() {
                return Err(AdminError::NoSuchGroup(index));
            }
            groups.remove(index)
        };

        for target in removed.targets() {
            target.retire();
        }
        info!(group = index, "target group removed");
        Ok(())
    }

    pub fn enable_target(&self, group: usize, address: SocketAddr) -> Result<(), AdminError> {
        self.find_in(group, address)?.enable();
        Ok(())
    }

    pub fn disable_target(&self, group: usize, address: SocketAddr) -> Result<(), AdminError> {
        self.find_in(group, address)?.disable();
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.groups()
            .iter()
            .enumerate()
            .map(|(index, group)| GroupSnapshot {
                index,
                targets: group.targets().iter().map(|t| t.snapshot()).collect(),
            })
            .collect()
    }
}
