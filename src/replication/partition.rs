//! Title type to node placement
//!
//! `primary()` is a pure function of the configuration and is shared by the
//! read and write paths, so a title is always looked for where it was
//! written.

use std::collections::HashMap;

use super::errors::{ReplicationError, ReplicationResult};
use crate::model::TitleType;
use crate::node::{NodeConfig, NodeId, NodeRole};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    central: NodeId,
    /// Fragments in configuration order; fallback and lock order follow it.
    fragments: Vec<NodeId>,
    owners: HashMap<TitleType, NodeId>,
    default_fragment: NodeId,
}

impl PartitionMap {
    pub fn from_nodes(nodes: &[NodeConfig]) -> ReplicationResult<Self> {
        let mut central = None;
        let mut fragments = Vec::new();
        let mut owners = HashMap::new();
        let mut default_fragment = None;

        for node in nodes {
            if fragments.contains(&node.id) || central.as_ref() == Some(&node.id) {
                return Err(ReplicationError::configuration_error(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            match node.role {
                NodeRole::Central => {
                    if let Some(existing) = &central {
                        return Err(ReplicationError::configuration_error(format!(
                            "two central nodes configured: {} and {}",
                            existing, node.id
                        )));
                    }
                    central = Some(node.id.clone());
                }
                NodeRole::Fragment => {
                    for title_type in &node.title_types {
                        if let Some(owner) = owners.insert(*title_type, node.id.clone()) {
                            return Err(ReplicationError::configuration_error(format!(
                                "title type {} owned by both {} and {}",
                                title_type, owner, node.id
                            )));
                        }
                    }
                    if node.catch_all {
                        if let Some(existing) = &default_fragment {
                            return Err(ReplicationError::configuration_error(format!(
                                "two catch-all fragments configured: {} and {}",
                                existing, node.id
                            )));
                        }
                        default_fragment = Some(node.id.clone());
                    }
                    fragments.push(node.id.clone());
                }
            }
        }

        let central = central
            .ok_or_else(|| ReplicationError::configuration_error("no central node configured"))?;
        if fragments.is_empty() {
            return Err(ReplicationError::configuration_error(
                "at least one fragment node is required",
            ));
        }
        let default_fragment = default_fragment.ok_or_else(|| {
            ReplicationError::configuration_error("no catch-all fragment configured")
        })?;

        Ok(Self {
            central,
            fragments,
            owners,
            default_fragment,
        })
    }

    pub fn central(&self) -> &NodeId {
        &self.central
    }

    pub fn fragments(&self) -> &[NodeId] {
        &self.fragments
    }

    /// Fragment that owns `title_type`.
    pub fn primary(&self, title_type: TitleType) -> &NodeId {
        self.owners.get(&title_type).unwrap_or(&self.default_fragment)
    }

    /// The single fragment a type filter confines a read to.
    pub fn pinned_fragment(&self, title_type: Option<TitleType>) -> Option<&NodeId> {
        title_type.map(|t| self.primary(t))
    }

    pub fn is_central(&self, node: &NodeId) -> bool {
        self.central == *node
    }

    /// Every node, Central first.
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeId> {
        std::iter::once(&self.central).chain(self.fragments.iter())
    }
}
