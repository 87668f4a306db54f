//! Group membership: the set of remote peers known to be in one named
//! group. Groups hold UUID references into the peer table, never peers.

use std::collections::BTreeSet;

use crate::identity::NodeUuid;

pub struct ZreGroup {
    name: String,
    members: BTreeSet<NodeUuid>,
}

impl ZreGroup {
    pub fn new(name: &str) -> Self {
        ZreGroup {
            name: name.to_string(),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(&mut self, uuid: NodeUuid) -> bool {
        self.members.insert(uuid)
    }

    pub fn leave(&mut self, uuid: NodeUuid) -> bool {
        self.members.remove(&uuid)
    }

    pub fn contains(&self, uuid: NodeUuid) -> bool {
        self.members.contains(&uuid)
    }

    pub fn members(&self) -> impl Iterator<Item = NodeUuid> + '_ {
        self.members.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
