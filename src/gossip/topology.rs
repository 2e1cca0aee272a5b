// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Static mapping from broadcast group names to typed listeners.
//!
//! The mapping is filled while wiring the node and validated against the
//! configured groups before the router starts accepting traffic.

use crate::{Error, ErrorKind, Result};
use std::{collections::HashMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Receiver of the application messages of one broadcast group.
#[cfg_attr(test, automock)]
pub trait GossipListener: Send + Sync + 'static {
    /// Delivers a message addressed to this node (or broadcast).
    fn gossip_message_received(
        &self,
        from: &str,
        broadcast_group: &str,
        object_type: &str,
        payload: &[u8],
    ) -> Result<()>;
}

/// Broadcast group listeners registry.
#[derive(Default, Clone)]
pub struct Topology {
    listeners: HashMap<String, Arc<dyn GossipListener>>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    /// Binds `group` to `listener`, replacing any previous binding.
    pub fn register(&mut self, group: &str, listener: Arc<dyn GossipListener>) {
        if self.listeners.insert(group.to_owned(), listener).is_some() {
            warn!("[gossip] listener for group '{}' replaced", group);
        }
    }

    /// Listener bound to `group`.
    ///
    /// # Errors
    ///
    /// `UnknownBroadcastGroup` if nothing is bound to the group.
    pub fn resolve(&self, group: &str) -> Result<Arc<dyn GossipListener>> {
        self.listeners.get(group).cloned().ok_or_else(|| {
            Error::new_ext(
                ErrorKind::UnknownBroadcastGroup,
                format!("invalid broadcast group: [{}]", group),
            )
        })
    }

    /// Checks that every group in `required` has a listener.
    pub fn validate(&self, required: &[String]) -> Result<()> {
        match required.iter().find(|g| !self.listeners.contains_key(*g)) {
            Some(group) => Err(Error::new_ext(
                ErrorKind::UnknownBroadcastGroup,
                format!("no listener for configured group: [{}]", group),
            )),
            None => Ok(()),
        }
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.listeners.keys().cloned().collect();
        groups.sort();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_topology() -> Topology {
        let mut listener = MockGossipListener::new();
        listener
            .expect_gossip_message_received()
            .returning(|_, _, _, _| Ok(()));
        let mut topology = Topology::new();
        topology.register("consensus", Arc::new(listener));
        topology
    }

    #[test]
    fn resolve_registered_group() {
        let topology = create_topology();

        let listener = topology.resolve("consensus").unwrap();

        assert!(listener
            .gossip_message_received("alice", "consensus", "RaftMessage", &[])
            .is_ok());
    }

    #[test]
    fn resolve_unknown_group() {
        let topology = create_topology();

        let err = topology.resolve("transactions").err().unwrap();

        assert_eq!(err.kind, ErrorKind::UnknownBroadcastGroup);
    }

    #[test]
    fn validate_configured_groups() {
        let topology = create_topology();

        assert!(topology.validate(&["consensus".to_string()]).is_ok());
        let err = topology
            .validate(&["consensus".to_string(), "blocks".to_string()])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownBroadcastGroup);
        assert_eq!(topology.groups(), vec!["consensus".to_string()]);
    }
}
