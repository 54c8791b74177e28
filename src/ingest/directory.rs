//! Node display-name directory.
//!
//! Names come from an in-memory map first, then from `node_info`, and fall back to the
//! `!xxxxxxxx` form. The map is released wholesale by [`NodeDirectory::clear`]; a reader racing
//! an eviction simply repopulates from the store.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::node_id::format_node_id;
use crate::storage::Storage;
use crate::traceroute::NodeNameLookup;

pub struct NodeDirectory {
    storage: Storage,
    names: RwLock<HashMap<u32, String>>,
}

impl NodeDirectory {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            names: RwLock::new(HashMap::new()),
        }
    }

    /// Best display name for `node_id`; never empty.
    pub fn label(&self, node_id: u32) -> String {
        if let Some(name) = self
            .names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node_id)
        {
            return name.clone();
        }

        let name = match self.storage.get_node(node_id) {
            Ok(Some(node)) => node.display_name().map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                warn!("Node lookup for {} failed: {}", format_node_id(node_id), e);
                None
            }
        };

        match name {
            Some(name) => {
                self.remember(node_id, &name);
                name
            }
            None => format_node_id(node_id),
        }
    }

    /// Record a freshly announced name.
    pub fn remember(&self, node_id: u32, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id, name.to_string());
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached name; returns how many were released.
    pub fn clear(&self) -> usize {
        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        let released = names.len();
        names.clear();
        if released > 0 {
            debug!("Released {} cached node names", released);
        }
        released
    }
}

impl NodeNameLookup for NodeDirectory {
    fn display_name(&self, node_id: u32) -> Option<String> {
        Some(self.label(node_id))
    }
}
