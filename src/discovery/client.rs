//! Coordination-service client capability
//!
//! The minimal operation set the core needs from a Zookeeper-like service:
//! persistent and ephemeral nodes, children enumeration, child-change
//! watches and session-state watches. A real client wraps the external
//! service; [`MemoryCoordinationClient`] is the in-process backend used by
//! default and by every test, with session loss simulation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

/// Child-change notification; the argument is the watched path.
pub type ChildrenChangedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Session-state notification; `true` means connected.
pub type SessionStateFn = Arc<dyn Fn(bool) + Send + Sync>;

/// Minimal coordination-service operations consumed by the core.
pub trait CoordinationClient: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Forward digest credentials; a backend without auth accepts anything.
    fn add_auth(&self, username: &str, password: &str) -> bool;

    fn exists(&self, path: &str) -> bool;

    /// Create the persistent node chain up to `path`; existing nodes are
    /// not an error.
    fn ensure_path(&self, path: &str) -> bool;

    /// Create an ephemeral node; an existing node is replaced.
    fn create_ephemeral(&self, path: &str, data: &str) -> bool;

    /// Delete a node; "not found" is not an error.
    fn delete(&self, path: &str) -> bool;

    /// Update a node's value; fails if the node is gone.
    fn set_data(&self, path: &str, data: &str) -> bool;

    fn get_data(&self, path: &str) -> Option<String>;

    /// Direct children names (no path prefix); empty if the node is absent.
    fn get_children(&self, path: &str) -> Vec<String>;

    /// Watch for child-set changes under `path`. Watches persist until the
    /// client is dropped; callbacks run outside the client's locks.
    fn watch_children(&self, path: &str, callback: ChildrenChangedFn) -> bool;

    /// Watch session-state transitions. If already connected the callback
    /// fires once immediately.
    fn watch_session(&self, callback: SessionStateFn) -> bool;
}

struct NodeRecord {
    data: String,
    ephemeral: bool,
}

#[derive(Default)]
struct MemoryTree {
    nodes: BTreeMap<String, NodeRecord>,
    child_watches: HashMap<String, Vec<ChildrenChangedFn>>,
    session_watches: Vec<SessionStateFn>,
}

impl MemoryTree {
    fn watchers_of(&self, path: &str) -> Vec<(ChildrenChangedFn, String)> {
        self.child_watches
            .get(path)
            .map(|callbacks| {
                callbacks
                    .iter()
                    .map(|cb| (Arc::clone(cb), path.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-process coordination backend with simulated session lifecycle.
pub struct MemoryCoordinationClient {
    tree: Mutex<MemoryTree>,
    connected: AtomicBool,
}

impl MemoryCoordinationClient {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryCoordinationClient {
            tree: Mutex::new(MemoryTree::default()),
            connected: AtomicBool::new(true),
        })
    }

    /// Simulate losing the session: every ephemeral node disappears and
    /// session watchers observe the disconnect.
    pub fn sever_session(&self) {
        self.connected.store(false, Ordering::SeqCst);

        // Notifications are collected under the lock and invoked after it
        // is released.
        let (session_callbacks, child_notifications) = {
            let mut tree = self.lock_tree();
            let ephemeral: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, record)| record.ephemeral)
                .map(|(path, _)| path.clone())
                .collect();
            let mut notifications = Vec::new();
            for path in ephemeral {
                tree.nodes.remove(&path);
                if let Some(parent) = parent_of(&path) {
                    notifications.extend(tree.watchers_of(&parent));
                }
            }
            (tree.session_watches.clone(), notifications)
        };

        info!("coordination session severed");
        for callback in &session_callbacks {
            callback(false);
        }
        for (callback, path) in child_notifications {
            callback(&path);
        }
    }

    /// Simulate session re-establishment.
    pub fn restore_session(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let callbacks = self.lock_tree().session_watches.clone();
        info!("coordination session restored");
        for callback in &callbacks {
            callback(true);
        }
    }

    /// All node paths currently in the tree (test inspection).
    pub fn node_paths(&self) -> Vec<String> {
        self.lock_tree().nodes.keys().cloned().collect()
    }

    fn lock_tree(&self) -> std::sync::MutexGuard<'_, MemoryTree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_parent_of(&self, path: &str) {
        let notifications = {
            let tree = self.lock_tree();
            parent_of(path)
                .map(|parent| tree.watchers_of(&parent))
                .unwrap_or_default()
        };
        for (callback, watched) in notifications {
            callback(&watched);
        }
    }
}

impl CoordinationClient for MemoryCoordinationClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn add_auth(&self, username: &str, _password: &str) -> bool {
        debug!(username, "accepted digest auth");
        self.is_connected()
    }

    fn exists(&self, path: &str) -> bool {
        self.lock_tree().nodes.contains_key(path)
    }

    fn ensure_path(&self, path: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut created = Vec::new();
        {
            let mut tree = self.lock_tree();
            let mut current = String::new();
            for part in path.split('/').filter(|part| !part.is_empty()) {
                current.push('/');
                current.push_str(part);
                if !tree.nodes.contains_key(&current) {
                    tree.nodes.insert(
                        current.clone(),
                        NodeRecord {
                            data: String::new(),
                            ephemeral: false,
                        },
                    );
                    created.push(current.clone());
                }
            }
        }
        for path in created {
            self.notify_parent_of(&path);
        }
        true
    }

    fn create_ephemeral(&self, path: &str, data: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        if let Some(parent) = parent_of(path) {
            if !self.ensure_path(&parent) {
                return false;
            }
        }
        self.lock_tree().nodes.insert(
            path.to_string(),
            NodeRecord {
                data: data.to_string(),
                ephemeral: true,
            },
        );
        self.notify_parent_of(path);
        true
    }

    fn delete(&self, path: &str) -> bool {
        // Reads and deletes keep working while "disconnected": the tree is
        // in-process, and session-loss cleanup must be able to remove its
        // residue. Only creates and updates are session-gated.
        let removed = {
            let mut tree = self.lock_tree();
            let prefix = format!("{path}/");
            let has_children = tree
                .nodes
                .range(prefix.clone()..)
                .next()
                .is_some_and(|(candidate, _)| candidate.starts_with(&prefix));
            if has_children {
                // Like the real service: a populated node cannot be deleted.
                debug!(path, "refusing to delete node with children");
                return false;
            }
            tree.nodes.remove(path).is_some()
        };
        if removed {
            self.notify_parent_of(path);
        }
        true
    }

    fn set_data(&self, path: &str, data: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut tree = self.lock_tree();
        match tree.nodes.get_mut(path) {
            Some(record) => {
                record.data = data.to_string();
                true
            }
            None => false,
        }
    }

    fn get_data(&self, path: &str) -> Option<String> {
        self.lock_tree()
            .nodes
            .get(path)
            .map(|record| record.data.clone())
    }

    fn get_children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.lock_tree()
            .nodes
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .filter_map(|(candidate, _)| {
                let rest = &candidate[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn watch_children(&self, path: &str, callback: ChildrenChangedFn) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.lock_tree()
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(callback);
        true
    }

    fn watch_session(&self, callback: SessionStateFn) -> bool {
        let connected = self.is_connected();
        self.lock_tree().session_watches.push(Arc::clone(&callback));
        if connected {
            callback(true);
        }
        true
    }
}

fn parent_of(path: &str) -> Option<String> {
    let index = path.rfind('/')?;
    if index == 0 {
        None
    } else {
        Some(path[..index].to_string())
    }
}
