//! Node tree and watch registry behind the testing cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use trellis_client::{CoordinationError, CreateMode, EventType, Result, WatchedEvent, Watcher};

struct Node {
    data: Vec<u8>,
    owner: Option<i64>,
    next_sequence: u64,
}

/// A mutation that may trigger watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
    Created(String),
    Deleted(String),
    DataChanged(String),
}

pub(crate) struct DataTree {
    nodes: BTreeMap<String, Node>,
}

impl DataTree {
    pub(crate) fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                owner: None,
                next_sequence: 0,
            },
        );
        Self { nodes }
    }

    pub(crate) fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session: i64,
    ) -> Result<(String, Change)> {
        validate(path)?;
        if path == "/" {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }

        let parent_path = parent(path);
        let parent = self
            .nodes
            .get_mut(parent_path)
            .ok_or_else(|| CoordinationError::NoNode(parent_path.to_string()))?;
        if parent.owner.is_some() {
            return Err(CoordinationError::NoChildrenForEphemerals(path.to_string()));
        }

        let actual = if mode.is_sequential() {
            let sequence = parent.next_sequence;
            format!("{path}{sequence:010}")
        } else {
            path.to_string()
        };
        // the counter advances even when the create is rejected below
        parent.next_sequence += 1;

        if self.nodes.contains_key(&actual) {
            return Err(CoordinationError::NodeExists(actual));
        }

        self.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                owner: mode.is_ephemeral().then_some(session),
                next_sequence: 0,
            },
        );
        Ok((actual.clone(), Change::Created(actual)))
    }

    pub(crate) fn delete(&mut self, path: &str) -> Result<Change> {
        validate(path)?;
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if !self.child_names(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        Ok(Change::Deleted(path.to_string()))
    }

    pub(crate) fn exists(&self, path: &str) -> Result<bool> {
        validate(path)?;
        Ok(self.nodes.contains_key(path))
    }

    pub(crate) fn data(&self, path: &str) -> Result<Vec<u8>> {
        validate(path)?;
        self.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    pub(crate) fn set_data(&mut self, path: &str, data: &[u8]) -> Result<Change> {
        validate(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        Ok(Change::DataChanged(path.to_string()))
    }

    pub(crate) fn children(&self, path: &str) -> Result<Vec<String>> {
        validate(path)?;
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(self.child_names(path))
    }

    /// Paths of every node owned by `session`.
    pub(crate) fn ephemerals(&self, session: i64) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub(crate) fn clear_ephemerals(&mut self) -> Vec<Change> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.is_some())
            .map(|(path, _)| path.clone())
            .collect();
        owned
            .into_iter()
            .filter_map(|path| self.delete(&path).ok())
            .collect()
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .filter_map(|(candidate, _)| {
                let name = &candidate[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }
}

pub(crate) fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn validate(path: &str) -> Result<()> {
    let well_formed = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if well_formed {
        Ok(())
    } else {
        Err(CoordinationError::invalid_state(format!("invalid path: {path:?}")))
    }
}

type WatchList = Vec<(i64, Arc<dyn Watcher>)>;

/// One-shot watches keyed by path.
#[derive(Default)]
pub(crate) struct Watches {
    data: HashMap<String, WatchList>,
    children: HashMap<String, WatchList>,
}

impl Watches {
    pub(crate) fn add_data(&mut self, path: &str, session: i64, watcher: Arc<dyn Watcher>) {
        self.data
            .entry(path.to_string())
            .or_default()
            .push((session, watcher));
    }

    pub(crate) fn add_children(&mut self, path: &str, session: i64, watcher: Arc<dyn Watcher>) {
        self.children
            .entry(path.to_string())
            .or_default()
            .push((session, watcher));
    }

    pub(crate) fn remove_session(&mut self, session: i64) {
        for list in self.data.values_mut().chain(self.children.values_mut()) {
            list.retain(|(owner, _)| *owner != session);
        }
        self.data.retain(|_, list| !list.is_empty());
        self.children.retain(|_, list| !list.is_empty());
    }

    /// Remove and return the watches triggered by `change`.
    pub(crate) fn trigger(&mut self, change: &Change) -> Vec<(i64, Arc<dyn Watcher>, WatchedEvent)> {
        let mut fired = Vec::new();

        let mut take = |map: &mut HashMap<String, WatchList>, path: &str, event_type| {
            for (session, watcher) in map.remove(path).unwrap_or_default() {
                fired.push((session, watcher, WatchedEvent::node(event_type, path)));
            }
        };

        match change {
            Change::Created(path) => {
                take(&mut self.data, path, EventType::NodeCreated);
                take(&mut self.children, parent(path), EventType::NodeChildrenChanged);
            }
            Change::Deleted(path) => {
                take(&mut self.data, path, EventType::NodeDeleted);
                take(&mut self.children, path, EventType::NodeDeleted);
                take(&mut self.children, parent(path), EventType::NodeChildrenChanged);
            }
            Change::DataChanged(path) => {
                take(&mut self.data, path, EventType::NodeDataChanged);
            }
        }

        fired
    }
}
