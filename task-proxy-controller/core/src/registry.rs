use crate::{fingerprint, Task, TaskList};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// The published task set of one discovery pass: `fingerprint -> Task`, plus
/// the content-addressed version over the sorted set.
///
/// A registry is immutable once built. The discovery loop builds a fresh one
/// per pass and swaps it into a [`SharedRegistry`] whole, so concurrent
/// readers always observe one coherent pass.
#[derive(Debug, Default)]
pub struct Registry {
    version: String,
    tasks: Vec<(String, Task)>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Builds the registry for one pass. Tasks are ordered by [`Task::id`];
    /// tasks with no live jobs are dropped so they can never reach the
    /// snapshot builder. The version hashes the concatenated
    /// [`Task::id_with_host_port`] over the retained sequence.
    pub fn new(mut tasks: TaskList) -> Self {
        tasks.sort();

        let mut buf = String::new();
        let mut kept = Vec::new();
        let mut index = HashMap::new();
        for task in tasks {
            if task.jobs.is_empty() {
                continue;
            }
            buf.push_str(&task.id_with_host_port());
            let hash = fingerprint(task.id().as_bytes());
            index.insert(hash.clone(), kept.len());
            kept.push((hash, task));
        }

        Self {
            version: fingerprint(buf.as_bytes()),
            tasks: kept,
            index,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, fingerprint: &str) -> Option<&Task> {
        self.index.get(fingerprint).map(|i| &self.tasks[*i].1)
    }

    /// `(fingerprint, task)` pairs in task id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Task)> {
        self.tasks.iter().map(|(hash, task)| (hash.as_str(), task))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Handle shared between the discovery loop (single writer) and the
/// authorization server (many readers).
///
/// The lock guards only the pointer: writers swap in a fully built registry,
/// readers clone the inner `Arc` and read lock-free from then on.
#[derive(Clone, Debug, Default)]
pub struct SharedRegistry(Arc<RwLock<Arc<Registry>>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, registry: Arc<Registry>) {
        *self.0.write() = registry;
    }

    pub fn load(&self) -> Arc<Registry> {
        self.0.read().clone()
    }
}
