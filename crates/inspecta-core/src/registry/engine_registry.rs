//! In-memory table of engine plugins keyed by engine id.

use crate::algorithm::{AlgorithmEngine, PluginDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// A registered engine together with the descriptor it was loaded under.
#[derive(Clone)]
pub struct EnginePlugin {
    descriptor: PluginDescriptor,
    engine: Arc<dyn AlgorithmEngine>,
}

impl EnginePlugin {
    pub fn new(descriptor: PluginDescriptor, engine: Arc<dyn AlgorithmEngine>) -> Self {
        Self { descriptor, engine }
    }

    /// Wrap an engine constructed in code.
    pub fn from_engine(engine: Arc<dyn AlgorithmEngine>, kind: impl Into<String>) -> Self {
        let descriptor = PluginDescriptor::for_engine(engine.as_ref(), kind);
        Self { descriptor, engine }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn engine(&self) -> &Arc<dyn AlgorithmEngine> {
        &self.engine
    }
}

impl std::fmt::Debug for EnginePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePlugin")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryTable {
    /// Ids in first-registration order.
    order: Vec<String>,
    entries: HashMap<String, Arc<EnginePlugin>>,
}

/// Process-wide engine table owned by the composition root.
///
/// Ids compare case-sensitively. Registering an existing id replaces the
/// entry in place (last registration wins) and keeps its list position.
/// Reads and writes may interleave from any thread.
#[derive(Default)]
pub struct EngineRegistry {
    table: RwLock<RegistryTable>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one plugin. Returns the plugin it replaced, if any.
    pub fn register(&self, plugin: EnginePlugin) -> Option<Arc<EnginePlugin>> {
        let mut table = match self.table.write() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = plugin.id().to_string();
        let replaced = table.entries.insert(id.clone(), Arc::new(plugin));
        match &replaced {
            Some(old) => info!(
                "Replaced engine '{}' (version {} -> {})",
                id,
                old.descriptor().version,
                table.entries[&id].descriptor().version
            ),
            None => {
                debug!("Registered engine '{}'", id);
                table.order.push(id);
            }
        }
        replaced
    }

    /// Insert every plugin in order. Duplicate ids never fail; the last one wins.
    pub fn register_range(&self, plugins: impl IntoIterator<Item = EnginePlugin>) -> usize {
        plugins
            .into_iter()
            .map(|plugin| self.register(plugin))
            .count()
    }

    /// Look up a plugin. Unknown ids yield `None`, never an error.
    pub fn get(&self, id: &str) -> Option<Arc<EnginePlugin>> {
        self.read(|table| table.entries.get(id).cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read(|table| table.entries.contains_key(id))
    }

    /// Remove a plugin by id.
    pub fn unregister(&self, id: &str) -> Option<Arc<EnginePlugin>> {
        let mut table = match self.table.write() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = table.entries.remove(id);
        if removed.is_some() {
            table.order.retain(|existing| existing != id);
        }
        removed
    }

    /// Snapshot of all plugins in registration order.
    ///
    /// The iterator owns its snapshot, so the table may change while it is
    /// being consumed without affecting it.
    pub fn list(&self) -> impl Iterator<Item = Arc<EnginePlugin>> {
        let snapshot: Vec<Arc<EnginePlugin>> = self.read(|table| {
            table
                .order
                .iter()
                .filter_map(|id| table.entries.get(id).cloned())
                .collect()
        });
        snapshot.into_iter()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.list().map(|p| p.descriptor().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read(|table| table.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryTable) -> T) -> T {
        match self.table.read() {
            Ok(table) => f(&table),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}
