use memtable::{DefaultByteRangeComparator, SharedComparator, DEFAULT_COMPARATOR_ID};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result};

/// Constructor for a comparator, registered under its stable id.
pub type ComparatorFactory = fn() -> SharedComparator;

fn default_factory() -> SharedComparator {
    Arc::new(DefaultByteRangeComparator)
}

/// Maps persisted comparator ids to constructors.
///
/// Populated once when the engine opens; ids found in the database
/// configuration file that are not registered fail the load with a
/// corruption error.
pub(crate) struct ComparatorRegistry {
    factories: HashMap<String, ComparatorFactory>,
    instances: HashMap<String, SharedComparator>,
}

impl ComparatorRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            instances: HashMap::new(),
        };
        registry.register(DEFAULT_COMPARATOR_ID, default_factory);
        registry
    }

    pub fn register(&mut self, id: &str, factory: ComparatorFactory) {
        self.factories.insert(id.to_string(), factory);
        self.instances.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Shared instance for `id`, constructed on first use.
    pub fn get(&mut self, id: &str) -> Result<SharedComparator> {
        if let Some(cmp) = self.instances.get(id) {
            return Ok(Arc::clone(cmp));
        }
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| Error::Corruption(format!("unknown comparator id '{}'", id)))?;
        let cmp = factory();
        if cmp.id() != id {
            return Err(Error::Internal(format!(
                "comparator registered as '{}' reports id '{}'",
                id,
                cmp.id()
            )));
        }
        self.instances.insert(id.to_string(), Arc::clone(&cmp));
        Ok(cmp)
    }

    /// Drops cached instances; registrations stay.
    pub fn reset(&mut self) {
        self.instances.clear();
    }
}
