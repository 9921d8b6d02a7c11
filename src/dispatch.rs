use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::error::BusError;
use crate::platform::Outbound;

/// Collects outbound senders during startup.
#[derive(Default)]
pub struct DispatchTableBuilder {
    entries: HashMap<String, Arc<dyn Outbound>>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        outbound: Arc<dyn Outbound>,
    ) -> Result<(), BusError> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(BusError::DuplicateAdapter(key));
        }
        info!("Registered outbound sender for {}", key);
        self.entries.insert(key, outbound);
        Ok(())
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            entries: self.entries,
        }
    }
}

/// Adapter identity → outbound sender. Immutable once built, so it is
/// shared across event tasks without a lock.
pub struct DispatchTable {
    entries: HashMap<String, Arc<dyn Outbound>>,
}

impl DispatchTable {
    pub fn resolve(&self, key: &str) -> Result<Arc<dyn Outbound>, BusError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| BusError::DispatchNotFound(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
