//! Export of item definitions for external provisioning tooling.

use std::fs;
use std::path::Path;

use tracing::{error, info};

use crate::errors::TrapperError;
use crate::item::CreateTrapperItem;

/// Accumulates [`CreateTrapperItem`]s from tasks and writes them out as a
/// JSON array.
#[derive(Debug, Default)]
pub struct ItemCatalog {
    items: Vec<CreateTrapperItem>,
}

impl ItemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&mut self, item: CreateTrapperItem) {
        self.items.push(item);
    }

    pub fn add_items(&mut self, items: impl IntoIterator<Item = CreateTrapperItem>) {
        self.items.extend(items);
    }

    pub fn items(&self) -> &[CreateTrapperItem] {
        &self.items
    }

    /// Write the catalog to `path` as indented JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), TrapperError> {
        let path = path.as_ref();
        let result = serde_json::to_string_pretty(&self.items)
            .map_err(TrapperError::from)
            .and_then(|json| fs::write(path, json).map_err(TrapperError::from));

        match &result {
            Ok(()) => info!(path = %path.display(), count = self.items.len(), "items saved to file"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to save items to file"),
        }
        result
    }
}
