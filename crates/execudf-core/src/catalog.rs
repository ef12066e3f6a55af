//! Catalog of executable functions loaded from a JSON document.
//!
//! ```json
//! {"functions": [{"name": "test_function", "command": ["input.sh"],
//!                 "arguments": [{"type": "UInt64"}], "result_type": "String"}]}
//! ```

use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::descriptor::FunctionDescriptor;
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct CatalogFile {
    functions: Vec<FunctionDescriptor>,
}

/// Validated, immutable set of function descriptors.
#[derive(Debug, Clone, Default)]
pub struct FunctionCatalog {
    functions: FxHashMap<String, Arc<FunctionDescriptor>>,
    /// Names in declaration order.
    order: Vec<String>,
}

impl FunctionCatalog {
    /// Build a catalog, validating every descriptor.
    pub fn new(descriptors: impl IntoIterator<Item = FunctionDescriptor>) -> Result<Self> {
        let mut catalog = Self::default();
        for descriptor in descriptors {
            descriptor.validate()?;
            if catalog.functions.contains_key(&descriptor.name) {
                return Err(Error::Config(format!(
                    "function '{}' is defined more than once",
                    descriptor.name
                )));
            }
            catalog.order.push(descriptor.name.clone());
            catalog
                .functions
                .insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        Ok(catalog)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid function catalog: {}", e)))?;
        Self::new(file.functions)
    }

    /// Load a catalog file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read catalog '{}': {}", path.display(), e))
        })?;
        let catalog = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), functions = catalog.len(), "loaded function catalog");
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<FunctionDescriptor>> {
        self.functions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FunctionDescriptor>> {
        self.order.iter().filter_map(|name| self.functions.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
