use std::collections::HashMap;

use parking_lot::RwLock;

use crate::config::Conventions;
use crate::context::TypeContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetroKind {
    /// The polyfill can stand in for the original at every use site.
    Replacement,
    /// The polyfill exposes static functions taking the original as an explicit receiver.
    Mixin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetroMapping {
    pub original: String,
    pub polyfill: String,
    pub kind: RetroKind,
    pub polyfill_is_interface: bool,
}

/// Finds the polyfill counterpart of a type by naming convention.
///
/// Lookups are memoized; the cache is shared by all workers of a phase.
pub struct Resolver<'c> {
    context: &'c TypeContext<'c>,
    conventions: &'c Conventions,
    cache: RwLock<HashMap<String, Option<RetroMapping>>>,
}

impl<'c> Resolver<'c> {
    pub fn new(context: &'c TypeContext<'c>, conventions: &'c Conventions) -> Self {
        Self {
            context,
            conventions,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &'c TypeContext<'c> {
        self.context
    }

    pub fn conventions(&self) -> &'c Conventions {
        self.conventions
    }

    /// `None` means "leave untouched": arrays, types already inside the polyfill namespace,
    /// and types without a polyfill on the context.
    pub fn resolve(&self, original: &str) -> Option<RetroMapping> {
        if let Some(cached) = self.cache.read().get(original) {
            return cached.clone();
        }
        let mapping = self.lookup(original);
        self.cache
            .write()
            .insert(original.to_string(), mapping.clone());
        mapping
    }

    fn lookup(&self, original: &str) -> Option<RetroMapping> {
        if original.is_empty()
            || original.starts_with('[')
            || self.conventions.is_polyfill(original)
        {
            return None;
        }
        let polyfill = self.conventions.polyfill_name(original);
        let stub = self.context.lookup(&polyfill)?;
        let kind = if stub.has_annotation(&self.conventions.mixin_marker) {
            RetroKind::Mixin
        } else {
            RetroKind::Replacement
        };
        Some(RetroMapping {
            original: original.to_string(),
            polyfill,
            kind,
            polyfill_is_interface: stub.is_interface(),
        })
    }
}
