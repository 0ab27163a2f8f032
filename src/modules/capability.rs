//! Typed capability registry.
//!
//! An active module publishes handles into [`ExposedItems`] under a
//! [`CapabilityKey<T>`]. Consumers look them up with the same key and get an
//! `Arc<T>` back, or a typed error when the item is missing or was exposed
//! with a different type.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::types::{Error, Result};

/// Name of a capability plus the type of the handle exposed under it.
pub struct CapabilityKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CapabilityKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for CapabilityKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CapabilityKey<T> {}

impl<T> fmt::Debug for CapabilityKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityKey")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Handles exposed by one active module.
#[derive(Default, Clone)]
pub struct ExposedItems {
    items: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ExposedItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `value` under `key`, replacing any previous item of that name.
    pub fn expose<T>(&mut self, key: &CapabilityKey<T>, value: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.items.insert(key.name.to_string(), Arc::new(value));
        self
    }

    /// Typed lookup.
    pub fn get<T>(&self, key: &CapabilityKey<T>) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let item = self
            .items
            .get(key.name)
            .ok_or_else(|| Error::CapabilityNotFound(key.name.to_string()))?;
        item.clone().downcast::<T>().map_err(|_| {
            Error::CapabilityTypeMismatch(format!(
                "'{}' is not a {}",
                key.name,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Debug for ExposedItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.items.keys()).finish()
    }
}
