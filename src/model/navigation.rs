//! Navigation: a relation that may or may not have been loaded yet.
//!
//! Nodes read back from a store carry their children and closure sets as
//! `Navigation::Unloaded` until the caller asks for them. "Not loaded" and
//! "empty" are different states, and reading the former is an error.

use serde::{Deserialize, Serialize};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Navigation<T> {
    Unloaded,
    Loaded(T),
}

impl<T> Navigation<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Navigation::Loaded(_))
    }

    /// Borrow the loaded value, or fail with `NavigationNotLoaded(name)`.
    pub fn get(&self, name: &'static str) -> Result<&T> {
        match self {
            Navigation::Loaded(v) => Ok(v),
            Navigation::Unloaded => Err(Error::NavigationNotLoaded(name)),
        }
    }

    pub fn get_mut(&mut self, name: &'static str) -> Result<&mut T> {
        match self {
            Navigation::Loaded(v) => Ok(v),
            Navigation::Unloaded => Err(Error::NavigationNotLoaded(name)),
        }
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Navigation::Loaded(v) => Some(v),
            Navigation::Unloaded => None,
        }
    }
}

impl<T> Default for Navigation<T> {
    fn default() -> Self {
        Navigation::Unloaded
    }
}

impl<T> From<Option<T>> for Navigation<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Navigation::Unloaded, Navigation::Loaded)
    }
}
