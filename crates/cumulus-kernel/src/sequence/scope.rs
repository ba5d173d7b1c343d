//! Layered scope for sequence runs.
//!
//! Every step runs in a fresh frame stacked on top of the previous step's
//! frames. Lookups search innermost to outermost, so a later step sees every
//! earlier `set` unless it shadows the key itself.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A value stored in a sequence scope.
pub type ScopeValue = Arc<dyn Any + Send + Sync>;

/// Wrap any value for storage in a scope.
pub fn scope_value<V: Any + Send + Sync>(value: V) -> ScopeValue {
    Arc::new(value)
}

/// Stack of key-value frames. Last element is the innermost frame.
#[derive(Clone)]
pub struct Scope {
    frames: Vec<HashMap<String, ScopeValue>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Create a scope with one empty frame.
    pub fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    /// Create a scope whose base frame holds `values`.
    pub fn with_values(values: impl IntoIterator<Item = (String, ScopeValue)>) -> Self {
        Self {
            frames: vec![values.into_iter().collect()],
        }
    }

    /// Push a new innermost frame.
    pub fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Set a value in the innermost frame.
    pub fn set(&mut self, key: impl Into<String>, value: ScopeValue) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(key.into(), value);
        }
    }

    /// Raw lookup, innermost frame first.
    pub fn get_raw(&self, key: &str) -> Option<&ScopeValue> {
        self.frames.iter().rev().find_map(|frame| frame.get(key))
    }

    /// Typed lookup. A value of a different type reads as absent.
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.get_raw(key).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }

    /// Flatten all frames into a snapshot, inner frames winning.
    pub fn snapshot(&self) -> ScopeView {
        let mut entries = HashMap::new();
        for frame in &self.frames {
            for (k, v) in frame {
                entries.insert(k.clone(), Arc::clone(v));
            }
        }
        ScopeView { entries }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<Vec<&String>> = self.frames.iter().map(|fr| fr.keys().collect()).collect();
        f.debug_struct("Scope").field("frames", &keys).finish()
    }
}

/// Read-only flattened view of a scope at one point in time.
#[derive(Clone, Default)]
pub struct ScopeView {
    entries: HashMap<String, ScopeValue>,
}

impl ScopeView {
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_frames_shadow_outer() {
        let mut scope = Scope::new();
        scope.set("x", scope_value(1_i32));
        scope.push_frame();
        assert_eq!(scope.get::<i32>("x"), Some(&1));
        scope.set("x", scope_value(2_i32));
        assert_eq!(scope.get::<i32>("x"), Some(&2));
        assert_eq!(scope.depth(), 2);
    }

    #[test]
    fn wrong_type_reads_as_absent() {
        let mut scope = Scope::new();
        scope.set("name", scope_value("alice".to_string()));
        assert!(scope.get::<i64>("name").is_none());
        assert!(scope.contains("name"));
    }

    #[test]
    fn snapshot_is_detached() {
        let mut scope = Scope::new();
        scope.set("a", scope_value(1_u8));
        let view = scope.snapshot();
        scope.set("b", scope_value(2_u8));
        assert!(view.contains("a"));
        assert!(!view.contains("b"));
    }
}
