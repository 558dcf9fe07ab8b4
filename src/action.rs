//! Mutation intents applied as all-or-nothing transactions.
//!
//! An [`Action`] names one change and the expectation it depends on. A batch
//! of actions is applied in order against a single working copy of the
//! properties; the first action whose expectation fails aborts the batch and
//! the working copy is discarded.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, StoreError};
use crate::store::validate_key;

/// The in-memory form of the whole property set.
pub type Properties = BTreeMap<String, String>;

/// A single mutation intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create a key that must not already exist.
    Add { key: String, value: String },
    /// Set a key regardless of its current state.
    Update { key: String, value: String },
    /// Remove a key. With `expected` set, the current value must equal it.
    Delete {
        key: String,
        expected: Option<String>,
    },
    /// Remove every key starting with `prefix`.
    DeletePrefix { prefix: String },
    /// Replace a key's value if it currently equals `expected`.
    ///
    /// `expected: None` means the key must not exist.
    Swap {
        key: String,
        expected: Option<String>,
        value: String,
    },
}

impl Action {
    /// Create an Add action.
    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Add {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create an Update action.
    pub fn update(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Update {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create an unconditional Delete action.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete {
            key: key.into(),
            expected: None,
        }
    }

    /// Create a Delete action that only succeeds while the key holds `expected`.
    pub fn delete_if(key: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::Delete {
            key: key.into(),
            expected: Some(expected.into()),
        }
    }

    /// Create a DeletePrefix action.
    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        Self::DeletePrefix {
            prefix: prefix.into(),
        }
    }

    /// Create a Swap action.
    pub fn swap(
        key: impl Into<String>,
        expected: Option<impl Into<String>>,
        value: impl Into<String>,
    ) -> Self {
        Self::Swap {
            key: key.into(),
            expected: expected.map(Into::into),
            value: value.into(),
        }
    }

    /// The key or prefix this action targets.
    pub fn key(&self) -> &str {
        match self {
            Action::Add { key, .. }
            | Action::Update { key, .. }
            | Action::Delete { key, .. }
            | Action::Swap { key, .. } => key,
            Action::DeletePrefix { prefix } => prefix,
        }
    }

    /// Rewrite this action so its key (or prefix) lives under `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        let mut action = self.clone();
        match &mut action {
            Action::Add { key, .. }
            | Action::Update { key, .. }
            | Action::Delete { key, .. }
            | Action::Swap { key, .. } => key.insert_str(0, prefix),
            Action::DeletePrefix { prefix: p } => p.insert_str(0, prefix),
        }
        action
    }

    /// Check the key is well-formed. Prefixes may be empty.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Action::DeletePrefix { .. } => Ok(()),
            other => validate_key(other.key()),
        }
    }

    /// Apply this action to `props`, or fail without touching them.
    pub(crate) fn apply(&self, props: &mut Properties) -> Result<()> {
        match self {
            Action::Add { key, value } => {
                if props.contains_key(key) {
                    return Err(StoreError::Precondition(format!("{self}: key exists")));
                }
                props.insert(key.clone(), value.clone());
            }
            Action::Update { key, value } => {
                props.insert(key.clone(), value.clone());
            }
            Action::Delete { key, expected } => {
                if let Some(expected) = expected {
                    if props.get(key) != Some(expected) {
                        return Err(self.mismatch(props.get(key)));
                    }
                }
                props.remove(key);
            }
            Action::DeletePrefix { prefix } => {
                props.retain(|k, _| !k.starts_with(prefix.as_str()));
            }
            Action::Swap {
                key,
                expected,
                value,
            } => {
                if props.get(key) != expected.as_ref() {
                    return Err(self.mismatch(props.get(key)));
                }
                props.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn mismatch(&self, found: Option<&String>) -> StoreError {
        let found = match found {
            Some(v) => format!("{v:?}"),
            None => "nothing".to_string(),
        };
        StoreError::Precondition(format!("{self}: found {found}"))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add { key, .. } => write!(f, "add {key}"),
            Action::Update { key, .. } => write!(f, "update {key}"),
            Action::Delete {
                key,
                expected: Some(v),
            } => write!(f, "delete {key} expecting {v:?}"),
            Action::Delete { key, expected: None } => write!(f, "delete {key}"),
            Action::DeletePrefix { prefix } => write!(f, "delete prefix {prefix}"),
            Action::Swap {
                key,
                expected: Some(v),
                ..
            } => write!(f, "swap {key} expecting {v:?}"),
            Action::Swap {
                key, expected: None, ..
            } => write!(f, "swap {key} expecting absent"),
        }
    }
}

/// Apply `actions` in order to a copy of `props`.
///
/// Returns the resulting properties, or the first failure. `props` itself is
/// never modified.
pub(crate) fn apply_all(props: &Properties, actions: &[Action]) -> Result<Properties> {
    for action in actions {
        action.validate()?;
    }
    let mut working = props.clone();
    for action in actions {
        action.apply(&mut working)?;
    }
    Ok(working)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_add_rejects_existing_key() {
        let before = props(&[("a.b", "1")]);
        let err = apply_all(&before, &[Action::add("a.b", "2")]).unwrap_err();
        assert!(err.is_precondition());

        let after = apply_all(&before, &[Action::add("a.c", "2")]).unwrap();
        assert_eq!(after.get("a.c").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_delete_with_expectation() {
        let before = props(&[("a.b", "1")]);

        let err = apply_all(&before, &[Action::delete_if("a.b", "2")]).unwrap_err();
        assert!(err.is_precondition());
        let err = apply_all(&before, &[Action::delete_if("a.missing", "1")]).unwrap_err();
        assert!(err.is_precondition());

        let after = apply_all(&before, &[Action::delete_if("a.b", "1")]).unwrap();
        assert!(after.is_empty());

        // Unconditional delete of a missing key is fine.
        let after = apply_all(&before, &[Action::delete("a.missing")]).unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_swap_absent_expectation() {
        let before = props(&[("a.b", "1")]);

        let err = apply_all(&before, &[Action::swap("a.b", None::<String>, "2")]).unwrap_err();
        assert!(err.is_precondition());

        let after = apply_all(&before, &[Action::swap("a.c", None::<String>, "3")]).unwrap();
        assert_eq!(after.get("a.c").map(String::as_str), Some("3"));

        let after = apply_all(&before, &[Action::swap("a.b", Some("1"), "2")]).unwrap();
        assert_eq!(after.get("a.b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_delete_prefix_only_matches_start() {
        let before = props(&[("x.a", "1"), ("x.b", "2"), ("y.x.a", "3"), ("xx.a", "4")]);
        let after = apply_all(&before, &[Action::delete_prefix("x.")]).unwrap();
        assert_eq!(after, props(&[("y.x.a", "3"), ("xx.a", "4")]));
    }

    #[test]
    fn test_failed_batch_leaves_input_untouched() {
        let before = props(&[("a", "1"), ("b", "2")]);
        let result = apply_all(
            &before,
            &[
                Action::update("a", "changed"),
                Action::delete("b"),
                Action::swap("c", Some("nope"), "3"),
            ],
        );
        assert!(result.unwrap_err().is_precondition());
        assert_eq!(before, props(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn test_later_actions_see_earlier_ones() {
        let before = Properties::new();
        let after = apply_all(
            &before,
            &[Action::add("k", "1"), Action::swap("k", Some("1"), "2")],
        )
        .unwrap();
        assert_eq!(after.get("k").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_with_prefix() {
        let action = Action::swap("port.1", Some("free"), "run1").with_prefix("dss.resource.");
        assert_eq!(action.key(), "dss.resource.port.1");
        assert!(matches!(action, Action::Swap { expected: Some(ref e), .. } if e == "free"));

        let action = Action::delete_prefix("port.").with_prefix("dss.resource.");
        assert_eq!(action, Action::delete_prefix("dss.resource.port."));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let err = apply_all(&Properties::new(), &[Action::update("", "v")]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
