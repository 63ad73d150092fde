//! Tri-state field used by partial updates.
//!
//! A missing field, an explicit `null` and a value are three different
//! requests: "leave unchanged", "clear" and "set". Plain `Option<T>` cannot
//! tell the first two apart, which silently drops edits that clear a value.
//!
//! Fields of this type must be declared with
//! `#[serde(default, skip_serializing_if = "Patch::is_absent")]`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Partial update of a nullable field
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Patch<T> {
    /// Field omitted: leave the stored value untouched
    #[default]
    Absent,
    /// Field explicitly set to null: clear the stored value
    Null,
    /// Field set to a new value
    Value(T),
}

impl<T> Patch<T> {
    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Apply this patch to a stored optional value.
    pub fn apply_to(self, target: &mut Option<T>) {
        match self {
            Self::Absent => {}
            Self::Null => *target = None,
            Self::Value(value) => *target = Some(value),
        }
    }

    /// Map the contained value, keeping absent/null as-is.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Patch<U> {
        match self {
            Self::Absent => Patch::Absent,
            Self::Null => Patch::Null,
            Self::Value(value) => Patch::Value(f(value)),
        }
    }

    /// Build a patch that sets or clears, from an optional new value.
    pub fn from_option(value: Option<T>) -> Self {
        value.map_or(Self::Null, Self::Value)
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Absent | Self::Null => serializer.serialize_none(),
            Self::Value(value) => serializer.serialize_some(value),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Only called when the field is present; absence comes from `#[serde(default)]`.
        Option::<T>::deserialize(deserializer).map(Self::from_option)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Edit {
        #[serde(default, skip_serializing_if = "Patch::is_absent")]
        notes: Patch<String>,
    }

    #[test]
    fn absent_field_is_omitted() {
        let json = serde_json::to_string(&Edit::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn null_field_is_written_explicitly() {
        let edit = Edit {
            notes: Patch::Null,
        };
        assert_eq!(serde_json::to_string(&edit).unwrap(), r#"{"notes":null}"#);
    }

    #[test]
    fn decoding_distinguishes_missing_from_null() {
        let missing: Edit = serde_json::from_str("{}").unwrap();
        let cleared: Edit = serde_json::from_str(r#"{"notes":null}"#).unwrap();
        let set: Edit = serde_json::from_str(r#"{"notes":"leg day"}"#).unwrap();

        assert_eq!(missing.notes, Patch::Absent);
        assert_eq!(cleared.notes, Patch::Null);
        assert_eq!(set.notes, Patch::Value("leg day".to_string()));
    }

    #[test]
    fn apply_to_respects_each_state() {
        let mut stored = Some("old".to_string());
        Patch::Absent.apply_to(&mut stored);
        assert_eq!(stored.as_deref(), Some("old"));
        Patch::Value("new".to_string()).apply_to(&mut stored);
        assert_eq!(stored.as_deref(), Some("new"));
        Patch::Null.apply_to(&mut stored);
        assert_eq!(stored, None);
    }
}
