//! Property-based test generators using proptest.

use canopy_codec::Value;
use canopy_core::PersistentObject;
use canopy_storage::Oid;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for generating field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for generating child names.
pub fn child_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating object ids.
pub fn oid_strategy() -> impl Strategy<Value = Oid> {
    prop::string::string_regex("[0-9a-f]{32}")
        .expect("Invalid regex")
        .prop_map(Oid::new)
}

/// Strategy for generating scalar values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[ -~]{0,32}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::from),
    ]
}

/// Strategy for generating nested values up to three levels deep.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_value_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..4).prop_map(Value::Map),
        ]
    })
}

/// Strategy for generating field maps.
pub fn fields_strategy() -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map(field_name_strategy(), value_strategy(), 0..8)
}

/// Strategy for generating new objects of `type_tag`.
pub fn object_strategy(type_tag: &'static str) -> impl Strategy<Value = PersistentObject> {
    fields_strategy().prop_map(move |fields| {
        fields
            .into_iter()
            .fold(PersistentObject::new(type_tag), |object, (key, value)| {
                object.with_field(key, value)
            })
    })
}

/// Two edit sets over disjoint field names.
#[derive(Debug, Clone)]
pub struct DisjointEdits {
    /// Fields set by the first writer.
    pub ours: BTreeMap<String, Value>,
    /// Fields set by the second writer.
    pub theirs: BTreeMap<String, Value>,
}

/// Strategy for generating two non-empty edit sets that share no field.
pub fn disjoint_edits_strategy() -> impl Strategy<Value = DisjointEdits> {
    prop::collection::btree_map(field_name_strategy(), scalar_value_strategy(), 2..10).prop_map(
        |fields| {
            let split = fields.len() / 2;
            let mut ours = BTreeMap::new();
            let mut theirs = BTreeMap::new();
            for (i, (key, value)) in fields.into_iter().enumerate() {
                if i < split {
                    ours.insert(key, value);
                } else {
                    theirs.insert(key, value);
                }
            }
            DisjointEdits { ours, theirs }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn disjoint_edits_never_share_fields(edits in disjoint_edits_strategy()) {
            prop_assert!(!edits.ours.is_empty());
            prop_assert!(!edits.theirs.is_empty());
            for key in edits.ours.keys() {
                prop_assert!(!edits.theirs.contains_key(key));
            }
        }

        #[test]
        fn generated_objects_are_new(object in object_strategy("item")) {
            prop_assert!(object.is_new());
            prop_assert_eq!(object.type_tag(), "item");
        }
    }
}
