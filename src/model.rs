//! # Data Model
//!
//! Core data structures for dependency tracking: scalar field values,
//! equality constraints, conjunctions and disjunctions, and the changed-field
//! snapshots that drive invalidation.

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;

/// A scalar field value that can participate in an equality constraint.
///
/// This is a closed set: values that cannot be represented here (expressions
/// referencing other fields, nested structures) are excluded from conjunctions
/// by the record source before they ever reach this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// RFC 3339 timestamp, compared textually.
    DateTime(String),
    Null,
}

impl ScalarValue {
    /// Canonical byte encoding of this value: a type tag followed by the
    /// value's bytes. Drives both constraint ordering and stable hashing, so
    /// it must not change between releases or registration keys stop
    /// matching.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        match self {
            ScalarValue::Str(s) => {
                buf.push(0);
                buf.extend_from_slice(s.as_bytes());
            }
            ScalarValue::Int(i) => {
                buf.push(1);
                buf.extend_from_slice(&i.to_be_bytes());
            }
            ScalarValue::Float(f) => {
                buf.push(2);
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            ScalarValue::Bool(b) => {
                buf.push(3);
                buf.push(*b as u8);
            }
            ScalarValue::DateTime(s) => {
                buf.push(4);
                buf.extend_from_slice(s.as_bytes());
            }
            ScalarValue::Null => buf.push(5),
        }
        buf
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Str(s) => write!(f, "{s}"),
            ScalarValue::Int(i) => write!(f, "{i}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Bool(b) => write!(f, "{b}"),
            ScalarValue::DateTime(s) => write!(f, "{s}"),
            ScalarValue::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Str(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Str(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int(value)
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Int(value as i64)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

/// A single equality constraint: `field == value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: String,
    pub value: ScalarValue,
}

impl FieldValue {
    pub fn new(field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// An unordered set of equality constraints over one table's fields.
///
/// Represents "this cached result depends on rows of `table` matching all of
/// these equalities". An empty constraint list is the coarsest conjunction:
/// it depends on the whole table and matches every mutation of it. Callers
/// with predicates that cannot be expressed as equalities (ranges, negations,
/// function calls) register that coarsest form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conjunction {
    table: String,
    constraints: Vec<FieldValue>,
}

impl Conjunction {
    /// Build a conjunction, canonicalizing the constraint list.
    ///
    /// Constraints are sorted by field name then value encoding, and exact
    /// duplicates removed, so two logically equal conjunctions always hash to
    /// the same registration key regardless of the order the introspector
    /// produced them in. Repeated fields with distinct values are kept; the
    /// value tiebreak keeps their order canonical too.
    pub fn new(table: impl Into<String>, mut constraints: Vec<FieldValue>) -> Self {
        constraints.sort_by(|a, b| {
            a.field
                .cmp(&b.field)
                .then_with(|| a.value.canonical_bytes().cmp(&b.value.canonical_bytes()))
        });
        constraints.dedup_by(|a, b| a.field == b.field && a.value == b.value);
        Self {
            table: table.into(),
            constraints,
        }
    }

    /// The coarsest conjunction: depends on the entire table.
    pub fn whole_table(table: impl Into<String>) -> Self {
        Self::new(table, Vec::new())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn constraints(&self) -> &[FieldValue] {
        &self.constraints
    }

    /// True if every constraint is satisfied by the changed-field snapshot.
    ///
    /// A constraint on field `f` with value `v` matches iff the snapshot has
    /// `f` present with exactly `v`. No constraints means always match.
    pub fn matches(&self, fields: &HashMap<String, ScalarValue>) -> bool {
        self.constraints
            .iter()
            .all(|fv| fields.get(&fv.field) == Some(&fv.value))
    }

    /// Stable 64-bit hash of `(table, canonical constraint list)`.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(self.table.as_bytes());
        for fv in &self.constraints {
            hasher.write_u8(0xfe);
            hasher.write(fv.field.as_bytes());
            hasher.write(&fv.value.canonical_bytes());
        }
        hasher.finish()
    }
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.table)?;
        for (i, fv) in self.constraints.iter().enumerate() {
            if i > 0 {
                write!(f, "&")?;
            }
            write!(f, "{}={}", fv.field, fv.value)?;
        }
        write!(f, "]")
    }
}

/// A query's full dependency set: the OR of one or more conjunctions.
///
/// A cached result registers itself under every conjunction here; a mutation
/// satisfying any one of them invalidates the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disjunction(pub Vec<Conjunction>);

impl Disjunction {
    pub fn single(conj: Conjunction) -> Self {
        Self(vec![conj])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The table whose shard owns the cached result's data key.
    ///
    /// A disjunction can span tables; the first conjunction's table decides
    /// co-location so that invalidation for that table stays single-shard.
    pub fn primary_table(&self) -> Option<&str> {
        self.0.first().map(|c| c.table())
    }
}

/// Field snapshot of a mutated record, as supplied by the record source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedFields {
    pub table: String,
    pub fields: HashMap<String, ScalarValue>,
}

impl ChangedFields {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }
}

/// Registration key for a conjunction: `<tag>conj:<table>:<hash>`.
pub fn registration_key(tag: &str, conj: &Conjunction) -> String {
    format!("{tag}conj:{}:{:016x}", conj.table(), conj.stable_hash())
}

/// Prefix shared by all registration keys of one table on one shard.
pub fn registration_prefix(tag: &str, table: &str) -> String {
    format!("{tag}conj:{table}:")
}

/// Signal-channel key for a data key's stampede lock.
pub fn signal_key(data_key: &str) -> String {
    format!("{data_key}:signal")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conjunction_canonicalization_is_order_insensitive() {
        let a = Conjunction::new(
            "users",
            vec![FieldValue::new("id", 42), FieldValue::new("org", "acme")],
        );
        let b = Conjunction::new(
            "users",
            vec![FieldValue::new("org", "acme"), FieldValue::new("id", 42)],
        );
        assert_eq!(a, b);
        assert_eq!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn repeated_field_ordering_is_canonical() {
        let a = Conjunction::new(
            "users",
            vec![FieldValue::new("id", 1), FieldValue::new("id", 2)],
        );
        let b = Conjunction::new(
            "users",
            vec![FieldValue::new("id", 2), FieldValue::new("id", 1)],
        );
        assert_eq!(a, b);
        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_eq!(a.constraints().len(), 2);
    }

    #[test]
    fn empty_conjunction_matches_everything() {
        let conj = Conjunction::whole_table("users");
        let mut fields = HashMap::new();
        assert!(conj.matches(&fields));
        fields.insert("id".to_string(), ScalarValue::Int(1));
        assert!(conj.matches(&fields));
    }

    #[test]
    fn constraint_must_match_exactly() {
        let conj = Conjunction::new("users", vec![FieldValue::new("id", 42)]);
        let hit = ChangedFields::new("users").with("id", 42).with("name", "x");
        let miss = ChangedFields::new("users").with("id", 7);
        let absent = ChangedFields::new("users").with("name", "x");
        assert!(conj.matches(&hit.fields));
        assert!(!conj.matches(&miss.fields));
        assert!(!conj.matches(&absent.fields));
    }

    #[test]
    fn different_tables_hash_differently() {
        let a = Conjunction::new("users", vec![FieldValue::new("id", 1)]);
        let b = Conjunction::new("orders", vec![FieldValue::new("id", 1)]);
        assert_ne!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn registration_key_format() {
        let conj = Conjunction::whole_table("users");
        let key = registration_key("{3}", &conj);
        assert!(key.starts_with("{3}conj:users:"));
        assert!(key.starts_with(&registration_prefix("{3}", "users")));
    }
}
