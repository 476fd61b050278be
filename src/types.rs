//! Core types shared by the store capability and the subscription engine.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable cache key derived from query parameters.
///
/// Two queries with the same canonical form produce equal keys, and the
/// manager keeps at most one live listener per key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(key: impl Into<String>) -> Self {
        SubscriptionKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriptionKey {
    fn from(s: &str) -> Self {
        SubscriptionKey(s.to_string())
    }
}

/// Identifier of a node in the dependency graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

impl NodeId {
    /// Allocate a process-unique node id.
    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds on the engine clock.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Add a duration in milliseconds, saturating.
    pub fn after(self, millis: u64) -> Self {
        Timestamp(self.0.saturating_add(millis))
    }

    /// Milliseconds elapsed since `earlier` (zero if `earlier` is later).
    pub fn since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T+{}ms", self.0)
    }
}

// --- Queries ---

/// Comparison applied by a query filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Field equals the value.
    Eq,
    /// Field equals one of the values in an array.
    In,
    /// Field is an array containing the value.
    ArrayContains,
}

impl FilterOp {
    fn symbol(self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::In => " in ",
            FilterOp::ArrayContains => " contains ",
        }
    }
}

/// One `where` clause of a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Dotted field path.
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    fn matches(&self, doc: &Value) -> bool {
        let field = match lookup_path(doc, &self.field) {
            Some(v) => v,
            None => return false,
        };
        match self.op {
            FilterOp::Eq => field == &self.value,
            FilterOp::In => self
                .value
                .as_array()
                .map(|candidates| candidates.contains(field))
                .unwrap_or(false),
            FilterOp::ArrayContains => field
                .as_array()
                .map(|items| items.contains(&self.value))
                .unwrap_or(false),
        }
    }

    fn canonical(&self) -> String {
        format!("{}{}{}", self.field, self.op.symbol(), self.value)
    }
}

/// A live query against one collection of the document store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    /// Target a single document by id.
    pub document: Option<String>,
    /// Conjunctive filters (ignored for document targets).
    pub filters: Vec<Filter>,
}

impl Query {
    /// Query every document in a collection.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            document: None,
            filters: Vec::new(),
        }
    }

    /// Query a single document.
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document: Some(id.into()),
            filters: Vec::new(),
        }
    }

    pub fn where_eq(self, field: impl Into<String>, value: Value) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn where_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(field, FilterOp::In, Value::Array(values))
    }

    pub fn where_contains(self, field: impl Into<String>, value: Value) -> Self {
        self.filter(field, FilterOp::ArrayContains, value)
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    /// Check that the query is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(SyncError::InvalidQuery("empty collection name".to_string()));
        }
        if self.document.as_deref() == Some("") {
            return Err(SyncError::InvalidQuery(format!(
                "empty document id in `{}`",
                self.collection
            )));
        }
        if self.document.is_some() && !self.filters.is_empty() {
            return Err(SyncError::InvalidQuery(format!(
                "document query on `{}` cannot carry filters",
                self.collection
            )));
        }
        for filter in &self.filters {
            if filter.field.is_empty() {
                return Err(SyncError::InvalidQuery("empty filter field".to_string()));
            }
            if filter.op == FilterOp::In && !filter.value.is_array() {
                return Err(SyncError::InvalidQuery(format!(
                    "`in` filter on `{}` needs an array value",
                    filter.field
                )));
            }
        }
        Ok(())
    }

    /// Canonical cache key. Filter order does not affect the key.
    pub fn key(&self) -> SubscriptionKey {
        if let Some(ref id) = self.document {
            return SubscriptionKey(format!("{}/{}", self.collection, id));
        }
        let mut clauses: Vec<String> = self.filters.iter().map(Filter::canonical).collect();
        clauses.sort();
        if clauses.is_empty() {
            SubscriptionKey(self.collection.clone())
        } else {
            SubscriptionKey(format!("{}?{}", self.collection, clauses.join("&")))
        }
    }

    /// Whether a document in `collection` with `id` belongs to this query.
    pub fn matches(&self, collection: &str, id: &str, doc: &Value) -> bool {
        if collection != self.collection {
            return false;
        }
        match self.document {
            Some(ref target) => target == id,
            None => self.filters.iter().all(|f| f.matches(doc)),
        }
    }
}

/// Address of one document, used for writes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPath {
    pub collection: String,
    pub id: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

// --- Records ---

/// One document as delivered in a snapshot.
///
/// Records are never mutated after delivery; every snapshot carries a fresh
/// sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Document id.
    pub id: String,
    /// Document body.
    pub data: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Look up a dotted field path.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.data, path)
    }
}

/// Immutable sequence of records from one snapshot.
pub type Snapshot = Arc<[Record]>;

/// An empty snapshot.
pub fn empty_snapshot() -> Snapshot {
    Arc::from(Vec::new())
}

/// Resolve a dotted path (`a.b.c`) inside a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Merge `update` into `target`.
///
/// Objects merge recursively; `null` removes the field; anything else
/// replaces the existing value.
pub fn merge_value(target: &mut Value, update: Value) {
    match update {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(existing) = target {
                for (name, value) in fields {
                    if value.is_null() {
                        existing.remove(&name);
                    } else if value.is_object() {
                        merge_value(existing.entry(name).or_insert(Value::Null), value);
                    } else {
                        existing.insert(name, value);
                    }
                }
            }
        }
        other => *target = other,
    }
}
