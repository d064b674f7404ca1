//! Indexed object-store abstraction for swap persistence.
//!
//! The engine persists every initiated swap as a flat JSON record carrying a
//! stable `id`. Implementations are free (filesystem one-file-per-id, browser
//! local storage, SQL); the contract here is the declarative index set, the
//! disjunction-of-conjunctions query shape, and `save` being atomic with
//! respect to `query`.

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

/// Type alias for storage futures.
///
/// Storage backends expose plain boxed futures so implementations can live
/// anywhere, including across an FFI boundary.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A single-key index declaration.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub key: &'static str,
    pub unique: bool,
    pub nullable: bool,
}

/// A composite index over several keys.
#[derive(Debug, Clone)]
pub struct CompositeIndexDef {
    pub keys: &'static [&'static str],
    pub unique: bool,
}

/// One conjunct of a query: `key ∈ values` (a single value is the common
/// case).
#[derive(Debug, Clone)]
pub struct QueryParam {
    pub key: String,
    pub values: Vec<serde_json::Value>,
}

impl QueryParam {
    pub fn eq(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            values: vec![value.into()],
        }
    }

    pub fn one_of(
        key: impl Into<String>,
        values: impl IntoIterator<Item = serde_json::Value>,
    ) -> Self {
        Self {
            key: key.into(),
            values: values.into_iter().collect(),
        }
    }

    fn matches(&self, record: &serde_json::Value) -> bool {
        let field = record.get(&self.key).unwrap_or(&serde_json::Value::Null);
        self.values.iter().any(|v| v == field)
    }
}

/// Whether `record` satisfies a query in disjunctive normal form: the outer
/// sequence is a disjunction, each inner sequence a conjunction.
pub fn record_matches(record: &serde_json::Value, params: &[Vec<QueryParam>]) -> bool {
    params
        .iter()
        .any(|conj| conj.iter().all(|p| p.matches(record)))
}

/// The unified object store shared by every swap wrapper.
pub trait UnifiedStorage: Send + Sync {
    /// Declare the indexes the engine will query on. Called once before any
    /// other operation.
    fn init(
        &self,
        indexes: &[IndexDef],
        composite_indexes: &[CompositeIndexDef],
    ) -> StorageFuture<'_, ()>;

    /// Query records matching the disjunction-of-conjunctions `params`.
    fn query(&self, params: Vec<Vec<QueryParam>>) -> StorageFuture<'_, Vec<serde_json::Value>>;

    /// Save (upsert) a record; the record must carry a string `id`.
    fn save(&self, value: serde_json::Value) -> StorageFuture<'_, ()>;

    fn save_all(&self, values: Vec<serde_json::Value>) -> StorageFuture<'_, ()>;

    /// Remove a record by id. Does nothing when absent.
    fn remove(&self, id: &str) -> StorageFuture<'_, ()>;

    fn remove_all(&self, ids: Vec<String>) -> StorageFuture<'_, ()>;
}

/// Extract the stable `id` of a persisted record.
pub fn record_id(record: &serde_json::Value) -> Option<&str> {
    record.get("id").and_then(|v| v.as_str())
}
