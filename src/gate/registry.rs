//! Allowed-types registry and the entity repository contract.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};

/// Field every resolved entity must carry.
pub const ENTITY_ID_FIELD: &str = "_id";

/// Lookup capability for one entity category.
///
/// `Ok(None)` means the id is unknown; `Err` is an infrastructure failure. The gate
/// rejects the request either way.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn find_by_id(&self, id: &Value) -> anyhow::Result<Option<Value>>;
}

/// A resolved identity record with a non-null `_id`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    /// Validate a repository record; `None` unless it is an object with a non-null `_id`.
    #[must_use]
    pub fn from_record(record: Value) -> Option<Self> {
        match record {
            Value::Object(map) if map.get(ENTITY_ID_FIELD).is_some_and(|id| !id.is_null()) => {
                Some(Self(map))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &Value {
        self.0.get(ENTITY_ID_FIELD).unwrap_or(&Value::Null)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// Mapping from `typeOf` discriminator to the repository that resolves it.
///
/// Only categories registered here can pass the gate.
#[derive(Clone, Default)]
pub struct AllowedTypes {
    repositories: HashMap<String, Arc<dyn EntityRepository>>,
}

impl fmt::Debug for AllowedTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut categories: Vec<&str> = self.categories().collect();
        categories.sort_unstable();
        f.debug_struct("AllowedTypes")
            .field("categories", &categories)
            .finish()
    }
}

impl AllowedTypes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `repository` as the resolver for `category`.
    #[must_use]
    pub fn allow(
        mut self,
        category: impl Into<String>,
        repository: Arc<dyn EntityRepository>,
    ) -> Self {
        self.repositories.insert(category.into(), repository);
        self
    }

    #[must_use]
    pub fn get(&self, category: &str) -> Option<&Arc<dyn EntityRepository>> {
        self.repositories.get(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.repositories.len()
    }
}

/// Read-only repository over a fixed set of records, keyed by `_id`.
#[derive(Debug, Default)]
pub struct StaticRepository {
    records: HashMap<String, Value>,
}

impl StaticRepository {
    /// Build from records; entries without a usable `_id` are skipped.
    #[must_use]
    pub fn new(records: impl IntoIterator<Item = Value>) -> Self {
        let records = records
            .into_iter()
            .filter_map(|record| {
                let key = record.get(ENTITY_ID_FIELD).and_then(id_key)?;
                Some((key, record))
            })
            .collect();
        Self { records }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl EntityRepository for StaticRepository {
    async fn find_by_id(&self, id: &Value) -> anyhow::Result<Option<Value>> {
        Ok(id_key(id).and_then(|key| self.records.get(&key).cloned()))
    }
}

// Ids may arrive as strings or numbers depending on who issued the token.
fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
