use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// The ordered field names of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<String>,
}

impl Schema {
    /// Creates a schema from field names that are known to be unique.
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|x| x == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.fields.join(", "))
    }
}

/// A row of field values in schema order.
/// `None` is a null value, which is distinct from an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Option<String>>,
}

impl Record {
    pub(crate) fn new(schema: Arc<Schema>, values: Vec<Option<String>>) -> Self {
        debug_assert_eq!(schema.len(), values.len());
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns `None` if the field does not exist, and `Some(None)`
    /// if the field exists but the value is null.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.schema.index_of(name).map(|i| self.values[i].as_deref())
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.schema
            .fields()
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, &v)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultBatch {
    pub schema: Arc<Schema>,
    pub records: Vec<Record>,
    /// Whether this batch is the stable result set.
    /// A non-final batch is a preview that a later batch supersedes.
    pub is_final: bool,
}

impl ResultBatch {
    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}
