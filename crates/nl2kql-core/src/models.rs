//! Core data models: collections, context items, schema catalog and feedback.
//!
//! Every retrievable unit of workspace knowledge is a [`ContextItem`]. Items
//! live in exactly one of four collections, identified by [`CollectionKind`];
//! the item's [`ItemMetadata`] variant always matches its collection.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Maximum sample values rendered into a value-set embedding text.
const SAMPLES_IN_TEXT: usize = 10;
/// Maximum sample values persisted per value set.
const SAMPLES_STORED: usize = 20;

/// The four knowledge collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionKind {
    #[serde(rename = "field_descriptions")]
    FieldDescriptions,
    #[serde(rename = "field_values")]
    FieldValues,
    #[serde(rename = "schemas")]
    Schemas,
    #[serde(rename = "ground_truth_pairs")]
    GroundTruth,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 4] = [
        CollectionKind::FieldDescriptions,
        CollectionKind::FieldValues,
        CollectionKind::Schemas,
        CollectionKind::GroundTruth,
    ];

    /// Persisted collection name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::FieldDescriptions => "field_descriptions",
            CollectionKind::FieldValues => "field_values",
            CollectionKind::Schemas => "schemas",
            CollectionKind::GroundTruth => "ground_truth_pairs",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        CollectionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::UnknownCollection(s.to_string()))
    }
}

/// A column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Kind-specific metadata carried by a [`ContextItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemMetadata {
    FieldDescription {
        table: String,
        field: String,
        data_type: String,
        description: String,
    },
    FieldValues {
        table: String,
        field: String,
        sample_values: Vec<String>,
    },
    TableSchema {
        table: String,
        description: String,
        columns: Vec<ColumnDef>,
    },
    ExamplePair {
        natural_language: String,
        query: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        usage_count: u32,
    },
}

/// One retrievable unit of schema or example knowledge.
///
/// `text` is the payload that gets embedded; `metadata` is what the ranker
/// and prompt assembly read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub text: String,
    pub metadata: ItemMetadata,
}

impl ContextItem {
    pub fn field_description(
        table: &str,
        field: &str,
        data_type: &str,
        description: &str,
    ) -> Self {
        Self {
            id: format!("field::{}::{}", table, field),
            text: format!(
                "Table: {}, Field: {}, Type: {}, Description: {}",
                table, field, data_type, description
            ),
            metadata: ItemMetadata::FieldDescription {
                table: table.to_string(),
                field: field.to_string(),
                data_type: data_type.to_string(),
                description: description.to_string(),
            },
        }
    }

    pub fn field_values(table: &str, field: &str, samples: &[String]) -> Self {
        let rendered = samples
            .iter()
            .take(SAMPLES_IN_TEXT)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            id: format!("values::{}::{}", table, field),
            text: format!(
                "Table: {}, Field: {}, Sample values: {}",
                table, field, rendered
            ),
            metadata: ItemMetadata::FieldValues {
                table: table.to_string(),
                field: field.to_string(),
                sample_values: samples.iter().take(SAMPLES_STORED).cloned().collect(),
            },
        }
    }

    pub fn table_schema(table: &str, description: &str, columns: Vec<ColumnDef>) -> Self {
        let rendered = columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            id: format!("schema::{}", table),
            text: format!(
                "Table: {}, Description: {}, Schema: {}",
                table, description, rendered
            ),
            metadata: ItemMetadata::TableSchema {
                table: table.to_string(),
                description: description.to_string(),
                columns,
            },
        }
    }

    /// An example pair is embedded by its natural-language question only.
    pub fn example_pair(natural_language: &str, query: &str, description: &str) -> Self {
        Self {
            id: example_id(natural_language, query),
            text: natural_language.to_string(),
            metadata: ItemMetadata::ExamplePair {
                natural_language: natural_language.to_string(),
                query: query.to_string(),
                description: description.to_string(),
                usage_count: 0,
            },
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self.metadata {
            ItemMetadata::FieldDescription { .. } => CollectionKind::FieldDescriptions,
            ItemMetadata::FieldValues { .. } => CollectionKind::FieldValues,
            ItemMetadata::TableSchema { .. } => CollectionKind::Schemas,
            ItemMetadata::ExamplePair { .. } => CollectionKind::GroundTruth,
        }
    }

    /// Table the item describes, if any.
    pub fn table(&self) -> Option<&str> {
        match &self.metadata {
            ItemMetadata::FieldDescription { table, .. }
            | ItemMetadata::FieldValues { table, .. }
            | ItemMetadata::TableSchema { table, .. } => Some(table),
            ItemMetadata::ExamplePair { .. } => None,
        }
    }

    pub fn usage_count(&self) -> u32 {
        match self.metadata {
            ItemMetadata::ExamplePair { usage_count, .. } => usage_count,
            _ => 0,
        }
    }
}

/// Deterministic identifier for an example pair.
pub fn example_id(natural_language: &str, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(natural_language.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(query.trim().as_bytes());
    format!("example::{}", &format!("{:x}", hasher.finalize())[..16])
}

/// A context item paired with its similarity to the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub item: ContextItem,
    pub similarity: f32,
    /// Insertion position within the collection; breaks similarity ties.
    pub position: usize,
}

/// Tables commonly present in Log Analytics workspaces.
const COMMON_TABLES: &[&str] = &[
    "Alert",
    "AppServiceHTTPLogs",
    "AuditLogs",
    "AzureActivity",
    "ConfigurationChange",
    "ConfigurationData",
    "ContainerLog",
    "Event",
    "Heartbeat",
    "InsightsMetrics",
    "KubeEvents",
    "Operation",
    "Perf",
    "SecurityAlert",
    "SecurityEvent",
    "SecurityIncident",
    "SigninLogs",
    "Syslog",
    "ThreatIntelligenceIndicator",
    "Usage",
    "VMConnection",
];

/// Known tables and their columns for one workspace.
///
/// A non-authoritative catalog (the builtin common-table list) only lets the
/// validator suggest table names; unknown tables are then warnings rather
/// than errors, and fields are not checked.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, Vec<ColumnDef>>,
    authoritative: bool,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            authoritative: true,
        }
    }

    pub fn builtin() -> Self {
        Self {
            tables: COMMON_TABLES
                .iter()
                .map(|t| (t.to_string(), Vec::new()))
                .collect(),
            authoritative: false,
        }
    }

    /// Build a catalog from table-schema items; other item kinds are ignored.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a ContextItem>) -> Self {
        let mut catalog = Self::new();
        for item in items {
            if let ItemMetadata::TableSchema { table, columns, .. } = &item.metadata {
                catalog.insert_table(table, columns.clone());
            }
        }
        catalog
    }

    pub fn with_table(mut self, name: &str, columns: Vec<ColumnDef>) -> Self {
        self.insert_table(name, columns);
        self
    }

    pub fn insert_table(&mut self, name: &str, columns: Vec<ColumnDef>) {
        self.tables.insert(name.to_string(), columns);
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Table names in lexicographic order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn columns(&self, table: &str) -> Option<&[ColumnDef]> {
        self.tables.get(table).map(Vec::as_slice)
    }
}

/// User verdict on a generated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    #[serde(alias = "good", alias = "correct", alias = "accurate", alias = "up")]
    Positive,
    #[serde(alias = "bad", alias = "wrong", alias = "inaccurate", alias = "down")]
    Negative,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Positive => "positive",
            Rating::Negative => "negative",
        }
    }
}

impl FromStr for Rating {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "positive" | "good" | "correct" | "accurate" | "up" => Ok(Rating::Positive),
            "negative" | "bad" | "wrong" | "inaccurate" | "down" => Ok(Rating::Negative),
            other => Err(format!("unknown rating '{}': use good or bad", other)),
        }
    }
}

/// A user's verdict on one generated query. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub natural_language: String,
    pub generated_query: String,
    #[serde(default)]
    pub corrected_query: Option<String>,
    pub rating: Rating,
}

impl FeedbackRecord {
    /// The example pair this feedback contributes to the ground-truth
    /// collection, if any.
    ///
    /// Positive feedback promotes the corrected query when given, else the
    /// generated one. Negative feedback only contributes a user correction.
    pub fn example_item(&self) -> Option<ContextItem> {
        let corrected = self
            .corrected_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());
        let (query, description) = match (self.rating, corrected) {
            (Rating::Positive, Some(q)) => (q, "User-corrected query"),
            (Rating::Positive, None) => (self.generated_query.trim(), "User-validated query"),
            (Rating::Negative, Some(q)) => (q, "User-corrected query"),
            (Rating::Negative, None) => return None,
        };
        if query.is_empty() || self.natural_language.trim().is_empty() {
            return None;
        }
        Some(ContextItem::example_pair(
            self.natural_language.trim(),
            query,
            description,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names_roundtrip() {
        for kind in CollectionKind::ALL {
            assert_eq!(kind.as_str().parse::<CollectionKind>().unwrap(), kind);
        }
        assert!("documents".parse::<CollectionKind>().is_err());
    }

    #[test]
    fn test_item_kind_matches_constructor() {
        let f = ContextItem::field_description("SecurityEvent", "EventID", "int", "Event id");
        assert_eq!(f.kind(), CollectionKind::FieldDescriptions);
        assert_eq!(f.id, "field::SecurityEvent::EventID");
        assert_eq!(f.table(), Some("SecurityEvent"));

        let e = ContextItem::example_pair("failed logins", "SecurityEvent | take 1", "");
        assert_eq!(e.kind(), CollectionKind::GroundTruth);
        assert_eq!(e.table(), None);
        assert_eq!(e.text, "failed logins");
    }

    #[test]
    fn test_example_id_is_stable_and_trimmed() {
        assert_eq!(example_id("a", "b"), example_id(" a ", "b\n"));
        assert_ne!(example_id("a", "b"), example_id("a", "c"));
    }

    #[test]
    fn test_field_values_caps_samples() {
        let samples: Vec<String> = (0..30).map(|i| i.to_string()).collect();
        let item = ContextItem::field_values("Perf", "CounterName", &samples);
        match item.metadata {
            ItemMetadata::FieldValues { sample_values, .. } => {
                assert_eq!(sample_values.len(), SAMPLES_STORED)
            }
            _ => panic!("wrong metadata"),
        }
        assert!(item.text.ends_with("9"));
    }

    #[test]
    fn test_metadata_serde_tag() {
        let item = ContextItem::table_schema(
            "Perf",
            "Performance counters",
            vec![ColumnDef::new("CounterValue", "real")],
        );
        let json = serde_json::to_value(&item.metadata).unwrap();
        assert_eq!(json["kind"], "table_schema");
        assert_eq!(json["columns"][0]["type"], "real");
    }

    #[test]
    fn test_catalog_from_items() {
        let items = vec![
            ContextItem::table_schema("Syslog", "", vec![ColumnDef::new("Facility", "string")]),
            ContextItem::field_description("Syslog", "Facility", "string", ""),
        ];
        let catalog = SchemaCatalog::from_items(&items);
        assert!(catalog.is_authoritative());
        assert!(catalog.contains_table("Syslog"));
        assert_eq!(catalog.columns("Syslog").unwrap().len(), 1);
        assert!(!SchemaCatalog::builtin().is_authoritative());
    }

    #[test]
    fn test_rating_aliases() {
        let r: Rating = serde_json::from_str("\"good\"").unwrap();
        assert_eq!(r, Rating::Positive);
        assert_eq!("Wrong".parse::<Rating>().unwrap(), Rating::Negative);
        assert!("meh".parse::<Rating>().is_err());
    }

    #[test]
    fn test_feedback_example_item() {
        let mut fb = FeedbackRecord {
            natural_language: "failed logins".into(),
            generated_query: "SecurityEvent | where EventID == 4625".into(),
            corrected_query: None,
            rating: Rating::Positive,
        };
        let item = fb.example_item().unwrap();
        assert_eq!(item.kind(), CollectionKind::GroundTruth);

        fb.rating = Rating::Negative;
        assert!(fb.example_item().is_none());

        fb.corrected_query = Some("SecurityEvent | where EventID == 4625 | take 10".into());
        let corrected = fb.example_item().unwrap();
        match corrected.metadata {
            ItemMetadata::ExamplePair { query, .. } => assert!(query.ends_with("take 10")),
            _ => panic!("wrong metadata"),
        }
    }
}
