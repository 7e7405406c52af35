//! Schema ingestion.
//!
//! Turns a [`SchemaSnapshot`] (an export of table schemas and sample field
//! values from the telemetry backend) into the three schema-derived
//! collections: field descriptions, field values and table schemas.
//! Missing descriptions are filled in from field-name heuristics, or by the
//! generation backend when `ingest.generate_descriptions` is set.
//!
//! Embedding runs in batches on a bounded worker pool
//! (`ingest.concurrency` permits). A collection is always written in a
//! single embedding space: if the primary model fails part way through,
//! the whole collection is re-embedded with the fallback. By default each
//! collection is rebuilt atomically; with [`IngestOptions::replace`] unset,
//! items are upserted alongside what is already indexed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use nl2kql_core::models::{CollectionKind, ColumnDef, ContextItem};

use crate::embedding::EmbeddingProvider;
use crate::generation::GenerationRequest;
use crate::workflow::WorkflowContext;

/// Samples sent with a field description request.
const DESCRIPTION_SAMPLES: usize = 5;

/// Exported schema of one workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(default)]
    pub tables: Vec<TableSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSnapshot>,
    /// Sample values per field. Non-string values are rendered as JSON.
    #[serde(default)]
    pub samples: BTreeMap<String, Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub name: String,
    #[serde(rename = "type", default = "default_column_type")]
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_column_type() -> String {
    "string".to_string()
}

pub fn load_snapshot(path: &Path) -> Result<SchemaSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema snapshot: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse schema snapshot: {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Rebuild each collection from this snapshot alone.
    pub replace: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self { replace: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub tables: usize,
    pub field_descriptions: usize,
    pub field_values: usize,
    pub skipped_tables: usize,
    /// Field descriptions written by the generation backend.
    pub generated_descriptions: usize,
    /// Items embedded with the hash fallback instead of the configured model.
    pub degraded_embeddings: usize,
}

/// Description for a field without one, from its name.
pub fn describe_field(table: &str, field: &str, data_type: &str) -> String {
    let f = field.to_lowercase();
    if f.contains("time") || f.contains("date") {
        format!("Timestamp field indicating when the {} event occurred.", table)
    } else if f.contains("id") {
        format!("Unique identifier for the {} record.", table)
    } else if f.contains("name") {
        format!("Name or identifier field in the {} table.", table)
    } else if f.contains("status") || f.contains("state") {
        format!("Status or state information for the {} event.", table)
    } else if f.contains("message") || f.contains("description") {
        format!("Descriptive message or details for the {} event.", table)
    } else if f.contains("count") || f.contains("number") {
        format!("Numeric count or quantity field in the {} table.", table)
    } else if f.contains("source") {
        format!("Source information for the {} event.", table)
    } else if f.contains("type") {
        format!("Type or category classification for the {} event.", table)
    } else {
        format!("Field in the {} table of type {}.", table, data_type)
    }
}

pub fn describe_table(table: &str) -> String {
    format!("Log analytics table containing {} events and related data.", table)
}

fn render_sample(value: &serde_json::Value) -> Option<String> {
    let s = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!s.is_empty()).then_some(s)
}

/// Distinct, non-empty samples in first-seen order, capped at `limit`.
fn distinct_samples(values: &[serde_json::Value], limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if out.len() >= limit {
            break;
        }
        if let Some(s) = render_sample(value) {
            if !out.contains(&s) {
                out.push(s);
            }
        }
    }
    out
}

/// A field whose description came from the name heuristics.
#[derive(Debug, Clone, PartialEq)]
pub struct UndescribedField {
    /// Position in [`SnapshotItems::fields`].
    pub index: usize,
    pub table: String,
    pub field: String,
    pub data_type: String,
    pub samples: Vec<String>,
}

/// Context items derived from a snapshot, grouped by collection.
#[derive(Debug, Default)]
pub struct SnapshotItems {
    pub fields: Vec<ContextItem>,
    pub values: Vec<ContextItem>,
    pub schemas: Vec<ContextItem>,
    pub undescribed: Vec<UndescribedField>,
    pub skipped_tables: usize,
}

pub fn build_items(
    snapshot: &SchemaSnapshot,
    max_tables: usize,
    max_value_fields: usize,
    sample_limit: usize,
) -> SnapshotItems {
    let mut out = SnapshotItems::default();

    for table in &snapshot.tables {
        let name = table.name.trim();
        if name.is_empty() {
            out.skipped_tables += 1;
            continue;
        }
        if out.schemas.len() >= max_tables {
            out.skipped_tables += 1;
            continue;
        }

        let description = table
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| describe_table(name));

        let mut columns = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            let field = column.name.trim();
            if field.is_empty() {
                continue;
            }
            let given = column
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string);
            let field_description = match given {
                Some(d) => d,
                None => {
                    let samples = table
                        .samples
                        .iter()
                        .find(|(k, _)| k.trim() == field)
                        .map(|(_, v)| distinct_samples(v, DESCRIPTION_SAMPLES))
                        .unwrap_or_default();
                    out.undescribed.push(UndescribedField {
                        index: out.fields.len(),
                        table: name.to_string(),
                        field: field.to_string(),
                        data_type: column.data_type.clone(),
                        samples,
                    });
                    describe_field(name, field, &column.data_type)
                }
            };
            out.fields.push(ContextItem::field_description(
                name,
                field,
                &column.data_type,
                &field_description,
            ));
            columns.push(ColumnDef::new(field, column.data_type.clone()));
        }

        let mut value_sets = 0;
        for (field, values) in &table.samples {
            if value_sets >= max_value_fields {
                break;
            }
            let samples = distinct_samples(values, sample_limit);
            if samples.is_empty() {
                continue;
            }
            out.values
                .push(ContextItem::field_values(name, field.trim(), &samples));
            value_sets += 1;
        }

        out.schemas
            .push(ContextItem::table_schema(name, &description, columns));
    }

    out
}

/// Embed `items` in batches of `batch_size`, at most `concurrency` batches
/// in flight. Returns vectors in item order and the number produced by the
/// fallback after the configured model failed.
///
/// If the model fails after some batches succeeded, every item is
/// re-embedded with the fallback so the vectors share one space.
pub async fn embed_items(
    embedder: &Arc<EmbeddingProvider>,
    items: &[ContextItem],
    batch_size: usize,
    concurrency: usize,
) -> Result<(Vec<Vec<f32>>, usize)> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::new();

    for batch in items.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|i| i.text.clone()).collect();
        let embedder = Arc::clone(embedder);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            let outcome = embedder.embed_batch(&texts).await;
            let primary = !outcome.is_degraded();
            Ok::<_, tokio::sync::AcquireError>((outcome.into_value(), primary))
        }));
    }

    let mut vectors = Vec::with_capacity(items.len());
    let mut primary_batches = 0;
    let mut fallback_batches = 0;
    for joined in futures::future::try_join_all(handles)
        .await
        .context("embedding worker panicked")?
    {
        let (batch, primary) = joined.context("embedding worker pool closed")?;
        if primary {
            primary_batches += 1;
        } else {
            fallback_batches += 1;
        }
        vectors.extend(batch);
    }

    // A configured hash provider is not a degradation.
    if !embedder.is_degraded() {
        return Ok((vectors, 0));
    }
    if primary_batches > 0 && fallback_batches > 0 {
        warn!(
            items = items.len(),
            "embedding model failed mid-ingest; re-embedding all items with the fallback"
        );
        let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
        vectors = embedder.embed_batch(&texts).await.into_value();
    }
    let degraded = if primary_batches > 0 && fallback_batches == 0 {
        0
    } else {
        items.len()
    };
    Ok((vectors, degraded))
}

/// Replace heuristic field descriptions with ones from the generation
/// backend. Calls run on `ingest.concurrency` permits, each bounded by the
/// generation timeout; a failed call keeps the heuristic description.
/// Returns how many descriptions were replaced.
pub async fn generate_descriptions(ctx: &WorkflowContext, items: &mut SnapshotItems) -> Result<usize> {
    if items.undescribed.is_empty() {
        return Ok(0);
    }
    let semaphore = Arc::new(Semaphore::new(ctx.config.ingest.concurrency.max(1)));
    let timeout = ctx.config.generation.request_timeout();
    let mut handles = Vec::with_capacity(items.undescribed.len());

    for pending in &items.undescribed {
        let request = GenerationRequest::field_description(
            &pending.table,
            &pending.field,
            &pending.data_type,
            &pending.samples,
        );
        let generator = Arc::clone(&ctx.generator);
        let semaphore = Arc::clone(&semaphore);
        let field = pending.field.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            let described = match tokio::time::timeout(timeout, generator.generate(&request)).await {
                Ok(Ok(text)) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
                Ok(Err(e)) => {
                    debug!(%field, error = %e, "field description failed");
                    None
                }
                Err(_) => {
                    debug!(%field, "field description timed out");
                    None
                }
            };
            Ok::<_, tokio::sync::AcquireError>(described)
        }));
    }

    let mut generated = 0;
    let results = futures::future::try_join_all(handles)
        .await
        .context("description worker panicked")?;
    for (pending, joined) in items.undescribed.iter().zip(results) {
        let Some(description) = joined.context("description worker pool closed")? else {
            continue;
        };
        items.fields[pending.index] = ContextItem::field_description(
            &pending.table,
            &pending.field,
            &pending.data_type,
            &description,
        );
        generated += 1;
    }
    if generated < items.undescribed.len() {
        warn!(
            failed = items.undescribed.len() - generated,
            "some field descriptions fell back to name heuristics"
        );
    }
    Ok(generated)
}

async fn write_collection(
    ctx: &WorkflowContext,
    kind: CollectionKind,
    items: Vec<ContextItem>,
    options: IngestOptions,
) -> Result<usize> {
    let ingest = &ctx.config.ingest;
    let (vectors, degraded) = embed_items(
        &ctx.embedder,
        &items,
        ctx.config.embedding.batch_size,
        ingest.concurrency,
    )
    .await?;
    if degraded > 0 {
        warn!(
            collection = kind.as_str(),
            degraded, "some items were embedded with the hash fallback"
        );
    }

    if options.replace {
        let entries: Vec<_> = items.into_iter().zip(vectors).collect();
        ctx.store.rebuild(kind, entries).await?;
    } else {
        for (item, vector) in items.iter().zip(&vectors) {
            ctx.store.upsert(kind, item, vector).await?;
        }
    }
    Ok(degraded)
}

/// Index a schema snapshot.
pub async fn run_ingest(
    ctx: &WorkflowContext,
    snapshot: &SchemaSnapshot,
    options: IngestOptions,
) -> Result<IngestSummary> {
    let cfg = &ctx.config.ingest;
    let mut items = build_items(
        snapshot,
        cfg.max_tables,
        cfg.max_value_fields_per_table,
        cfg.sample_limit,
    );
    if items.skipped_tables > 0 {
        warn!(
            skipped = items.skipped_tables,
            max_tables = cfg.max_tables,
            "some tables were not ingested"
        );
    }

    let generated_descriptions = if cfg.generate_descriptions {
        generate_descriptions(ctx, &mut items).await?
    } else {
        0
    };

    let mut summary = IngestSummary {
        tables: items.schemas.len(),
        field_descriptions: items.fields.len(),
        field_values: items.values.len(),
        skipped_tables: items.skipped_tables,
        generated_descriptions,
        degraded_embeddings: 0,
    };
    info!(
        tables = summary.tables,
        fields = summary.field_descriptions,
        value_sets = summary.field_values,
        replace = options.replace,
        "ingesting schema snapshot"
    );

    for (kind, collection) in [
        (CollectionKind::FieldDescriptions, items.fields),
        (CollectionKind::FieldValues, items.values),
        (CollectionKind::Schemas, items.schemas),
    ] {
        summary.degraded_embeddings += write_collection(ctx, kind, collection, options)
            .await
            .with_context(|| format!("Failed to write collection {}", kind.as_str()))?;
    }

    Ok(summary)
}

/// Built-in example pairs: `(question, query, description)`.
pub const SEED_EXAMPLES: &[(&str, &str, &str)] = &[
    (
        "Show me all security events from the last 24 hours",
        "SecurityEvent\n| where TimeGenerated > ago(24h)\n| take 100",
        "Basic security event query with time filter",
    ),
    (
        "Count failed login attempts by user",
        "SecurityEvent\n| where TimeGenerated > ago(7d)\n| where EventID == 4625\n| summarize FailedLogins = count() by Account\n| order by FailedLogins desc",
        "Aggregation query for failed login analysis",
    ),
    (
        "Show Azure activity logs for resource creation",
        "AzureActivity\n| where TimeGenerated > ago(1d)\n| where OperationName contains \"Create\"\n| project TimeGenerated, Caller, OperationName, ResourceGroup, Resource",
        "Azure activity filtering and projection",
    ),
    (
        "Find processes with high CPU usage",
        "Perf\n| where TimeGenerated > ago(1h)\n| where ObjectName == \"Processor\" and CounterName == \"% Processor Time\"\n| where CounterValue > 80\n| project TimeGenerated, Computer, CounterValue",
        "Performance monitoring query",
    ),
    (
        "Show recent sign-in failures",
        "SigninLogs\n| where TimeGenerated > ago(24h)\n| where ResultType != \"0\"\n| project TimeGenerated, UserPrincipalName, AppDisplayName, ResultType, ResultDescription",
        "Sign-in log analysis for failures",
    ),
];

/// Add the built-in example pairs when the ground-truth collection is
/// empty. Returns how many were added.
pub async fn seed_examples(ctx: &WorkflowContext) -> Result<usize> {
    if !ctx.store.items(CollectionKind::GroundTruth).await?.is_empty() {
        return Ok(0);
    }
    let items: Vec<ContextItem> = SEED_EXAMPLES
        .iter()
        .map(|(q, kql, desc)| ContextItem::example_pair(q, kql, desc))
        .collect();
    let count = items.len();
    write_collection(
        ctx,
        CollectionKind::GroundTruth,
        items,
        IngestOptions { replace: true },
    )
    .await?;
    info!(count, "seeded ground-truth examples");
    Ok(count)
}
