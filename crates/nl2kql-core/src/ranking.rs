//! Relevance ranking: turns raw retrieval results from the four collections
//! into a size-bounded [`PrioritizedContext`].
//!
//! # Scoring
//!
//! Every candidate gets a composite score:
//!
//! ```text
//! score = similarity_weight * similarity
//!       + lexical_weight    * lexical_boost(identifier, question)   (tables, fields, value sets)
//!       + usage_weight      * ln(1 + usage) / ln(1 + max_usage)     (example pairs)
//! ```
//!
//! # Selection
//!
//! 1. Tables are ranked by an aggregate (`max` or `sum`) over their schema
//!    hit and field scores; the top `max_tables` are kept.
//! 2. Fields of kept tables are chosen by individual score, capped per table
//!    and overall.
//! 3. Value sets attach to kept tables; example pairs are ranked
//!    independently.
//! 4. If fields + value sets + examples exceed `max_items`, the lowest
//!    scores are dropped first. Among equal scores the lexicographically
//!    smallest identifier survives.
//!
//! All ordering is explicit (score, then identifier or name), so the same
//! candidates always produce the same context.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{ColumnDef, ItemMetadata, RetrievalResult};

/// Upper bound on emitted query patterns.
const MAX_PATTERNS: usize = 10;
/// Identifier parts shorter than this never count as lexical matches.
const MIN_PART_LEN: usize = 3;

/// How per-field scores combine into a table score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableAggregation {
    #[default]
    Max,
    Sum,
}

/// Ranking weights and budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
    #[serde(default = "default_usage_weight")]
    pub usage_weight: f32,
    #[serde(default)]
    pub table_aggregation: TableAggregation,
    #[serde(default = "default_max_tables")]
    pub max_tables: usize,
    #[serde(default = "default_max_fields")]
    pub max_fields: usize,
    #[serde(default = "default_max_fields_per_table")]
    pub max_fields_per_table: usize,
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
    #[serde(default = "default_max_value_sets_per_table")]
    pub max_value_sets_per_table: usize,
    #[serde(default = "default_max_sample_values")]
    pub max_sample_values: usize,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

fn default_similarity_weight() -> f32 {
    1.0
}

fn default_lexical_weight() -> f32 {
    0.5
}

fn default_usage_weight() -> f32 {
    0.1
}

fn default_max_tables() -> usize {
    5
}

fn default_max_fields() -> usize {
    24
}

fn default_max_fields_per_table() -> usize {
    15
}

fn default_max_examples() -> usize {
    3
}

fn default_max_value_sets_per_table() -> usize {
    3
}

fn default_max_sample_values() -> usize {
    5
}

fn default_max_items() -> usize {
    40
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            lexical_weight: default_lexical_weight(),
            usage_weight: default_usage_weight(),
            table_aggregation: TableAggregation::default(),
            max_tables: default_max_tables(),
            max_fields: default_max_fields(),
            max_fields_per_table: default_max_fields_per_table(),
            max_examples: default_max_examples(),
            max_value_sets_per_table: default_max_value_sets_per_table(),
            max_sample_values: default_max_sample_values(),
            max_items: default_max_items(),
        }
    }
}

/// Raw retrieval results, one list per collection.
#[derive(Debug, Clone, Default)]
pub struct RetrievalSet {
    pub fields: Vec<RetrievalResult>,
    pub values: Vec<RetrievalResult>,
    pub schemas: Vec<RetrievalResult>,
    pub examples: Vec<RetrievalResult>,
}

impl RetrievalSet {
    pub fn len(&self) -> usize {
        self.fields.len() + self.values.len() + self.schemas.len() + self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedField {
    pub id: String,
    pub name: String,
    pub data_type: String,
    pub description: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedValues {
    pub id: String,
    pub field: String,
    pub samples: Vec<String>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTable {
    pub name: String,
    pub description: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub score: f32,
    pub fields: Vec<RankedField>,
    pub value_sets: Vec<RankedValues>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedExample {
    pub id: String,
    pub natural_language: String,
    pub query: String,
    pub description: String,
    pub usage_count: u32,
    pub similarity: f32,
    pub score: f32,
}

/// A query fragment seen in more than one selected example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryPattern {
    pub fragment: String,
    pub occurrences: usize,
}

/// Bounded, ordered context handed to generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrioritizedContext {
    pub tables: Vec<RankedTable>,
    pub examples: Vec<RankedExample>,
    pub patterns: Vec<QueryPattern>,
    pub summary: String,
}

impl PrioritizedContext {
    pub fn field_count(&self) -> usize {
        self.tables.iter().map(|t| t.fields.len()).sum()
    }

    pub fn value_set_count(&self) -> usize {
        self.tables.iter().map(|t| t.value_sets.len()).sum()
    }

    /// Items counted against the budget: fields, value sets and examples.
    pub fn item_count(&self) -> usize {
        self.field_count() + self.value_set_count() + self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.examples.is_empty()
    }

    /// Generation guidance derived from the selected context.
    pub fn instructions(&self) -> String {
        let mut out = String::from(
            "Generate a KQL query that answers the question, using the context provided.\n",
        );
        if !self.tables.is_empty() {
            let names: Vec<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
            let _ = writeln!(out, "Relevant tables, in priority order: {}", names.join(", "));
            let key_fields: Vec<String> = self
                .tables
                .iter()
                .flat_map(|t| t.fields.iter().take(5).map(move |f| format!("{}.{}", t.name, f.name)))
                .collect();
            if !key_fields.is_empty() {
                let _ = writeln!(out, "Key fields: {}", key_fields.join(", "));
            }
        }
        if !self.patterns.is_empty() {
            let fragments: Vec<&str> = self.patterns.iter().map(|p| p.fragment.as_str()).collect();
            let _ = writeln!(
                out,
                "Patterns used by similar queries: {}",
                fragments.join("; ")
            );
        }
        out.push_str("Guidelines:\n");
        out.push_str("- Use only tables and fields that appear in the context.\n");
        out.push_str("- Filter on TimeGenerated when the question implies a time range.\n");
        out.push_str("- Use field names exactly as written, including case.\n");
        out.push_str("- Return only the KQL query, without explanation or markdown.\n");
        out
    }

    /// Assembled context text: table details, sample values and examples.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.tables.is_empty() {
            out.push_str("## Tables\n");
        }
        for table in &self.tables {
            let _ = writeln!(out, "### {}", table.name);
            if let Some(desc) = table.description.as_deref().filter(|d| !d.is_empty()) {
                let _ = writeln!(out, "{}", desc);
            }
            if !table.columns.is_empty() {
                let cols: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| format!("{} ({})", c.name, c.data_type))
                    .collect();
                let _ = writeln!(out, "Columns: {}", cols.join(", "));
            }
            for f in &table.fields {
                if f.description.is_empty() {
                    let _ = writeln!(out, "- {} ({})", f.name, f.data_type);
                } else {
                    let _ = writeln!(out, "- {} ({}): {}", f.name, f.data_type, f.description);
                }
            }
            for v in &table.value_sets {
                let _ = writeln!(out, "- {} sample values: {}", v.field, v.samples.join(", "));
            }
        }
        if !self.examples.is_empty() {
            out.push_str("## Similar queries\n");
            for e in &self.examples {
                let _ = writeln!(out, "Question: {}", e.natural_language);
                let _ = writeln!(out, "KQL: {}", e.query);
            }
        }
        out
    }
}

/// Lexical overlap between an identifier and the question, in `[0, 1]`.
///
/// 1.0 when the lower-cased identifier occurs in the lower-cased question;
/// otherwise the fraction of the identifier's parts (camelCase or
/// underscore separated, at least three characters) that prefix-match a
/// question word in either direction.
pub fn lexical_boost(identifier: &str, question: &str) -> f32 {
    let ident = identifier.to_lowercase();
    let q = question.to_lowercase();
    if ident.is_empty() {
        return 0.0;
    }
    if q.contains(&ident) {
        return 1.0;
    }
    let words: Vec<&str> = q
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= MIN_PART_LEN)
        .collect();
    let tokens = crate::embedding::tokenize(identifier);
    // tokenize yields the whole word first, then its parts when it splits.
    let parts: Vec<&String> = (if tokens.len() > 1 { &tokens[1..] } else { &tokens[..] })
        .iter()
        .filter(|p| p.len() >= MIN_PART_LEN)
        .collect();
    if parts.is_empty() {
        return 0.0;
    }
    let matched = parts
        .iter()
        .filter(|p| words.iter().any(|w| w.starts_with(p.as_str()) || p.starts_with(*w)))
        .count();
    matched as f32 / parts.len() as f32
}

fn by_score_then_id(a: (f32, &str), b: (f32, &str)) -> std::cmp::Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

#[derive(Default)]
struct TableCandidate {
    description: Option<String>,
    columns: Vec<ColumnDef>,
    scores: Vec<f32>,
    fields: Vec<RankedField>,
    value_sets: Vec<RankedValues>,
}

/// Rank and trim retrieval results into a [`PrioritizedContext`].
pub fn prioritize(question: &str, set: &RetrievalSet, config: &RankingConfig) -> PrioritizedContext {
    let sw = config.similarity_weight;
    let lw = config.lexical_weight;
    let mut tables: BTreeMap<String, TableCandidate> = BTreeMap::new();

    for r in &set.schemas {
        if let ItemMetadata::TableSchema {
            table,
            description,
            columns,
        } = &r.item.metadata
        {
            let score = sw * r.similarity + lw * lexical_boost(table, question);
            let entry = tables.entry(table.clone()).or_default();
            entry.description = Some(description.clone());
            entry.columns = columns.clone();
            entry.scores.push(score);
        }
    }

    for r in &set.fields {
        if let ItemMetadata::FieldDescription {
            table,
            field,
            data_type,
            description,
        } = &r.item.metadata
        {
            let score = sw * r.similarity + lw * lexical_boost(field, question);
            let entry = tables.entry(table.clone()).or_default();
            entry.scores.push(score);
            entry.fields.push(RankedField {
                id: r.item.id.clone(),
                name: field.clone(),
                data_type: data_type.clone(),
                description: description.clone(),
                score,
            });
        }
    }

    // Value sets never create a table on their own.
    for r in &set.values {
        if let ItemMetadata::FieldValues {
            table,
            field,
            sample_values,
        } = &r.item.metadata
        {
            if let Some(entry) = tables.get_mut(table) {
                entry.value_sets.push(RankedValues {
                    id: r.item.id.clone(),
                    field: field.clone(),
                    samples: sample_values
                        .iter()
                        .take(config.max_sample_values)
                        .cloned()
                        .collect(),
                    score: sw * r.similarity + lw * lexical_boost(field, question),
                });
            }
        }
    }

    let mut ranked: Vec<RankedTable> = tables
        .into_iter()
        .map(|(name, mut c)| {
            let score = match config.table_aggregation {
                TableAggregation::Max => c.scores.iter().copied().fold(f32::MIN, f32::max),
                TableAggregation::Sum => c.scores.iter().sum(),
            };
            c.fields
                .sort_by(|a, b| by_score_then_id((a.score, a.id.as_str()), (b.score, b.id.as_str())));
            keep_best_per_id(&mut c.fields, |f| f.id.as_str());
            c.fields.truncate(config.max_fields_per_table);
            c.value_sets
                .sort_by(|a, b| by_score_then_id((a.score, a.id.as_str()), (b.score, b.id.as_str())));
            keep_best_per_id(&mut c.value_sets, |v| v.id.as_str());
            c.value_sets.truncate(config.max_value_sets_per_table);
            RankedTable {
                name,
                description: c.description,
                columns: c.columns,
                score,
                fields: c.fields,
                value_sets: c.value_sets,
            }
        })
        .collect();
    ranked.sort_by(|a, b| by_score_then_id((a.score, a.name.as_str()), (b.score, b.name.as_str())));
    ranked.truncate(config.max_tables);

    // Overall field cap across kept tables.
    let mut all_fields: Vec<(f32, String)> = ranked
        .iter()
        .flat_map(|t| t.fields.iter().map(|f| (f.score, f.id.clone())))
        .collect();
    all_fields.sort_by(|a, b| by_score_then_id((a.0, a.1.as_str()), (b.0, b.1.as_str())));
    let kept_fields: BTreeSet<String> = all_fields
        .into_iter()
        .take(config.max_fields)
        .map(|(_, id)| id)
        .collect();
    for t in &mut ranked {
        t.fields.retain(|f| kept_fields.contains(&f.id));
    }

    let mut examples = rank_examples(&set.examples, config);
    examples.truncate(config.max_examples);

    apply_item_budget(&mut ranked, &mut examples, config.max_items);

    let patterns = extract_patterns(examples.iter().map(|e| e.query.as_str()));
    let mut context = PrioritizedContext {
        tables: ranked,
        examples,
        patterns,
        summary: String::new(),
    };
    context.summary = summarize(&context);
    context
}

fn rank_examples(results: &[RetrievalResult], config: &RankingConfig) -> Vec<RankedExample> {
    let max_usage = results
        .iter()
        .map(|r| r.item.usage_count())
        .max()
        .unwrap_or(0);
    let usage_norm = |u: u32| -> f32 {
        if max_usage == 0 {
            0.0
        } else {
            (1.0 + u as f32).ln() / (1.0 + max_usage as f32).ln()
        }
    };

    let mut examples: Vec<RankedExample> = results
        .iter()
        .filter_map(|r| match &r.item.metadata {
            ItemMetadata::ExamplePair {
                natural_language,
                query,
                description,
                usage_count,
            } => Some(RankedExample {
                id: r.item.id.clone(),
                natural_language: natural_language.clone(),
                query: query.clone(),
                description: description.clone(),
                usage_count: *usage_count,
                similarity: r.similarity,
                score: config.similarity_weight * r.similarity
                    + config.usage_weight * usage_norm(*usage_count),
            }),
            _ => None,
        })
        .collect();
    examples.sort_by(|a, b| by_score_then_id((a.score, a.id.as_str()), (b.score, b.id.as_str())));
    keep_best_per_id(&mut examples, |e| e.id.as_str());
    examples
}

/// Keep the first entry per id. On input sorted best-first, that is the
/// highest-scored copy.
fn keep_best_per_id<T>(items: &mut Vec<T>, id: impl Fn(&T) -> &str) {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    items.retain(|item| seen.insert(id(item).to_string()));
}

/// Drop the lowest-scored fields, value sets and examples until at most
/// `max_items` remain.
fn apply_item_budget(tables: &mut [RankedTable], examples: &mut Vec<RankedExample>, max_items: usize) {
    let mut all: Vec<(f32, String)> = tables
        .iter()
        .flat_map(|t| {
            t.fields
                .iter()
                .map(|f| (f.score, f.id.clone()))
                .chain(t.value_sets.iter().map(|v| (v.score, v.id.clone())))
        })
        .chain(examples.iter().map(|e| (e.score, e.id.clone())))
        .collect();
    if all.len() <= max_items {
        return;
    }
    all.sort_by(|a, b| by_score_then_id((a.0, a.1.as_str()), (b.0, b.1.as_str())));
    let keep: BTreeSet<String> = all.into_iter().take(max_items).map(|(_, id)| id).collect();
    for t in tables.iter_mut() {
        t.fields.retain(|f| keep.contains(&f.id));
        t.value_sets.retain(|v| keep.contains(&v.id));
    }
    examples.retain(|e| keep.contains(&e.id));
}

static IDIOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:ago|bin)\([^()]*\)|\b(?:count|dcount|countif|avg|sum|min|max)\(\)")
        .expect("valid idiom regex")
});

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fragments of one query: normalized stages after the source, operator
/// idioms, and time/aggregation literals.
fn fragments(query: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for stage in query.split('|').skip(1) {
        let stage = collapse_ws(stage);
        if stage.is_empty() {
            continue;
        }
        out.insert(format!("| {}", stage));
        let lower = stage.to_lowercase();
        let op = lower.split_whitespace().next().unwrap_or_default();
        if op == "summarize" && lower.contains(" by ") {
            out.insert("| summarize ... by".to_string());
        } else if op == "order" || op == "sort" {
            out.insert(format!("| {} by", op));
        } else {
            out.insert(format!("| {}", op));
        }
    }
    for m in IDIOM_RE.find_iter(query) {
        out.insert(collapse_ws(m.as_str()));
    }
    out
}

/// Fragments that occur in more than one query, by occurrences desc then
/// text asc.
pub fn extract_patterns<'a>(queries: impl IntoIterator<Item = &'a str>) -> Vec<QueryPattern> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for q in queries {
        for f in fragments(q) {
            *counts.entry(f).or_default() += 1;
        }
    }
    let mut patterns: Vec<QueryPattern> = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(fragment, occurrences)| QueryPattern {
            fragment,
            occurrences,
        })
        .collect();
    patterns.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.fragment.cmp(&b.fragment))
    });
    patterns.truncate(MAX_PATTERNS);
    patterns
}

fn summarize(ctx: &PrioritizedContext) -> String {
    if ctx.is_empty() {
        return "No relevant context found".to_string();
    }
    let tables: Vec<String> = ctx
        .tables
        .iter()
        .map(|t| format!("{} ({} fields)", t.name, t.fields.len()))
        .collect();
    let mut summary = if tables.is_empty() {
        "No tables selected".to_string()
    } else {
        format!("Tables: {}", tables.join(", "))
    };
    let _ = write!(summary, "; {} similar queries", ctx.examples.len());
    if !ctx.patterns.is_empty() {
        let _ = write!(summary, "; {} common patterns", ctx.patterns.len());
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextItem;

    fn hit(item: ContextItem, similarity: f32, position: usize) -> RetrievalResult {
        RetrievalResult {
            item,
            similarity,
            position,
        }
    }

    fn field_hit(table: &str, field: &str, sim: f32) -> RetrievalResult {
        hit(
            ContextItem::field_description(table, field, "string", ""),
            sim,
            0,
        )
    }

    fn example_hit(nl: &str, query: &str, sim: f32, usage: u32) -> RetrievalResult {
        let mut item = ContextItem::example_pair(nl, query, "");
        if let ItemMetadata::ExamplePair { usage_count, .. } = &mut item.metadata {
            *usage_count = usage;
        }
        hit(item, sim, 0)
    }

    fn scenario_a() -> RetrievalSet {
        let columns = vec![
            ColumnDef::new("TimeGenerated", "datetime"),
            ColumnDef::new("EventID", "int"),
            ColumnDef::new("Account", "string"),
            ColumnDef::new("Computer", "string"),
        ];
        RetrievalSet {
            schemas: vec![
                hit(
                    ContextItem::table_schema("SecurityEvent", "Windows security events", columns),
                    0.62,
                    0,
                ),
                hit(ContextItem::table_schema("Perf", "Performance counters", vec![]), 0.20, 1),
            ],
            fields: vec![
                field_hit("SecurityEvent", "EventID", 0.55),
                field_hit("SecurityEvent", "Account", 0.41),
                field_hit("SecurityEvent", "TimeGenerated", 0.38),
                field_hit("SecurityEvent", "Computer", 0.30),
                field_hit("Perf", "CounterValue", 0.18),
            ],
            values: vec![hit(
                ContextItem::field_values("SecurityEvent", "EventID", &["4624".into(), "4625".into()]),
                0.35,
                0,
            )],
            examples: vec![example_hit(
                "Show failed login attempts",
                "SecurityEvent | where TimeGenerated > ago(7d) | where EventID == 4625",
                0.81,
                0,
            )],
        }
    }

    #[test]
    fn test_scenario_a_security_event_ranks_first() {
        let q = "Show me failed login attempts in the last week";
        let ctx = prioritize(q, &scenario_a(), &RankingConfig::default());
        assert_eq!(ctx.tables[0].name, "SecurityEvent");
        assert_eq!(ctx.tables[0].fields[0].name, "EventID");
        assert_eq!(ctx.examples.len(), 1);
        assert!(ctx.render().contains("EventID == 4625"));
        assert!(ctx.summary.contains("SecurityEvent (4 fields)"));
    }

    #[test]
    fn test_deterministic_across_runs() {
        let q = "Show me failed login attempts in the last week";
        let set = scenario_a();
        let cfg = RankingConfig::default();
        let first = prioritize(q, &set, &cfg);
        for _ in 0..5 {
            assert_eq!(prioritize(q, &set, &cfg), first);
        }
    }

    #[test]
    fn test_field_budget_respected() {
        let fields: Vec<RetrievalResult> = (0..100)
            .map(|i| field_hit(&format!("T{}", i % 7), &format!("F{i}"), (i % 13) as f32 / 13.0))
            .collect();
        let set = RetrievalSet {
            fields,
            ..Default::default()
        };
        let cfg = RankingConfig {
            max_fields: 10,
            max_fields_per_table: 4,
            max_tables: 7,
            ..Default::default()
        };
        let ctx = prioritize("anything", &set, &cfg);
        assert!(ctx.field_count() <= 10);
        assert!(ctx.tables.iter().all(|t| t.fields.len() <= 4));
        assert!(ctx.item_count() <= cfg.max_items);
    }

    #[test]
    fn test_item_budget_trims_ties_by_id() {
        let set = RetrievalSet {
            fields: vec![
                field_hit("T", "b", 0.5),
                field_hit("T", "a", 0.5),
                field_hit("T", "c", 0.5),
            ],
            ..Default::default()
        };
        let cfg = RankingConfig {
            max_items: 2,
            lexical_weight: 0.0,
            ..Default::default()
        };
        let ctx = prioritize("q", &set, &cfg);
        let ids: Vec<&str> = ctx.tables[0].fields.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["field::T::a", "field::T::b"]);
        assert_eq!(ctx.item_count(), 2);
    }

    #[test]
    fn test_duplicate_hits_keep_best_score() {
        let set = RetrievalSet {
            fields: vec![
                field_hit("T", "a", 0.9),
                field_hit("T", "b", 0.5),
                field_hit("T", "a", 0.2),
            ],
            examples: vec![
                example_hit("failed logins", "SecurityEvent | take 1", 0.3, 0),
                example_hit("cpu", "Perf | take 1", 0.6, 0),
                example_hit("failed logins", "SecurityEvent | take 1", 0.8, 0),
            ],
            ..Default::default()
        };
        let cfg = RankingConfig {
            lexical_weight: 0.0,
            usage_weight: 0.0,
            ..Default::default()
        };
        let ctx = prioritize("q", &set, &cfg);
        let fields: Vec<(&str, f32)> = ctx.tables[0]
            .fields
            .iter()
            .map(|f| (f.id.as_str(), f.score))
            .collect();
        assert_eq!(fields, vec![("field::T::a", 0.9), ("field::T::b", 0.5)]);
        assert_eq!(ctx.examples.len(), 2);
        assert_eq!(ctx.examples[0].natural_language, "failed logins");
        assert_eq!(ctx.examples[0].similarity, 0.8);
    }

    #[test]
    fn test_table_ties_broken_by_name() {
        let set = RetrievalSet {
            fields: vec![field_hit("Zeta", "x", 0.4), field_hit("Alpha", "x", 0.4)],
            ..Default::default()
        };
        let ctx = prioritize("q", &set, &RankingConfig::default());
        assert_eq!(ctx.tables[0].name, "Alpha");
    }

    #[test]
    fn test_sum_aggregation_prefers_many_hits() {
        let set = RetrievalSet {
            fields: vec![
                field_hit("Wide", "a", 0.3),
                field_hit("Wide", "b", 0.3),
                field_hit("Wide", "c", 0.3),
                field_hit("Narrow", "z", 0.5),
            ],
            ..Default::default()
        };
        let max = prioritize("q", &set, &RankingConfig::default());
        assert_eq!(max.tables[0].name, "Narrow");
        let sum = prioritize(
            "q",
            &set,
            &RankingConfig {
                table_aggregation: TableAggregation::Sum,
                ..Default::default()
            },
        );
        assert_eq!(sum.tables[0].name, "Wide");
    }

    #[test]
    fn test_lexical_boost() {
        assert_eq!(lexical_boost("Computer", "count events per computer"), 1.0);
        assert_eq!(lexical_boost("SecurityEvent", "security events today"), 1.0);
        assert_eq!(lexical_boost("CounterValue", "show cpu"), 0.0);
        let half = lexical_boost("ResultDescription", "failed result");
        assert!((half - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_usage_breaks_similarity_tie() {
        let set = RetrievalSet {
            examples: vec![
                example_hit("a", "T | take 1", 0.5, 0),
                example_hit("b", "T | take 2", 0.5, 9),
            ],
            ..Default::default()
        };
        let ctx = prioritize("q", &set, &RankingConfig::default());
        assert_eq!(ctx.examples[0].natural_language, "b");
    }

    #[test]
    fn test_patterns_need_two_examples() {
        let patterns = extract_patterns([
            "SecurityEvent | where TimeGenerated > ago(7d) | summarize count() by Account",
            "SigninLogs | where TimeGenerated > ago(7d) | where ResultType != 0",
            "Perf | take 10",
        ]);
        let fragments: Vec<&str> = patterns.iter().map(|p| p.fragment.as_str()).collect();
        assert_eq!(
            fragments,
            vec!["ago(7d)", "| where", "| where TimeGenerated > ago(7d)"]
        );
        assert!(patterns.iter().all(|p| p.occurrences == 2));
    }

    #[test]
    fn test_value_sets_need_a_kept_table() {
        let set = RetrievalSet {
            values: vec![hit(
                ContextItem::field_values("Orphan", "f", &["x".into()]),
                0.9,
                0,
            )],
            ..Default::default()
        };
        let ctx = prioritize("q", &set, &RankingConfig::default());
        assert!(ctx.tables.is_empty());
        assert_eq!(ctx.summary, "No relevant context found");
    }

    #[test]
    fn test_instructions_list_tables_and_guidelines() {
        let ctx = prioritize(
            "failed logins",
            &scenario_a(),
            &RankingConfig::default(),
        );
        let text = ctx.instructions();
        assert!(text.contains("Relevant tables, in priority order: SecurityEvent"));
        assert!(text.contains("SecurityEvent.EventID"));
        assert!(text.contains("Return only the KQL query"));
    }
}
