//! KQL query validation and deterministic auto-correction.
//!
//! Validation runs in three passes over the generated text:
//!
//! 1. **Correction** — text normalization (markdown fences, trailing
//!    semicolons, stray or missing pipes) followed by an ordered table of
//!    [`CorrectionRule`]s applied until nothing changes. Correction is
//!    idempotent: correcting already-corrected text is a no-op.
//! 2. **Schema check** — the source table (and any `join`/`lookup`/`union`
//!    operand) is resolved against a [`SchemaCatalog`], with case fixes and
//!    nearest-name substitution within [`MAX_TABLE_EDIT_DISTANCE`]; field
//!    references in later stages must be columns of the resolved tables.
//! 3. **Analysis** — structural errors, advisory warnings, and a
//!    [`ComplexityReport`].
//!
//! A [`ValidationReport`] is valid iff it carries no errors. Warnings never
//! affect validity.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::SchemaCatalog;

/// Unknown table names further than this from every known table are never
/// substituted.
pub const MAX_TABLE_EDIT_DISTANCE: usize = 2;

/// Upper bound on rule passes when looking for a fixed point.
const MAX_CORRECTION_PASSES: usize = 8;

pub const MISSING_TIME_FILTER: &str =
    "No time range filter; consider adding '| where TimeGenerated > ago(1d)' to limit the scan";

/// Operators that start a pipeline stage.
const PIPE_OPERATORS: &[&str] = &[
    "where",
    "filter",
    "project",
    "project-away",
    "project-keep",
    "project-rename",
    "project-reorder",
    "extend",
    "summarize",
    "order",
    "sort",
    "take",
    "limit",
    "top",
    "join",
    "distinct",
    "count",
    "render",
    "lookup",
    "mv-expand",
    "parse",
    "make-series",
    "sample",
];

/// First-stage operators that produce rows without reading a table.
const SOURCE_OPERATORS: &[&str] = &[
    "print",
    "datatable",
    "range",
    "search",
    "find",
    "externaldata",
    "materialize",
    "evaluate",
];

/// Stages whose identifiers are not checked against the source table.
const OPAQUE_STAGES: &[&str] = &[
    "join",
    "lookup",
    "union",
    "parse",
    "parse-where",
    "evaluate",
    "mv-apply",
    "render",
    "as",
    "invoke",
    "search",
];

/// Words that are never field references.
const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "has", "has_any", "has_all", "has_cs", "hasprefix", "hassuffix",
    "contains", "contains_cs", "startswith", "startswith_cs", "endswith", "endswith_cs",
    "matches", "regex", "between", "like", "by", "on", "with", "withsource", "kind", "as", "of",
    "to", "from", "step", "asc", "desc", "nulls", "first", "last", "true", "false", "null",
    "let", "where", "filter", "search", "project", "extend", "summarize", "order", "sort",
    "take", "limit", "top", "nested", "join", "union", "lookup", "distinct", "count", "render",
    "parse", "mv", "expand", "make", "series", "sample", "inner", "innerunique", "leftouter",
    "rightouter", "fullouter", "leftanti", "rightanti", "leftsemi", "rightsemi", "anti", "semi",
    "timechart", "barchart", "columnchart", "piechart", "areachart", "linechart", "scatterchart",
    "table", "isfuzzy", "hint", "bool", "boolean", "int", "long", "real", "double", "decimal",
    "string", "datetime", "timespan", "dynamic", "guid", "notcontains", "notin", "others",
];

/// Functions whose presence makes a `summarize` stage an aggregation.
static AGGREGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:count|countif|dcount|dcountif|sum|sumif|avg|avgif|min|max|arg_max|arg_min|make_set|make_list|make_bag|percentile|percentiles|stdev|variance|any|take_any)\s*\(",
    )
    .expect("valid aggregation regex")
});

static TIME_FILTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ago|startofday|startofweek|startofmonth|startofyear)\s*\(|\btimegenerated\b")
        .expect("valid time filter regex")
});

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid identifier regex"));

static LEADING_OP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*(?:-[A-Za-z]+)*)").expect("valid operator regex")
});

static LET_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*let\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid let regex")
});

static DEFINED_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*=(?:[^=~]|$)").expect("valid definition regex")
});

static JOIN_OPERAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:join|lookup)\b(?:\s+kind\s*=\s*[A-Za-z]+)?\s*\(?\s*([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid join regex")
});

static IMPLICIT_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:count|countif|dcount|dcountif|sum|sumif|avg|avgif|min|max|stdev|variance|percentile|percentiles|arg_max|arg_min|make_set|make_list|any|take_any)_",
    )
    .expect("valid implicit column regex")
});

// ============ Correction rules ============

/// How a rule rewrites a match.
#[derive(Clone, Copy)]
pub enum Replacement {
    /// Regex replacement template (`$1` expands to capture group 1).
    Template(&'static str),
    /// Computed replacement.
    Rewrite(fn(&Captures<'_>) -> String),
}

impl fmt::Debug for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replacement::Template(t) => f.debug_tuple("Template").field(t).finish(),
            Replacement::Rewrite(_) => f.write_str("Rewrite(..)"),
        }
    }
}

/// One deterministic text repair.
#[derive(Debug, Clone)]
pub struct CorrectionRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub replacement: Replacement,
    /// Lower runs first.
    pub priority: u32,
}

impl CorrectionRule {
    pub fn new(
        name: &'static str,
        pattern: &str,
        replacement: Replacement,
        priority: u32,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
            replacement,
            priority,
        })
    }

    /// Apply the rule, returning the new text only if it changed.
    pub fn apply(&self, text: &str) -> Option<String> {
        let out = match self.replacement {
            Replacement::Template(t) => self.pattern.replace_all(text, t),
            Replacement::Rewrite(f) => self.pattern.replace_all(text, |c: &Captures<'_>| f(c)),
        };
        (out != text).then(|| out.into_owned())
    }
}

fn lowercase_operator(caps: &Captures<'_>) -> String {
    format!("| {}", caps[1].to_lowercase())
}

/// Turn `field = "x"` into `field == "x"` inside a where stage. Only a lone
/// `=` directly compared against a string literal is touched.
fn string_equality(caps: &Captures<'_>) -> String {
    let stage = &caps[0];
    let chars: Vec<char> = stage.chars().collect();
    let mut out = String::with_capacity(stage.len() + 4);
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' && i + 1 < chars.len() {
                    out.push(c);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '=' => {
                let prev = i.checked_sub(1).map(|p| chars[p]);
                let next = chars.get(i + 1).copied();
                let lone = !matches!(prev, Some('=' | '!' | '<' | '>' | '~'))
                    && !matches!(next, Some('=' | '~'));
                let rhs_is_string = chars[i + 1..]
                    .iter()
                    .find(|ch| !ch.is_whitespace())
                    .is_some_and(|ch| *ch == '"' || *ch == '\'');
                if lone && rhs_is_string {
                    out.push_str("==");
                } else {
                    out.push(c);
                }
            }
            None => out.push(c),
        }
        i += 1;
    }
    out
}

const RULE_TABLE: &[(&str, &str, Replacement, u32)] = &[
    (
        "ago_days",
        r"(?i)\bago\(\s*(\d+)\s*(?:days?|d)\s*\)",
        Replacement::Template("ago(${1}d)"),
        10,
    ),
    (
        "ago_hours",
        r"(?i)\bago\(\s*(\d+)\s*(?:hours?|hrs?|h)\s*\)",
        Replacement::Template("ago(${1}h)"),
        11,
    ),
    (
        "ago_minutes",
        r"(?i)\bago\(\s*(\d+)\s*(?:minutes?|mins?|m)\s*\)",
        Replacement::Template("ago(${1}m)"),
        12,
    ),
    (
        "ago_missing_unit",
        r"(?i)\bago\(\s*(\d+)\s*\)",
        Replacement::Template("ago(${1}d)"),
        13,
    ),
    (
        "strlen",
        r"(?i)\blen(?:gth)?\s*\(",
        Replacement::Template("strlen("),
        20,
    ),
    (
        "isnotempty",
        r"(?i)\bnotnull\s*\(",
        Replacement::Template("isnotempty("),
        21,
    ),
    (
        "count_star",
        r"(?i)\bcount\s*\(\s*\*\s*\)",
        Replacement::Template("count()"),
        22,
    ),
    (
        "dcount",
        r"(?i)\bcount_distinct\s*\(",
        Replacement::Template("dcount("),
        23,
    ),
    (
        "summarize_spelling",
        r"(?i)\bsummarise\b",
        Replacement::Template("summarize"),
        30,
    ),
    (
        "order_by_spacing",
        r"(?i)\borderby\b",
        Replacement::Template("order by"),
        31,
    ),
    (
        "sort_by_spacing",
        r"(?i)\bsortby\b",
        Replacement::Template("sort by"),
        32,
    ),
    (
        "project_spelling",
        r"(?i)\bprojet\b",
        Replacement::Template("project"),
        33,
    ),
    (
        "select_to_project",
        r"(?i)\|\s*select\b",
        Replacement::Template("| project"),
        34,
    ),
    (
        "operator_case",
        r"\|\s*(?i:(where|project|extend|summarize|take|limit|order|sort|top|join|union|distinct|count|render|lookup|parse))\b",
        Replacement::Rewrite(lowercase_operator),
        35,
    ),
    (
        "string_equality",
        r"(?i)\|\s*where\b[^|]*",
        Replacement::Rewrite(string_equality),
        40,
    ),
];

static DEFAULT_RULES: LazyLock<Vec<CorrectionRule>> = LazyLock::new(|| {
    let mut rules: Vec<CorrectionRule> = RULE_TABLE
        .iter()
        .map(|(name, pattern, replacement, priority)| {
            CorrectionRule::new(*name, pattern, *replacement, *priority)
                .expect("built-in correction patterns are valid")
        })
        .collect();
    rules.sort_by_key(|r| r.priority);
    rules
});

/// The built-in correction rules, in priority order.
pub fn default_rules() -> Vec<CorrectionRule> {
    DEFAULT_RULES.clone()
}

// ============ Reports ============

/// Output of the correction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corrected {
    pub text: String,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceImpact {
    Low,
    Medium,
    High,
}

impl fmt::Display for PerformanceImpact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PerformanceImpact::Low => "Low",
            PerformanceImpact::Medium => "Medium",
            PerformanceImpact::High => "High",
        })
    }
}

/// Pipeline stage counts per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub filter: u32,
    pub projection: u32,
    pub aggregation: u32,
    pub join: u32,
    pub other: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexityReport {
    pub operations: StageCounts,
    pub complexity_score: f32,
    pub performance_impact: PerformanceImpact,
    pub line_count: usize,
    pub has_time_filter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub original: String,
    pub corrected: String,
    /// Notes for every repair applied, in the order applied.
    pub corrections: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub complexity: ComplexityReport,
}

/// Complexity weights and impact thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_weight")]
    pub filter: f32,
    #[serde(default = "default_weight")]
    pub projection: f32,
    #[serde(default = "default_weight")]
    pub aggregation: f32,
    #[serde(default = "default_weight")]
    pub join: f32,
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f32,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f32,
}

fn default_weight() -> f32 {
    1.0
}

fn default_medium_threshold() -> f32 {
    2.0
}

fn default_high_threshold() -> f32 {
    5.0
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            filter: default_weight(),
            projection: default_weight(),
            aggregation: default_weight(),
            join: default_weight(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
        }
    }
}

// ============ Lexing helpers ============

/// Text with string literals and comments blanked out, byte offsets
/// preserved. Quote characters are kept.
struct Masked {
    text: String,
    unterminated: bool,
}

fn push_blank(out: &mut String, c: char) {
    for _ in 0..c.len_utf8() {
        out.push(' ');
    }
}

fn mask(text: &str) -> Masked {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    push_blank(&mut out, c);
                    if let Some(n) = chars.next() {
                        push_blank(&mut out, n);
                    }
                } else if c == q {
                    quote = None;
                    out.push(c);
                } else {
                    push_blank(&mut out, c);
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                    out.push(c);
                } else if c == '/' && chars.peek() == Some(&'/') {
                    push_blank(&mut out, c);
                    while let Some(&n) = chars.peek() {
                        if n == '\n' {
                            break;
                        }
                        chars.next();
                        push_blank(&mut out, n);
                    }
                } else {
                    out.push(c);
                }
            }
        }
    }
    Masked {
        text: out,
        unterminated: quote.is_some(),
    }
}

/// Split masked text on `sep` outside any brackets.
fn split_top_level(masked: &str, sep: char) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    for (i, c) in masked.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ if c == sep && depth <= 0 => {
                ranges.push(start..i);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    ranges.push(start..masked.len());
    ranges
}

fn parens_balanced(masked: &str) -> bool {
    let mut depth: i64 = 0;
    for c in masked.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn leading_op(stage: &str) -> String {
    LEADING_OP_RE
        .captures(stage)
        .map(|c| c[1].to_lowercase())
        .unwrap_or_default()
}

/// Replace whole-word occurrences of `from` outside string literals and
/// comments.
fn replace_identifier(text: &str, from: &str, to: &str) -> String {
    let masked = mask(text);
    let Ok(re) = Regex::new(&format!(r"\b{}\b", regex::escape(from))) else {
        return text.to_string();
    };
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in re.find_iter(&masked.text) {
        let before = masked.text[..m.start()].chars().next_back();
        if matches!(before, Some('.' | '$')) {
            continue;
        }
        out.push_str(&text[last..m.start()]);
        out.push_str(to);
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Outcome of looking a table name up in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableResolution {
    Exact,
    Corrected(String),
    Unresolved,
}

/// Resolve a table name: exact, then case-insensitive, then the nearest
/// known name within [`MAX_TABLE_EDIT_DISTANCE`] (ties by name).
pub fn resolve_table(name: &str, catalog: &SchemaCatalog) -> TableResolution {
    if catalog.contains_table(name) {
        return TableResolution::Exact;
    }
    if let Some(t) = catalog.table_names().find(|t| t.eq_ignore_ascii_case(name)) {
        return TableResolution::Corrected(t.to_string());
    }
    let lower = name.to_lowercase();
    let mut best: Option<(usize, &str)> = None;
    for t in catalog.table_names() {
        let d = edit_distance(&lower, &t.to_lowercase());
        if d <= MAX_TABLE_EDIT_DISTANCE && best.map_or(true, |(bd, _)| d < bd) {
            best = Some((d, t));
        }
    }
    match best {
        Some((_, t)) => TableResolution::Corrected(t.to_string()),
        None => TableResolution::Unresolved,
    }
}

// ============ Query structure ============

/// Statement and stage layout of a query.
struct Layout {
    masked: Masked,
    let_names: BTreeSet<String>,
    /// Byte ranges of the last statement's pipeline stages.
    stages: Vec<Range<usize>>,
    /// The last statement is itself a `let`.
    dangling_let: bool,
}

impl Layout {
    fn parse(text: &str) -> Self {
        let masked = mask(text);
        let statements: Vec<Range<usize>> = split_top_level(&masked.text, ';')
            .into_iter()
            .filter(|r| !masked.text[r.clone()].trim().is_empty())
            .collect();
        let mut let_names = BTreeSet::new();
        for r in &statements {
            if let Some(c) = LET_NAME_RE.captures(&masked.text[r.clone()]) {
                let_names.insert(c[1].to_string());
            }
        }
        let (stages, dangling_let) = match statements.last() {
            Some(body) => {
                let body_text = &masked.text[body.clone()];
                let dangling = LET_NAME_RE.is_match(body_text);
                let stages = split_top_level(body_text, '|')
                    .into_iter()
                    .map(|r| (r.start + body.start)..(r.end + body.start))
                    .collect();
                (stages, dangling)
            }
            None => (Vec::new(), false),
        };
        Self {
            masked,
            let_names,
            stages,
            dangling_let,
        }
    }

    fn stage(&self, i: usize) -> &str {
        &self.masked.text[self.stages[i].clone()]
    }

    fn ops(&self) -> Vec<String> {
        (0..self.stages.len()).map(|i| leading_op(self.stage(i))).collect()
    }
}

/// What the first stage reads from.
enum Source {
    Tables(Vec<String>),
    Operator,
    Invalid(String),
}

fn classify_source(first: &str) -> Source {
    let trimmed = first.trim();
    let Some(m) = IDENT_RE.find(trimmed).filter(|m| m.start() == 0) else {
        return Source::Invalid(format!(
            "Query must start with a table name, 'union' or 'let', found '{}'",
            trimmed.chars().take(20).collect::<String>()
        ));
    };
    let word = m.as_str();
    let lower = word.to_lowercase();
    if lower == "union" {
        return Source::Tables(union_operands(&trimmed[m.end()..]));
    }
    if PIPE_OPERATORS.contains(&leading_op(trimmed).as_str()) {
        return Source::Invalid(format!(
            "Query must start with a table name, not the '{}' operator",
            lower
        ));
    }
    if SOURCE_OPERATORS.contains(&lower.as_str()) {
        return Source::Operator;
    }
    Source::Tables(vec![word.to_string()])
}

fn union_operands(rest: &str) -> Vec<String> {
    split_top_level(rest, ',')
        .into_iter()
        .filter_map(|r| {
            let operand = rest[r].trim();
            IDENT_RE
                .find(operand)
                .filter(|m| m.start() == 0 && m.end() == operand.len())
                .map(|m| m.as_str().to_string())
        })
        .filter(|w| !KEYWORDS.contains(&w.to_lowercase().as_str()))
        .collect()
}

/// Tables referenced by the query, source first.
fn referenced_tables(layout: &Layout) -> (Vec<String>, Option<String>) {
    let mut tables = Vec::new();
    let mut source_error = None;
    if layout.stages.is_empty() {
        return (tables, source_error);
    }
    match classify_source(layout.stage(0)) {
        Source::Tables(t) => tables.extend(t),
        Source::Operator => {}
        Source::Invalid(msg) => source_error = Some(msg),
    }
    for i in 1..layout.stages.len() {
        let stage = layout.stage(i);
        match leading_op(stage).as_str() {
            "join" | "lookup" => {
                if let Some(c) = JOIN_OPERAND_RE.captures(stage) {
                    tables.push(c[1].to_string());
                }
            }
            "union" => {
                let rest = stage.trim_start();
                tables.extend(union_operands(&rest["union".len().min(rest.len())..]));
            }
            _ => {}
        }
    }
    tables.retain(|t| !layout.let_names.contains(t));
    (tables, source_error)
}

// ============ Validator ============

/// Validates and repairs generated KQL.
#[derive(Debug, Clone)]
pub struct QueryValidator {
    rules: Vec<CorrectionRule>,
    config: ValidationConfig,
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

impl QueryValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            rules: default_rules(),
            config,
        }
    }

    /// Use a custom rule table. Rules are sorted by priority.
    pub fn with_rules(mut rules: Vec<CorrectionRule>, config: ValidationConfig) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self { rules, config }
    }

    pub fn rules(&self) -> &[CorrectionRule] {
        &self.rules
    }

    /// Schema-independent correction: normalization and the rule table,
    /// repeated together until neither changes the text.
    pub fn correct(&self, query: &str) -> Corrected {
        let mut text = query.to_string();
        let mut notes: Vec<String> = Vec::new();
        for _ in 0..MAX_CORRECTION_PASSES {
            let before = text.clone();
            let (normalized, normalize_notes) = normalize(&text);
            text = normalized;
            for note in normalize_notes {
                push_note(&mut notes, note);
            }
            for rule in &self.rules {
                if let Some(next) = rule.apply(&text) {
                    debug!(rule = rule.name, "correction applied");
                    text = next;
                    push_note(&mut notes, format!("Applied correction '{}'", rule.name));
                }
            }
            if text == before {
                break;
            }
        }
        Corrected { text, notes }
    }

    /// Full validation against a schema catalog.
    pub fn validate(&self, query: &str, catalog: &SchemaCatalog) -> ValidationReport {
        let Corrected {
            mut text,
            notes: mut corrections,
        } = self.correct(query);
        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        if text.trim().is_empty() {
            errors.push("Query is empty".to_string());
            return ValidationReport {
                is_valid: false,
                original: query.to_string(),
                complexity: self.complexity(&text),
                corrected: text,
                corrections,
                warnings,
                errors,
            };
        }

        let layout = Layout::parse(&text);
        if layout.masked.unterminated {
            errors.push("Unterminated string literal".to_string());
        }
        if !parens_balanced(&layout.masked.text) {
            errors.push("Unbalanced parentheses".to_string());
        }

        // Tables
        let mut resolved: Vec<String> = Vec::new();
        let mut unresolved = false;
        if layout.dangling_let {
            errors.push("Query has no tabular expression after its let statements".to_string());
        } else {
            let (tables, source_error) = referenced_tables(&layout);
            errors.extend(source_error);
            if !catalog.is_empty() {
                for table in tables {
                    match resolve_table(&table, catalog) {
                        TableResolution::Exact => resolved.push(table),
                        TableResolution::Corrected(known) => {
                            text = replace_identifier(&text, &table, &known);
                            corrections.push(format!(
                                "Corrected table name '{}' to '{}'",
                                table, known
                            ));
                            resolved.push(known);
                        }
                        TableResolution::Unresolved => {
                            unresolved = true;
                            let msg = if catalog.is_authoritative() {
                                format!("Unknown table '{}'", table)
                            } else {
                                format!("Table '{}' is not a known table", table)
                            };
                            if catalog.is_authoritative() {
                                errors.push(msg);
                            } else {
                                warnings.push(msg);
                            }
                        }
                    }
                }
            }
        }

        // Fields
        if catalog.is_authoritative() && !unresolved && !resolved.is_empty() && errors.is_empty() {
            let (fixes, field_errors) = check_fields(&text, &resolved, catalog);
            for (from, to) in fixes {
                text = replace_identifier(&text, &from, &to);
                corrections.push(format!("Corrected field name '{}' to '{}'", from, to));
            }
            errors.extend(field_errors);
        }

        let complexity = self.complexity(&text);
        warnings.extend(advisory_warnings(&text, &complexity));

        ValidationReport {
            is_valid: errors.is_empty(),
            original: query.to_string(),
            corrected: text,
            corrections,
            warnings,
            errors,
            complexity,
        }
    }

    /// Stage counts, weighted score and impact bucket.
    pub fn complexity(&self, query: &str) -> ComplexityReport {
        let layout = Layout::parse(query);
        let ops = layout.ops();
        let mut counts = StageCounts::default();
        for (i, op) in ops.iter().enumerate() {
            if i == 0 {
                if op == "union" {
                    counts.join += 1;
                }
                continue;
            }
            match op.as_str() {
                "where" | "filter" | "search" => counts.filter += 1,
                o if o.starts_with("project") || o == "extend" => counts.projection += 1,
                "summarize" | "count" | "distinct" | "top" | "top-nested" | "top-hitters"
                | "make-series" => counts.aggregation += 1,
                "join" | "union" | "lookup" => counts.join += 1,
                _ => counts.other += 1,
            }
        }
        let c = &self.config;
        let score = c.filter * counts.filter as f32
            + c.projection * counts.projection as f32
            + c.aggregation * counts.aggregation as f32
            + c.join * counts.join as f32;
        let impact = if score <= c.medium_threshold {
            PerformanceImpact::Low
        } else if score <= c.high_threshold {
            PerformanceImpact::Medium
        } else {
            PerformanceImpact::High
        };
        ComplexityReport {
            operations: counts,
            complexity_score: score,
            performance_impact: impact,
            line_count: query.lines().filter(|l| !l.trim().is_empty()).count(),
            has_time_filter: TIME_FILTER_RE.is_match(&layout.masked.text),
        }
    }
}

/// Field references of non-opaque stages that are not columns of the
/// resolved tables. Returns case fixes and errors.
fn check_fields(
    text: &str,
    tables: &[String],
    catalog: &SchemaCatalog,
) -> (Vec<(String, String)>, Vec<String>) {
    let mut columns: Vec<&str> = Vec::new();
    for t in tables {
        match catalog.columns(t) {
            Some(cols) if !cols.is_empty() => columns.extend(cols.iter().map(|c| c.name.as_str())),
            // Unknown shape: nothing to check against.
            _ => return (Vec::new(), Vec::new()),
        }
    }

    let layout = Layout::parse(text);
    let ops = layout.ops();
    let mut defined: BTreeSet<String> = layout.let_names.clone();
    for (i, op) in ops.iter().enumerate().skip(1) {
        if op == "where" || op == "filter" {
            continue;
        }
        for c in DEFINED_NAME_RE.captures_iter(layout.stage(i)) {
            defined.insert(c[1].to_string());
        }
    }

    let primary = &tables[0];
    let mut fixes: Vec<(String, String)> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    for (i, op) in ops.iter().enumerate().skip(1) {
        if OPAQUE_STAGES.contains(&op.as_str()) {
            continue;
        }
        let stage = layout.stage(i);
        for m in IDENT_RE.find_iter(stage) {
            let word = m.as_str();
            let mut before = stage[..m.start()].chars().rev();
            match before.next() {
                Some('.' | '$' | '@') => continue,
                Some(c) if c.is_alphanumeric() => continue,
                Some('-') if before.next().is_some_and(|c| c.is_alphabetic()) => continue,
                _ => {}
            }
            if stage[m.end()..].trim_start().starts_with('(') {
                continue;
            }
            let lower = word.to_lowercase();
            if KEYWORDS.contains(&lower.as_str())
                || defined.contains(word)
                || IMPLICIT_COLUMN_RE.is_match(word)
                || catalog.contains_table(word)
                || columns.contains(&word)
            {
                continue;
            }
            if let Some(col) = columns.iter().find(|c| c.eq_ignore_ascii_case(word)) {
                let fix = (word.to_string(), col.to_string());
                if !fixes.contains(&fix) {
                    fixes.push(fix);
                }
                continue;
            }
            let msg = format!("Unknown field '{}' on table '{}'", word, primary);
            if !errors.contains(&msg) {
                errors.push(msg);
            }
        }
    }
    (fixes, errors)
}

fn advisory_warnings(text: &str, complexity: &ComplexityReport) -> Vec<String> {
    let mut warnings = Vec::new();
    if !complexity.has_time_filter {
        warnings.push(MISSING_TIME_FILTER.to_string());
    }
    let layout = Layout::parse(text);
    let ops = layout.ops();
    let has = |name: &str| ops.iter().skip(1).any(|o| o == name);

    let summarize_without_agg = ops
        .iter()
        .enumerate()
        .skip(1)
        .any(|(i, o)| o == "summarize" && !AGGREGATION_RE.is_match(layout.stage(i)));
    if summarize_without_agg {
        warnings.push("Summarize stage has no aggregation function".to_string());
    }
    if has("order") && has("sort") {
        warnings.push("Use either 'order by' or 'sort by', not both".to_string());
    }
    if has("take") && has("limit") {
        warnings.push("Use either 'take' or 'limit', not both".to_string());
    }
    let first_summarize = ops.iter().skip(1).position(|o| o == "summarize");
    if let Some(pos) = first_summarize {
        if ops.iter().skip(pos + 2).any(|o| o == "project") {
            warnings.push(
                "Project after summarize only sees the summarized columns; consider extend"
                    .to_string(),
            );
        }
    }
    warnings
}

fn push_note(notes: &mut Vec<String>, note: String) {
    if !notes.contains(&note) {
        notes.push(note);
    }
}

/// Markdown and pipe cleanup. Idempotent.
fn normalize(query: &str) -> (String, Vec<String>) {
    let mut notes: Vec<String> = Vec::new();
    let mut text = query.trim().to_string();

    if text.contains("```") {
        text = text
            .lines()
            .filter(|l| !l.trim_start().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n");
        push_note(&mut notes, "Removed markdown code fences".to_string());
    }
    // Backticks and semicolons can wrap each other in either order.
    loop {
        let trimmed = text.trim();
        if trimmed.len() >= 2 && trimmed.starts_with('`') && trimmed.ends_with('`') {
            text = trimmed.trim_matches('`').to_string();
            push_note(&mut notes, "Removed inline code backticks".to_string());
            continue;
        }
        if trimmed.ends_with(';') {
            text = trimmed
                .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
                .to_string();
            push_note(&mut notes, "Removed trailing semicolon".to_string());
            continue;
        }
        break;
    }

    let mut lines: Vec<String> = text
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    while let Some(rest) = lines.first().and_then(|l| l.strip_prefix('|')) {
        let rest = rest.trim_start().to_string();
        push_note(&mut notes, "Removed leading pipe".to_string());
        if rest.is_empty() {
            lines.remove(0);
        } else {
            lines[0] = rest;
        }
    }

    for i in 1..lines.len() {
        let line = &lines[i];
        let prev = &lines[i - 1];
        if line.starts_with('|') || line.starts_with("//") || prev.ends_with('|') || prev.ends_with(';') {
            continue;
        }
        let op = leading_op(line);
        let whole_word = line
            .get(op.len()..)
            .map_or(true, |rest| rest.is_empty() || rest.starts_with(char::is_whitespace));
        if whole_word && PIPE_OPERATORS.contains(&op.as_str()) {
            push_note(&mut notes, format!("Added missing pipe before '{}'", op));
            lines[i] = format!("| {}", lines[i]);
        }
    }
    (lines.join("\n"), notes)
}
