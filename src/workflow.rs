//! Request orchestration: retrieve, refine, generate, validate, respond.
//!
//! Every request runs through a [`WorkflowState`] that only moves forward
//! (`Received → Retrieving → Refining → Generating → Validating → Complete`)
//! or jumps to `Fallback`. Each stage returns a [`StageOutcome`]; a
//! `Failed` outcome sends the request down the fallback path, which asks the
//! generator for a query from the question and static schema hints alone.
//! Callers always get a response unless the fallback generator fails too, in
//! which case [`WorkflowError::GenerationUnavailable`] is returned.
//!
//! Nothing here is global: the store, embedder, generator and configuration
//! travel together in a [`WorkflowContext`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use nl2kql_core::models::{CollectionKind, FeedbackRecord, ItemMetadata, SchemaCatalog};
use nl2kql_core::ranking::{prioritize, PrioritizedContext, RetrievalSet};
use nl2kql_core::store::{CollectionStats, Store};
use nl2kql_core::validate::{ComplexityReport, QueryValidator, ValidationReport};
use nl2kql_core::CoreError;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::generation::{create_generator, DisabledGenerator, GenerationRequest, QueryGenerator};
use crate::sqlite_store::SqliteStore;

/// Context summary reported when the fallback path produced the query.
pub const FALLBACK_SUMMARY: &str = "Fallback generation used";

// ============ State machine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Retrieving,
    Refining,
    Generating,
    Validating,
    Complete,
    Fallback,
}

impl Stage {
    fn successor(self) -> Option<Stage> {
        match self {
            Stage::Received => Some(Stage::Retrieving),
            Stage::Retrieving => Some(Stage::Refining),
            Stage::Refining => Some(Stage::Generating),
            Stage::Generating => Some(Stage::Validating),
            Stage::Validating => Some(Stage::Complete),
            Stage::Complete | Stage::Fallback => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Fallback)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Received => "received",
            Stage::Retrieving => "retrieving",
            Stage::Refining => "refining",
            Stage::Generating => "generating",
            Stage::Validating => "validating",
            Stage::Complete => "complete",
            Stage::Fallback => "fallback",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stage transition from {from} to {to}")]
pub struct TransitionError {
    pub from: Stage,
    pub to: Stage,
}

/// Time spent in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// Per-request progress. Never persisted.
#[derive(Debug)]
pub struct WorkflowState {
    stage: Stage,
    entered: Instant,
    timings: Vec<StageTiming>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            stage: Stage::Received,
            entered: Instant::now(),
            timings: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    /// Move to `next`: either the immediate successor, or `Fallback` from
    /// any non-terminal stage.
    pub fn advance(&mut self, next: Stage) -> Result<(), TransitionError> {
        let allowed = if next == Stage::Fallback {
            !self.stage.is_terminal()
        } else {
            self.stage.successor() == Some(next)
        };
        if !allowed {
            return Err(TransitionError {
                from: self.stage,
                to: next,
            });
        }
        self.close_stage();
        debug!(from = %self.stage, to = %next, "stage transition");
        self.stage = next;
        Ok(())
    }

    fn close_stage(&mut self) {
        if self.stage != Stage::Received && self.stage != Stage::Complete {
            self.timings.push(StageTiming {
                stage: self.stage,
                elapsed_ms: self.entered.elapsed().as_millis() as u64,
            });
        }
        self.entered = Instant::now();
    }

    /// Close the current stage and return all timings.
    pub fn finish(mut self) -> Vec<StageTiming> {
        self.close_stage();
        self.timings
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

/// A stage-local failure, carried to the fallback transition.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: CoreError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.error)
    }
}

/// Result of one stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok(T),
    /// Usable output produced in a reduced-quality mode.
    Degraded(T, String),
    Failed(StageFailure),
}

impl<T> StageOutcome<T> {
    fn failed(stage: Stage, error: CoreError) -> Self {
        StageOutcome::Failed(StageFailure { stage, error })
    }
}

// ============ Errors ============

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Even the fallback generation path failed.
    #[error("query generation unavailable: {message}")]
    GenerationUnavailable { message: String, retryable: bool },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] CoreError),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::GenerationUnavailable { .. } => "generation_unavailable",
            WorkflowError::InvalidRequest(_) => "bad_request",
            WorkflowError::Store(_) => "storage_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::GenerationUnavailable { retryable, .. } => *retryable,
            WorkflowError::InvalidRequest(_) => false,
            WorkflowError::Store(e) => e.is_retryable(),
        }
    }
}

impl From<TransitionError> for WorkflowError {
    fn from(e: TransitionError) -> Self {
        WorkflowError::GenerationUnavailable {
            message: e.to_string(),
            retryable: false,
        }
    }
}

// ============ Context ============

/// Append-only log of feedback records.
#[async_trait]
pub trait FeedbackLog: Send + Sync {
    async fn append(&self, record: &FeedbackRecord) -> nl2kql_core::Result<String>;
    async fn count(&self) -> nl2kql_core::Result<usize>;
}

#[async_trait]
impl FeedbackLog for SqliteStore {
    async fn append(&self, record: &FeedbackRecord) -> nl2kql_core::Result<String> {
        self.append_feedback(record).await
    }

    async fn count(&self) -> nl2kql_core::Result<usize> {
        self.feedback_count().await
    }
}

/// Everything a stage needs, passed explicitly.
#[derive(Clone)]
pub struct WorkflowContext {
    pub store: Arc<dyn Store>,
    pub embedder: Arc<EmbeddingProvider>,
    pub generator: Arc<dyn QueryGenerator>,
    pub validator: Arc<QueryValidator>,
    pub config: Arc<Config>,
    pub feedback_log: Option<Arc<dyn FeedbackLog>>,
    /// Serializes the read-increment-write of example usage counts.
    feedback_writes: Arc<tokio::sync::Mutex<()>>,
}

impl WorkflowContext {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<EmbeddingProvider>,
        generator: Arc<dyn QueryGenerator>,
        config: Arc<Config>,
    ) -> Self {
        let validator = Arc::new(QueryValidator::new(config.validation.clone()));
        Self {
            store,
            embedder,
            generator,
            validator,
            config,
            feedback_log: None,
            feedback_writes: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Open the SQLite store (migrating it), embedding provider and
    /// generator described by `config`. A generator that cannot be built is
    /// replaced by a disabled one, so offline commands keep working.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(&config).await?;
        crate::migrate::apply(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));

        let embedder = Arc::new(EmbeddingProvider::from_config(&config.embedding));
        let generator = match create_generator(&config.generation) {
            Ok(generator) => generator,
            Err(e) => {
                warn!(error = %e, "generation backend unavailable");
                Arc::new(DisabledGenerator::because(e.to_string())) as Arc<dyn QueryGenerator>
            }
        };

        let log: Arc<dyn FeedbackLog> = store.clone();
        Ok(Self::new(store, embedder, generator, Arc::new(config)).with_feedback_log(log))
    }

    pub fn with_feedback_log(mut self, log: Arc<dyn FeedbackLog>) -> Self {
        self.feedback_log = Some(log);
        self
    }

    fn generation_timeout(&self) -> Duration {
        self.config.generation.request_timeout()
    }
}

// ============ Request / response ============

fn default_use_rag() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub natural_language: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
}

impl QueryRequest {
    pub fn new(natural_language: impl Into<String>) -> Self {
        Self {
            natural_language: natural_language.into(),
            workspace_id: String::new(),
            use_rag: true,
        }
    }
}

/// Counts of the context that grounded the query. Never raw vectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextUsed {
    pub tables_considered: usize,
    pub fields_considered: usize,
    pub similar_queries_found: usize,
    pub summary: String,
}

impl ContextUsed {
    fn from_context(ctx: &PrioritizedContext) -> Self {
        Self {
            tables_considered: ctx.tables.len(),
            fields_considered: ctx.field_count(),
            similar_queries_found: ctx.examples.len(),
            summary: ctx.summary.clone(),
        }
    }

    fn fallback() -> Self {
        Self {
            tables_considered: 0,
            fields_considered: 0,
            similar_queries_found: 0,
            summary: FALLBACK_SUMMARY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub kql_query: String,
    /// The generator's text, when corrections changed it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_kql: Option<String>,
    pub is_valid: bool,
    /// Correction notes first, then advisory warnings.
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub complexity: ComplexityReport,
    pub context_used: ContextUsed,
    pub rag_workflow_used: bool,
    pub stage_timings: Vec<StageTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Stages that ran in a reduced-quality mode.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

impl QueryResponse {
    fn assemble(
        generated: String,
        report: ValidationReport,
        context_used: ContextUsed,
        rag_workflow_used: bool,
        stage_timings: Vec<StageTiming>,
    ) -> Self {
        let original_kql = (report.corrected != generated).then_some(generated);
        let mut warnings = report.corrections;
        warnings.extend(report.warnings);
        Self {
            kql_query: report.corrected,
            original_kql,
            is_valid: report.is_valid,
            warnings,
            errors: report.errors,
            complexity: report.complexity,
            context_used,
            rag_workflow_used,
            stage_timings,
            fallback_reason: None,
            degraded: Vec::new(),
        }
    }
}

// ============ Stages ============

/// Embed the question once and query the four collections independently.
pub async fn retrieve(ctx: &WorkflowContext, question: &str) -> StageOutcome<RetrievalSet> {
    let embedded = ctx.embedder.embed(question).await;
    let fell_back = embedded.is_degraded() && ctx.embedder.is_degraded();
    let vector = embedded.into_value();
    let r = &ctx.config.retrieval;
    let store = ctx.store.as_ref();

    let queried = futures::try_join!(
        store.query(CollectionKind::FieldDescriptions, &vector, r.fields_k),
        store.query(CollectionKind::FieldValues, &vector, r.values_k),
        store.query(CollectionKind::Schemas, &vector, r.schemas_k),
        store.query(CollectionKind::GroundTruth, &vector, r.examples_k),
    );
    let (fields, values, schemas, examples) = match queried {
        Ok(sets) => sets,
        Err(e) => return StageOutcome::failed(Stage::Retrieving, e),
    };
    let set = RetrievalSet {
        fields,
        values,
        schemas,
        examples,
    };
    debug!(
        fields = set.fields.len(),
        values = set.values.len(),
        schemas = set.schemas.len(),
        examples = set.examples.len(),
        "retrieved candidates"
    );

    if set.is_empty() {
        StageOutcome::Degraded(set, CoreError::RetrievalEmpty.to_string())
    } else if fell_back {
        StageOutcome::Degraded(set, "embedding fallback active".to_string())
    } else {
        StageOutcome::Ok(set)
    }
}

/// Rank and trim the candidates into a prioritized context.
pub fn refine(ctx: &WorkflowContext, question: &str, set: &RetrievalSet) -> StageOutcome<PrioritizedContext> {
    let prioritized = prioritize(question, set, &ctx.config.ranking);
    if prioritized.is_empty() {
        StageOutcome::Degraded(prioritized, "no relevant context selected".to_string())
    } else {
        StageOutcome::Ok(prioritized)
    }
}

async fn call_generator(ctx: &WorkflowContext, request: &GenerationRequest) -> Result<String, CoreError> {
    let timeout = ctx.generation_timeout();
    let text = tokio::time::timeout(timeout, ctx.generator.generate(request))
        .await
        .map_err(|_| CoreError::GenerationTimeout(timeout.as_secs()))??;
    if text.trim().is_empty() {
        return Err(CoreError::GenerationError("generator returned an empty query".to_string()));
    }
    Ok(text)
}

pub async fn generate(ctx: &WorkflowContext, request: &GenerationRequest) -> StageOutcome<String> {
    match call_generator(ctx, request).await {
        Ok(text) => StageOutcome::Ok(text),
        Err(e) => StageOutcome::failed(Stage::Generating, e),
    }
}

/// Known schema for validation: the schema collection, or the builtin
/// non-authoritative catalog when that collection is empty.
pub async fn load_catalog(ctx: &WorkflowContext) -> Result<SchemaCatalog, CoreError> {
    let items = ctx.store.items(CollectionKind::Schemas).await?;
    if items.is_empty() {
        return Ok(SchemaCatalog::builtin());
    }
    Ok(SchemaCatalog::from_items(&items))
}

pub async fn validate(ctx: &WorkflowContext, query: &str) -> StageOutcome<ValidationReport> {
    match load_catalog(ctx).await {
        Ok(catalog) => StageOutcome::Ok(ctx.validator.validate(query, &catalog)),
        Err(e) => StageOutcome::failed(Stage::Validating, e),
    }
}

/// Validate a query against the known schema outside the request flow.
pub async fn check_query(ctx: &WorkflowContext, query: &str) -> Result<ValidationReport, WorkflowError> {
    let catalog = load_catalog(ctx).await?;
    Ok(ctx.validator.validate(query, &catalog))
}

// ============ Orchestration ============

/// Answer one question.
pub async fn answer(ctx: &WorkflowContext, request: &QueryRequest) -> Result<QueryResponse, WorkflowError> {
    let question = request.natural_language.trim();
    if question.is_empty() {
        return Err(WorkflowError::InvalidRequest(
            "natural_language must not be empty".to_string(),
        ));
    }
    info!(use_rag = request.use_rag, workspace = %request.workspace_id, "answering question");

    let mut state = WorkflowState::new();
    let mut degraded = Vec::new();

    if !request.use_rag {
        state.advance(Stage::Fallback)?;
        return fallback(ctx, question, state, "retrieval disabled by request".to_string(), degraded)
            .await;
    }

    state.advance(Stage::Retrieving)?;
    let set = match retrieve(ctx, question).await {
        StageOutcome::Ok(set) => set,
        StageOutcome::Degraded(set, reason) => {
            warn!(stage = %Stage::Retrieving, %reason, "stage degraded");
            degraded.push(format!("{}: {}", Stage::Retrieving, reason));
            set
        }
        StageOutcome::Failed(f) => return divert(ctx, question, state, f, degraded).await,
    };

    state.advance(Stage::Refining)?;
    let prioritized = match refine(ctx, question, &set) {
        StageOutcome::Ok(p) => p,
        StageOutcome::Degraded(p, reason) => {
            warn!(stage = %Stage::Refining, %reason, "stage degraded");
            degraded.push(format!("{}: {}", Stage::Refining, reason));
            p
        }
        StageOutcome::Failed(f) => return divert(ctx, question, state, f, degraded).await,
    };
    info!(
        tables = prioritized.tables.len(),
        fields = prioritized.field_count(),
        examples = prioritized.examples.len(),
        "context prioritized"
    );

    state.advance(Stage::Generating)?;
    let request_text = GenerationRequest::grounded(question, &prioritized);
    let generated = match generate(ctx, &request_text).await {
        StageOutcome::Ok(text) | StageOutcome::Degraded(text, _) => text,
        StageOutcome::Failed(f) => return divert(ctx, question, state, f, degraded).await,
    };

    state.advance(Stage::Validating)?;
    let report = match validate(ctx, &generated).await {
        StageOutcome::Ok(report) | StageOutcome::Degraded(report, _) => report,
        StageOutcome::Failed(f) => return divert(ctx, question, state, f, degraded).await,
    };

    state.advance(Stage::Complete)?;
    let timings = state.finish();
    let elapsed_ms: u64 = timings.iter().map(|t| t.elapsed_ms).sum();
    info!(is_valid = report.is_valid, elapsed_ms, "query generated");

    let mut response = QueryResponse::assemble(
        generated,
        report,
        ContextUsed::from_context(&prioritized),
        true,
        timings,
    );
    response.degraded = degraded;
    Ok(response)
}

async fn divert(
    ctx: &WorkflowContext,
    question: &str,
    mut state: WorkflowState,
    failure: StageFailure,
    degraded: Vec<String>,
) -> Result<QueryResponse, WorkflowError> {
    warn!(stage = %failure.stage, error = %failure.error, "stage failed; switching to fallback");
    state.advance(Stage::Fallback)?;
    fallback(ctx, question, state, failure.to_string(), degraded).await
}

/// Static hints used when no retrieved context is available.
pub fn generic_schema_hints() -> String {
    let catalog = SchemaCatalog::builtin();
    let tables: Vec<&str> = catalog.table_names().collect();
    format!(
        "Common Log Analytics tables include: {}. Every table has a TimeGenerated column; filter on it for time ranges.",
        tables.join(", ")
    )
}

async fn fallback(
    ctx: &WorkflowContext,
    question: &str,
    state: WorkflowState,
    reason: String,
    degraded: Vec<String>,
) -> Result<QueryResponse, WorkflowError> {
    info!(%reason, "using fallback generation");
    let request = GenerationRequest::fallback(question, &generic_schema_hints());
    let generated = call_generator(ctx, &request).await.map_err(|e| {
        warn!(error = %e, "fallback generation failed");
        WorkflowError::GenerationUnavailable {
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    })?;

    let catalog = match load_catalog(ctx).await {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!(error = %e, "schema catalog unavailable; validating against builtin tables");
            SchemaCatalog::builtin()
        }
    };
    let report = ctx.validator.validate(&generated, &catalog);

    let mut response = QueryResponse::assemble(
        generated,
        report,
        ContextUsed::fallback(),
        false,
        state.finish(),
    );
    response.fallback_reason = Some(reason);
    response.degraded = degraded;
    Ok(response)
}

// ============ Feedback ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackAck {
    /// Identifier in the feedback log, when one is attached.
    pub feedback_id: Option<String>,
    /// Ground-truth example written or bumped by this feedback.
    pub example_id: Option<String>,
    pub usage_count: u32,
}

/// Record feedback; positive ratings and corrections become example pairs.
pub async fn record_feedback(
    ctx: &WorkflowContext,
    record: &FeedbackRecord,
) -> Result<FeedbackAck, WorkflowError> {
    if record.natural_language.trim().is_empty() {
        return Err(WorkflowError::InvalidRequest(
            "natural_language must not be empty".to_string(),
        ));
    }
    if record.generated_query.trim().is_empty() && record.corrected_query.is_none() {
        return Err(WorkflowError::InvalidRequest(
            "generated_query must not be empty".to_string(),
        ));
    }

    let feedback_id = match &ctx.feedback_log {
        Some(log) => Some(log.append(record).await?),
        None => None,
    };

    let Some(mut item) = record.example_item() else {
        info!(rating = record.rating.as_str(), "feedback logged without an example");
        return Ok(FeedbackAck {
            feedback_id,
            example_id: None,
            usage_count: 0,
        });
    };

    let _guard = ctx.feedback_writes.lock().await;
    let previous = ctx
        .store
        .get(CollectionKind::GroundTruth, &item.id)
        .await?
        .map(|existing| existing.usage_count())
        .unwrap_or(0);
    let usage = previous + 1;
    if let ItemMetadata::ExamplePair { usage_count, .. } = &mut item.metadata {
        *usage_count = usage;
    }

    let vector = ctx.embedder.embed(&item.text).await.into_value();
    ctx.store
        .upsert(CollectionKind::GroundTruth, &item, &vector)
        .await?;
    info!(example_id = %item.id, usage_count = usage, "feedback added to ground truth");

    Ok(FeedbackAck {
        feedback_id,
        example_id: Some(item.id),
        usage_count: usage,
    })
}

// ============ Status ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub collections: Vec<CollectionStats>,
    pub total_items: usize,
    pub embedding_provider: String,
    pub embedding_degraded: bool,
    pub generation_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_records: Option<usize>,
}

/// Collection counts and refresh times. Runs no retrieval.
pub async fn status(ctx: &WorkflowContext) -> Result<StatusReport, WorkflowError> {
    let collections = ctx.store.stats().await?;
    let total_items = collections.iter().map(|c| c.count).sum();
    let feedback_records = match &ctx.feedback_log {
        Some(log) => Some(log.count().await?),
        None => None,
    };
    Ok(StatusReport {
        collections,
        total_items,
        embedding_provider: ctx.embedder.provider_version(),
        embedding_degraded: ctx.embedder.is_degraded(),
        generation_provider: ctx.generator.name().to_string(),
        feedback_records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let mut state = WorkflowState::new();
        for next in [
            Stage::Retrieving,
            Stage::Refining,
            Stage::Generating,
            Stage::Validating,
            Stage::Complete,
        ] {
            state.advance(next).unwrap();
            assert_eq!(state.stage(), next);
        }
        let timings = state.finish();
        let stages: Vec<Stage> = timings.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Retrieving,
                Stage::Refining,
                Stage::Generating,
                Stage::Validating
            ]
        );
    }

    #[test]
    fn test_rejects_skips_and_backward_moves() {
        let mut state = WorkflowState::new();
        assert_eq!(
            state.advance(Stage::Generating),
            Err(TransitionError {
                from: Stage::Received,
                to: Stage::Generating
            })
        );
        state.advance(Stage::Retrieving).unwrap();
        state.advance(Stage::Refining).unwrap();
        assert!(state.advance(Stage::Retrieving).is_err());
        assert!(state.advance(Stage::Refining).is_err());
        assert_eq!(state.stage(), Stage::Refining);
    }

    #[test]
    fn test_fallback_from_any_non_terminal_stage() {
        for steps in 0..5 {
            let mut state = WorkflowState::new();
            let path = [
                Stage::Retrieving,
                Stage::Refining,
                Stage::Generating,
                Stage::Validating,
            ];
            for next in path.iter().take(steps) {
                state.advance(*next).unwrap();
            }
            state.advance(Stage::Fallback).unwrap();
            assert_eq!(state.stage(), Stage::Fallback);
            assert!(state.advance(Stage::Fallback).is_err());
            assert!(state.advance(Stage::Complete).is_err());
        }
    }

    #[test]
    fn test_no_fallback_after_complete() {
        let mut state = WorkflowState::new();
        for next in [
            Stage::Retrieving,
            Stage::Refining,
            Stage::Generating,
            Stage::Validating,
            Stage::Complete,
        ] {
            state.advance(next).unwrap();
        }
        assert!(state.advance(Stage::Fallback).is_err());
    }

    #[test]
    fn test_fallback_timing_recorded() {
        let mut state = WorkflowState::new();
        state.advance(Stage::Retrieving).unwrap();
        state.advance(Stage::Fallback).unwrap();
        let stages: Vec<Stage> = state.finish().iter().map(|t| t.stage).collect();
        assert_eq!(stages, vec![Stage::Retrieving, Stage::Fallback]);
    }

    #[test]
    fn test_query_request_defaults() {
        let req: QueryRequest =
            serde_json::from_str(r#"{"natural_language": "failed logins"}"#).unwrap();
        assert!(req.use_rag);
        assert_eq!(req.workspace_id, "");
    }

    #[test]
    fn test_generic_schema_hints_name_common_tables() {
        let hints = generic_schema_hints();
        assert!(hints.contains("SecurityEvent"));
        assert!(hints.contains("TimeGenerated"));
    }

    #[test]
    fn test_error_codes() {
        let e = WorkflowError::GenerationUnavailable {
            message: "x".into(),
            retryable: true,
        };
        assert_eq!(e.code(), "generation_unavailable");
        assert!(e.is_retryable());
        assert!(!WorkflowError::InvalidRequest("x".into()).is_retryable());
    }
}
