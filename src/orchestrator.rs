//! One crawl job, end to end.
//!
//! request -> source -> prompt -> adapter -> (auth check) -> run and reconcile
//! -> normalize -> validate -> provenance -> result file.
//!
//! Every path returns a [`CrawlOutcome`] carrying a contract-shaped result;
//! failures are reported through its `error`, never by panicking.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterRegistry, Invocation, ToolAdapter};
use crate::artifact::{self, SnapshotContext, SnapshotPointer};
use crate::config;
use crate::contract;
use crate::error::CrawlError;
use crate::extract::{diagnose, extract_object_with_status};
use crate::normalize::normalize;
use crate::prompt::{self, Reconcile};
use crate::repair::{Rejection, run_with_repair};
use crate::request::{CrawlRequest, NormalizedRequest, PromptMode};
use crate::result::{CanonicalResult, ResultSource, STATUS_ERROR, now_rfc3339};
use crate::source::{self, Source};
use crate::writer;

/// What a crawl job hands back to its caller.
///
/// `result` is always present; on failure it is the error record. The
/// `artifact_path` is set only when a result file was written, which happens
/// in direct mode.
#[derive(Debug)]
pub struct CrawlOutcome {
    pub artifact_path: Option<PathBuf>,
    pub result: CanonicalResult,
    pub error: Option<CrawlError>,
}

impl CrawlOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// How the canonical result of a job is recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    /// The agent's answer is the result.
    Direct,
    /// `<out_dir>/artifacts/<run_id>/final.json` is the result.
    FinalRecord { run_id: String, dir: PathBuf },
    /// The agent's answer points at snapshot files.
    SnapshotPointer { run_id: Option<String> },
}

impl Mode {
    fn writes_result_file(&self) -> bool {
        matches!(self, Self::Direct)
    }

    fn run_id(&self) -> Option<&str> {
        match self {
            Self::Direct => None,
            Self::FinalRecord { run_id, .. } => Some(run_id),
            Self::SnapshotPointer { run_id } => run_id.as_deref(),
        }
    }
}

#[derive(Debug)]
struct Plan {
    prompt: String,
    mode: Mode,
}

/// Facts gathered along the way and stamped onto the result.
#[derive(Debug, Default)]
struct Provenance {
    source: Option<Source>,
    tool: Option<String>,
    result_source: Option<ResultSource>,
    run_id: Option<String>,
    auth_check_error: Option<String>,
    repair_attempts: Option<u32>,
    tool_error: Option<String>,
}

impl Provenance {
    fn stamp(&self, result: &mut CanonicalResult) {
        if let Some(source) = self.source {
            result.insert("source", source.as_str());
        }
        if let Some(tool) = &self.tool {
            result.insert("tool", tool.as_str());
        }
        if let Some(result_source) = self.result_source {
            result.insert("result_source", result_source.as_str());
        }
        if let Some(run_id) = &self.run_id {
            result.insert("run_id", run_id.as_str());
        }
        if let Some(err) = &self.auth_check_error {
            result.insert("auth_check_error", err.as_str());
        }
        if let Some(attempts) = self.repair_attempts {
            result.insert("repair_attempts", attempts);
        }
        if let Some(err) = &self.tool_error {
            result.insert("tool_error", err.as_str());
        }
    }
}

type EnvGetter = fn(&str) -> Option<String>;

/// Runs crawl jobs against a fixed set of adapters.
///
/// Jobs share no mutable state; one service can run many jobs concurrently.
#[derive(Clone)]
pub struct CrawlService {
    adapters: Arc<AdapterRegistry>,
    env: EnvGetter,
}

impl CrawlService {
    pub fn new(adapters: AdapterRegistry) -> Self {
        Self {
            adapters: Arc::new(adapters),
            env: config::process_env,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(AdapterRegistry::from_env()?))
    }

    /// Replaces the environment lookup used for request defaults.
    pub fn with_env(mut self, env: EnvGetter) -> Self {
        self.env = env;
        self
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Runs one job to completion or cancellation.
    pub async fn run_once(
        &self,
        request: &CrawlRequest,
        cancel: &CancellationToken,
    ) -> CrawlOutcome {
        let req = match request.normalize_with(self.env) {
            Ok(req) => req,
            Err(err) => {
                let err = CrawlError::input(format!("{err:#}"));
                tracing::warn!(url = request.url.trim(), error = %err, "rejected crawl request");
                return CrawlOutcome {
                    artifact_path: None,
                    result: CanonicalResult::error(request.url.trim(), err.to_string()),
                    error: Some(err),
                };
            }
        };

        tracing::info!(
            url = %req.url,
            tool = %req.tool,
            prompt_mode = %req.prompt_mode,
            skill = ?req.skill_name,
            run_id = ?req.run_id,
            "crawl job started"
        );

        if let Err(err) = tokio::fs::create_dir_all(&req.out_dir).await {
            let err = anyhow::Error::new(err).context("create out dir");
            let err = CrawlError::artifact(&req.out_dir, &err);
            return CrawlOutcome {
                artifact_path: None,
                result: CanonicalResult::error(&req.url, err.to_string()),
                error: Some(err),
            };
        }

        let mut provenance = Provenance {
            tool: Some(req.tool.clone()),
            ..Provenance::default()
        };
        let (mode, outcome) = match self.prepare(&req, &mut provenance).await {
            Ok((plan, adapter)) => {
                let outcome = self
                    .execute(&req, &plan, adapter.as_ref(), cancel, &mut provenance)
                    .await;
                (Some(plan.mode), outcome)
            }
            Err(err) => (None, Err(Failure::new(err))),
        };

        self.finish(&req, mode.as_ref(), outcome, &provenance).await
    }

    /// Everything that can be rejected before a subprocess starts.
    async fn prepare(
        &self,
        req: &NormalizedRequest,
        provenance: &mut Provenance,
    ) -> Result<(Plan, Arc<dyn ToolAdapter>), CrawlError> {
        let source =
            source::detect(&req.url).map_err(|err| CrawlError::input(format!("{err:#}")))?;
        provenance.source = Some(source);

        let adapter = self.adapters.get(&req.tool).ok_or_else(|| {
            CrawlError::input(format!(
                "unsupported tool {:?} (available: {})",
                req.tool,
                self.adapters.names().join(", ")
            ))
        })?;

        let plan = plan(req, source).await?;
        provenance.run_id = plan.mode.run_id().map(str::to_owned);
        Ok((plan, adapter))
    }

    async fn execute(
        &self,
        req: &NormalizedRequest,
        plan: &Plan,
        adapter: &dyn ToolAdapter,
        cancel: &CancellationToken,
        provenance: &mut Provenance,
    ) -> Result<CanonicalResult, Failure> {
        if let Err(err) = adapter.check_auth(cancel).await {
            let message = format!("{err:#}");
            tracing::warn!(
                tool = adapter.name(),
                error = %message,
                "auth check failed; continuing"
            );
            provenance.auth_check_error = Some(message);
        }

        let invocation = Invocation {
            url: &req.url,
            prompt: &plan.prompt,
            model: req.model.as_deref(),
            skip_git_repo_check: req.skip_git_repo_check,
            cancel,
        };

        match &plan.mode {
            Mode::Direct => {
                let url = req.url.as_str();
                let repaired =
                    run_with_repair(adapter, &invocation, |raw| accept_direct(raw, url))
                        .await
                        .map_err(Failure::new)?;
                provenance.result_source = Some(ResultSource::ToolOutput);
                provenance.repair_attempts = Some(repaired.attempts);
                Ok(repaired.value)
            }
            Mode::FinalRecord { dir, .. } => {
                let raw = adapter.run(&invocation).await;
                if let Err(err) = &raw {
                    let message = format!("{err:#}");
                    tracing::warn!(
                        tool = adapter.name(),
                        error = %message,
                        "tool failed; reading final record anyway"
                    );
                    provenance.tool_error = Some(message);
                }
                reconcile_final_record(req, dir, raw, provenance).await
            }
            Mode::SnapshotPointer { run_id } => {
                let raw = adapter
                    .run(&invocation)
                    .await
                    .map_err(|err| Failure::new(CrawlError::execution(adapter.name(), &err)))?;
                let ctx = SnapshotContext {
                    out_dir: &req.out_dir,
                    run_id: run_id.as_deref(),
                };
                let pointer = SnapshotPointer::parse(&raw, &ctx)
                    .map_err(|err| Failure::new(CrawlError::Extraction(format!("{err:#}"))))?;
                if provenance.run_id.is_none() && !pointer.run_id.trim().is_empty() {
                    provenance.run_id = Some(pointer.run_id.trim().to_owned());
                }
                provenance.result_source = Some(ResultSource::ArtifactSnapshot);

                let mut result = artifact::build_from_snapshot(&pointer, &req.url)
                    .await
                    .map_err(Failure::new)?;
                normalize(&mut result, &req.url);
                if result.is_error() {
                    let err = CrawlError::Extraction(status_error_message(
                        "snapshot pointer",
                        &result,
                    ));
                    return Err(Failure::with_result(err, result));
                }
                Ok(result)
            }
        }
    }

    /// Validates, stamps and (in direct mode) writes the outcome.
    async fn finish(
        &self,
        req: &NormalizedRequest,
        mode: Option<&Mode>,
        outcome: Result<CanonicalResult, Failure>,
        provenance: &Provenance,
    ) -> CrawlOutcome {
        let (mut result, error) = match outcome.and_then(|mut result| {
            normalize(&mut result, &req.url);
            match contract::validate(&result) {
                Ok(_) => Ok(result),
                Err(violations) => {
                    Err(Failure::new(CrawlError::Contract(violations.to_string())))
                }
            }
        }) {
            Ok(result) => (result, None),
            Err(Failure { error, result }) => {
                let result = match result {
                    Some(record) => complete_error_record(record, &req.url, &error),
                    None => CanonicalResult::error(&req.url, error.to_string()),
                };
                (result, Some(error))
            }
        };
        provenance.stamp(&mut result);

        match &error {
            None => {
                tracing::info!(url = %req.url, status = ?result.status(), "crawl job finished");
            }
            Some(err) => {
                tracing::warn!(url = %req.url, kind = err.kind(), error = %err, "crawl job failed");
            }
        }

        let mut outcome = CrawlOutcome {
            artifact_path: None,
            result,
            error,
        };
        if !mode.is_none_or(Mode::writes_result_file) {
            return outcome;
        }

        match writer::write_result(&req.out_dir, provenance.source, &outcome.result).await {
            Ok(path) => outcome.artifact_path = Some(path),
            Err(err) => {
                tracing::error!(
                    out_dir = %req.out_dir.display(),
                    error = %format!("{err:#}"),
                    "write result"
                );
                if outcome.error.is_none() {
                    outcome.error = Some(CrawlError::artifact(&req.out_dir, &err));
                }
            }
        }
        outcome
    }
}

/// A failed job: the error, plus the record to return when the failure
/// itself came with one (an artifact whose status is `error`).
#[derive(Debug)]
struct Failure {
    error: CrawlError,
    result: Option<CanonicalResult>,
}

impl Failure {
    fn new(error: CrawlError) -> Self {
        Self {
            error,
            result: None,
        }
    }

    fn with_result(error: CrawlError, result: CanonicalResult) -> Self {
        Self {
            error,
            result: Some(result),
        }
    }
}

/// Prompt and reconciliation mode for a request.
async fn plan(req: &NormalizedRequest, source: Source) -> Result<Plan, CrawlError> {
    match req.prompt_mode {
        PromptMode::Legacy => {
            let path = req
                .prompt_file
                .clone()
                .unwrap_or_else(|| source.default_prompt_file());
            let prompt = prompt::load_legacy_prompt(&path, &req.url)
                .await
                .map_err(|err| CrawlError::input(format!("{err:#}")))?;
            Ok(Plan {
                prompt,
                mode: Mode::Direct,
            })
        }
        PromptMode::Skill => {
            let skill = prompt::resolve_skill(source, req.skill_name.as_deref())
                .map_err(|err| CrawlError::input(format!("{err:#}")))?;
            let run_dir = req.artifact_dir();
            let run = req.run_id.as_deref().zip(run_dir.as_deref());
            let prompt = prompt::build_skill_prompt(&skill, &req.url, run);

            let mode = match (skill.reconcile, &req.run_id, run_dir) {
                (Reconcile::FinalRecord, Some(run_id), Some(dir)) => Mode::FinalRecord {
                    run_id: run_id.clone(),
                    dir,
                },
                (Reconcile::FinalRecord, _, _) => Mode::Direct,
                (Reconcile::SnapshotPointer, run_id, _) => Mode::SnapshotPointer {
                    run_id: run_id.clone(),
                },
            };
            Ok(Plan { prompt, mode })
        }
    }
}

/// Strict extraction, normalization and validation of a direct answer.
fn accept_direct(raw: &str, url: &str) -> Result<CanonicalResult, Rejection> {
    let object =
        extract_object_with_status(raw).map_err(|_| Rejection::Extraction(diagnose(raw)))?;
    let mut result = CanonicalResult::from(object);
    normalize(&mut result, url);
    contract::validate(&result).map_err(Rejection::Contract)?;
    Ok(result)
}

/// The final record wins over whatever the tool printed. Without one, a
/// contract-valid tool answer is accepted instead.
async fn reconcile_final_record(
    req: &NormalizedRequest,
    dir: &std::path::Path,
    raw: anyhow::Result<String>,
    provenance: &mut Provenance,
) -> Result<CanonicalResult, Failure> {
    let path = dir.join(artifact::FINAL_RECORD_FILE);
    let tool_error = raw.as_ref().err().map(|err| format!("{err:#}"));
    let with_tool_error = |message: String| match &tool_error {
        Some(tool_error) => format!("{message} (tool error: {tool_error})"),
        None => message,
    };

    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let mut result = artifact::load_final_record(dir).await.map_err(|err| match err {
            CrawlError::Artifact { path, message } => Failure::new(CrawlError::Artifact {
                path,
                message: with_tool_error(message),
            }),
            other => Failure::new(other),
        })?;
        provenance.result_source = Some(ResultSource::ArtifactFinal);
        normalize(&mut result, &req.url);
        if result.is_error() {
            let err = CrawlError::Artifact {
                path,
                message: with_tool_error(status_error_message("final record", &result)),
            };
            return Err(Failure::with_result(err, result));
        }
        return Ok(result);
    }

    if let Ok(raw) = &raw
        && let Ok(result) = accept_direct(raw, &req.url)
    {
        tracing::warn!(path = %path.display(), "final record missing; using tool output");
        provenance.result_source = Some(ResultSource::ToolOutput);
        return Ok(result);
    }

    Err(Failure::new(CrawlError::Artifact {
        path,
        message: with_tool_error("final record not found".to_owned()),
    }))
}

fn status_error_message(what: &str, record: &CanonicalResult) -> String {
    match record.get_str("error").map(str::trim).filter(|err| !err.is_empty()) {
        Some(detail) => format!("{what} has status error: {detail}"),
        None => format!("{what} has status error"),
    }
}

/// A record handed back with a failure must still satisfy the error-record
/// invariants; blanks are filled from the job's error.
fn complete_error_record(
    mut record: CanonicalResult,
    url: &str,
    error: &CrawlError,
) -> CanonicalResult {
    let blank = |value: Option<&str>| value.is_none_or(|value| value.trim().is_empty());

    record.insert("status", STATUS_ERROR);
    if blank(record.get_str("url")) {
        record.insert("url", url);
    }
    if blank(record.get_str("error")) {
        record.insert("error", error.to_string());
    }
    let timestamp_ok = record
        .get_str("captured_at")
        .is_some_and(|ts| DateTime::parse_from_rfc3339(ts.trim()).is_ok());
    if !timestamp_ok {
        record.insert("captured_at", now_rfc3339());
    }

    match contract::validate(&record) {
        Ok(_) => record,
        Err(violations) => {
            tracing::warn!(%violations, "error record breaks the contract; replacing it");
            CanonicalResult::error(url, error.to_string())
        }
    }
}
