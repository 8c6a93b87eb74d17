//! Bounded recovery from unusable agent output.
//!
//! One agent run, then at most one corrective re-prompt. Truncated output from
//! an agent that honours output limits gets a single extra try with the
//! original prompt plus limits before the repair prompt is sent.

use std::fmt;

use crate::adapter::{Invocation, ToolAdapter};
use crate::contract::ContractViolations;
use crate::error::CrawlError;
use crate::extract::{ContractIssue, looks_truncated};
use crate::prompt::{build_repair_prompt, with_output_limits};

/// Why a raw answer was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No contract-shaped object could be recovered.
    Extraction(ContractIssue),
    /// An object was recovered but breaks the contract.
    Contract(ContractViolations),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extraction(issue) => write!(f, "{issue}"),
            Self::Contract(violations) => write!(f, "contract violations: {violations}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Repaired<T> {
    pub value: T,
    /// Agent invocations beyond the first.
    pub attempts: u32,
}

/// Runs `adapter` and feeds its answer to `accept`, re-prompting on
/// rejection. Execution failures are not retried.
pub async fn run_with_repair<T, F>(
    adapter: &dyn ToolAdapter,
    invocation: &Invocation<'_>,
    accept: F,
) -> Result<Repaired<T>, CrawlError>
where
    F: Fn(&str) -> Result<T, Rejection>,
{
    let tool = adapter.name();
    let mut attempts = 0;

    let mut raw = run(adapter, invocation, None).await?;
    let original = match accept(&raw) {
        Ok(value) => return Ok(Repaired { value, attempts }),
        Err(rejection) => rejection,
    };

    let mut last = original.clone();
    if original == Rejection::Extraction(ContractIssue::InvalidOrTruncated)
        && adapter.supports_output_limits()
        && looks_truncated(&raw)
    {
        tracing::warn!(
            tool,
            url = invocation.url,
            issue = %original,
            "output looks truncated; retrying with output limits"
        );
        let limited = with_output_limits(invocation.prompt);
        attempts += 1;
        raw = run(adapter, &invocation.with_prompt(&limited), Some(&original)).await?;
        match accept(&raw) {
            Ok(value) => return Ok(Repaired { value, attempts }),
            Err(rejection) => last = rejection,
        }
    }

    tracing::warn!(
        tool,
        url = invocation.url,
        issue = %last,
        "output rejected; sending repair prompt"
    );
    let repair = build_repair_prompt(invocation.url, &last.to_string(), &raw);
    attempts += 1;
    raw = run(adapter, &invocation.with_prompt(&repair), Some(&original)).await?;
    match accept(&raw) {
        Ok(value) => {
            tracing::info!(tool, url = invocation.url, attempts, "repair succeeded");
            Ok(Repaired { value, attempts })
        }
        Err(Rejection::Contract(violations)) => Err(CrawlError::Contract(format!(
            "{violations} (after repair; original: {original})"
        ))),
        Err(Rejection::Extraction(issue)) => Err(CrawlError::Extraction(format!(
            "no contract object in {tool} output: {original}; repair failed: {issue}"
        ))),
    }
}

async fn run(
    adapter: &dyn ToolAdapter,
    invocation: &Invocation<'_>,
    retrying_after: Option<&Rejection>,
) -> Result<String, CrawlError> {
    adapter.run(invocation).await.map_err(|err| match retrying_after {
        None => CrawlError::execution(adapter.name(), &err),
        Some(original) => {
            CrawlError::execution(adapter.name(), &err.context(format!("retry after: {original}")))
        }
    })
}
