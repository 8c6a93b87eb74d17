use std::fmt;
use std::path::PathBuf;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::config;

pub const DEFAULT_TOOL: &str = "codex";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// A per-source prompt template with a `{{URL}}` placeholder.
    Legacy,
    /// A short prompt naming an agent skill that drives the crawl.
    Skill,
}

impl PromptMode {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "skill" => Ok(Self::Skill),
            other => anyhow::bail!("unsupported prompt mode: {other:?} (expected legacy or skill)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Skill => "skill",
        }
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One crawl job as supplied by a caller. Fields are raw; call
/// [`CrawlRequest::normalize`] before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub url: String,
    pub out_dir: PathBuf,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub prompt_mode: Option<String>,
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub skill_name: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub skip_git_repo_check: bool,
}

/// A request with whitespace trimmed, defaults applied and environment
/// fallbacks resolved. Immutable for the rest of the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub url: String,
    pub out_dir: PathBuf,
    pub tool: String,
    pub prompt_mode: PromptMode,
    pub prompt_file: Option<PathBuf>,
    pub skill_name: Option<String>,
    pub run_id: Option<String>,
    pub model: Option<String>,
    pub skip_git_repo_check: bool,
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            out_dir: out_dir.into(),
            ..Self::default()
        }
    }

    pub fn normalize(&self) -> anyhow::Result<NormalizedRequest> {
        self.normalize_with(config::process_env)
    }

    pub fn normalize_with<F>(&self, get: F) -> anyhow::Result<NormalizedRequest>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = self.url.trim().to_owned();
        if url.is_empty() {
            anyhow::bail!("missing url");
        }

        let out_dir = self.out_dir.to_string_lossy().trim().to_owned();
        if out_dir.is_empty() {
            anyhow::bail!("missing out_dir");
        }

        let tool = non_empty(self.tool.as_deref())
            .or_else(|| config::string(&get, "CRAWL_TOOL"))
            .unwrap_or_else(|| DEFAULT_TOOL.to_owned())
            .to_ascii_lowercase();

        let explicit_skill = non_empty(self.skill_name.as_deref());
        let prompt_mode = match non_empty(self.prompt_mode.as_deref())
            .or_else(|| config::string(&get, "CRAWL_PROMPT_MODE"))
        {
            Some(raw) => PromptMode::parse(&raw)?,
            None if explicit_skill.is_some() => PromptMode::Skill,
            None => PromptMode::Legacy,
        };

        let prompt_file = self
            .prompt_file
            .as_ref()
            .map(|path| path.to_string_lossy().trim().to_owned())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let skill_name = match prompt_mode {
            PromptMode::Legacy => {
                if let Some(skill) = explicit_skill {
                    anyhow::bail!("skill {skill:?} requires prompt mode skill");
                }
                None
            }
            PromptMode::Skill => {
                if let Some(path) = &prompt_file {
                    anyhow::bail!(
                        "prompt file {} is only supported in legacy prompt mode",
                        path.display()
                    );
                }
                explicit_skill.or_else(|| config::string(&get, "CRAWL_SKILL_NAME"))
            }
        };

        let run_id = non_empty(self.run_id.as_deref());
        if let Some(run_id) = &run_id {
            validate_run_id(run_id).context("invalid run_id")?;
        }

        Ok(NormalizedRequest {
            url,
            out_dir: PathBuf::from(out_dir),
            tool,
            prompt_mode,
            prompt_file,
            skill_name,
            run_id,
            model: non_empty(self.model.as_deref()),
            skip_git_repo_check: self.skip_git_repo_check,
        })
    }
}

impl NormalizedRequest {
    /// `<out_dir>/artifacts/<run_id>` when the request carries a run id.
    pub fn artifact_dir(&self) -> Option<PathBuf> {
        self.run_id
            .as_deref()
            .map(|run_id| crate::artifact::artifact_dir(&self.out_dir, run_id))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Run ids become directory names, so they must be a single safe path segment.
fn validate_run_id(run_id: &str) -> anyhow::Result<()> {
    if run_id == "." || run_id == ".." {
        anyhow::bail!("{run_id:?} is not a directory name");
    }
    if let Some(bad) = run_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        anyhow::bail!("{run_id:?} contains unsupported character {bad:?}");
    }
    Ok(())
}
