//! Prompts sent to agents: legacy templates, skill invocations and the two
//! corrective re-prompts used by the repair loop.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context as _;

use crate::contract::CONTRACT_SCHEMA;
use crate::source::Source;

const URL_PLACEHOLDER: &str = "{{URL}}";

/// How the result of a skill-driven run is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// The pipeline writes a contract-shaped `final.json` into the run's
    /// artifact directory.
    FinalRecord,
    /// The agent answers with a pointer naming per-facet snapshot files.
    SnapshotPointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skill {
    pub name: &'static str,
    pub source: Source,
    pub reconcile: Reconcile,
}

const SKILLS: [Skill; 4] = [
    Skill {
        name: "shopee-orchestrator-pipeline",
        source: Source::Shopee,
        reconcile: Reconcile::FinalRecord,
    },
    Skill {
        name: "shopee-page-snapshot",
        source: Source::Shopee,
        reconcile: Reconcile::SnapshotPointer,
    },
    Skill {
        name: "taobao-orchestrator-pipeline",
        source: Source::Taobao,
        reconcile: Reconcile::FinalRecord,
    },
    Skill {
        name: "taobao-page-snapshot",
        source: Source::Taobao,
        reconcile: Reconcile::SnapshotPointer,
    },
];

/// Looks up `name` among the skills known for `source`. Without a name the
/// source's orchestrator pipeline is used.
pub fn resolve_skill(source: Source, name: Option<&str>) -> anyhow::Result<Skill> {
    let mut known = SKILLS.iter().filter(|skill| skill.source == source);
    let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) else {
        return known
            .find(|skill| skill.reconcile == Reconcile::FinalRecord)
            .copied()
            .with_context(|| format!("no default skill for source {source}"));
    };

    if let Some(skill) = known.clone().find(|skill| skill.name == name) {
        return Ok(*skill);
    }
    let supported = known.map(|skill| skill.name).collect::<Vec<_>>().join(", ");
    anyhow::bail!("unsupported {source} skill {name:?} (supported: {supported})")
}

/// Reads a template and substitutes the target URL.
pub async fn load_legacy_prompt(path: &Path, url: &str) -> anyhow::Result<String> {
    let template = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read prompt template {}", path.display()))?;
    if template.trim().is_empty() {
        anyhow::bail!("prompt template {} is empty", path.display());
    }
    Ok(template.replace(URL_PLACEHOLDER, url))
}

/// Short prompt that hands control to an agent skill. With a run id the
/// agent is pinned to that id and its artifact directory.
pub fn build_skill_prompt(skill: &Skill, url: &str, run: Option<(&str, &Path)>) -> String {
    let mut prompt = format!(
        "Use the \"{}\" skill as the primary crawling guide. Target URL: {url}",
        skill.name
    );
    if let Some((run_id, artifact_dir)) = run {
        let _ = write!(
            prompt,
            "\nRun ID: {run_id}\nArtifact dir: {}\nUse the provided Run ID exactly. Do not generate a new run_id.\n",
            artifact_dir.display()
        );
    }
    prompt
}

/// The original prompt plus hard caps on output size, for agents that ran
/// out of output budget mid-object.
pub fn with_output_limits(prompt: &str) -> String {
    format!(
        "{prompt}\n\n\
         Output limits (mandatory):\n\
         - Return exactly one JSON object and nothing else.\n\
         - images: at most 20 entries.\n\
         - variations: at most 20 entries; each variation at most 5 images.\n\
         - description: at most 1500 characters.\n\
         - Use an explicit empty array ([]) instead of omitting images or variations.\n"
    )
}

/// Asks the agent to re-emit its previous answer as one contract object.
/// `problem` says what was wrong with `previous_output`.
pub fn build_repair_prompt(url: &str, problem: &str, previous_output: &str) -> String {
    format!(
        "Your previous answer for {url} could not be used: {problem}.\n\n\
         Re-emit the result as exactly ONE JSON object that satisfies this schema:\n\
         {CONTRACT_SCHEMA}\n\n\
         Rules:\n\
         - Output JSON only. No markdown fences, no prose before or after.\n\
         - Do not call any tools and do not browse again; use only the previous output below.\n\
         - captured_at must be an RFC3339 UTC timestamp.\n\
         - price must be a number or a plain numeric string such as \"123.45\".\n\
         - If the previous output has no usable data, return status \"error\" with an error message.\n\n\
         Previous output:\n\
         <<<\n{previous_output}\n>>>\n"
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn defaults_to_orchestrator_pipeline() {
        let skill = resolve_skill(Source::Shopee, None).unwrap();
        assert_eq!(skill.name, "shopee-orchestrator-pipeline");
        assert_eq!(skill.reconcile, Reconcile::FinalRecord);

        let skill = resolve_skill(Source::Taobao, Some("  ")).unwrap();
        assert_eq!(skill.name, "taobao-orchestrator-pipeline");
    }

    #[test]
    fn resolves_snapshot_skill_per_source() {
        let skill = resolve_skill(Source::Shopee, Some("shopee-page-snapshot")).unwrap();
        assert_eq!(skill.reconcile, Reconcile::SnapshotPointer);
        assert!(resolve_skill(Source::Taobao, Some("shopee-page-snapshot")).is_err());
    }

    #[test]
    fn unknown_skill_lists_supported_names() {
        let err = resolve_skill(Source::Shopee, Some("shopee-product-crawler"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("unsupported shopee skill"), "{err}");
        assert!(err.contains("shopee-page-snapshot"), "{err}");
    }

    #[test]
    fn skill_prompt_pins_run_id() {
        let skill = resolve_skill(Source::Shopee, None).unwrap();
        let prompt = build_skill_prompt(&skill, "https://shopee.tw/product/1/2", None);
        assert_eq!(
            prompt,
            "Use the \"shopee-orchestrator-pipeline\" skill as the primary crawling guide. \
             Target URL: https://shopee.tw/product/1/2"
        );

        let dir = PathBuf::from("out/artifacts/run-1");
        let prompt = build_skill_prompt(&skill, "https://shopee.tw/p", Some(("run-1", &dir)));
        assert!(prompt.contains("\nRun ID: run-1\n"), "{prompt}");
        assert!(prompt.contains("Artifact dir: out/artifacts/run-1\n"), "{prompt}");
        assert!(prompt.contains("Do not generate a new run_id."), "{prompt}");
    }

    #[tokio::test]
    async fn legacy_template_substitutes_url() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("prompt.txt");
        std::fs::write(&path, "Crawl {{URL}} and report.").unwrap();
        let prompt = load_legacy_prompt(&path, "https://shopee.tw/p").await.unwrap();
        assert_eq!(prompt, "Crawl https://shopee.tw/p and report.");

        std::fs::write(&path, " \n").unwrap();
        assert!(load_legacy_prompt(&path, "u").await.is_err());
        assert!(
            load_legacy_prompt(&temp.path().join("missing.txt"), "u")
                .await
                .is_err()
        );
    }

    #[test]
    fn corrective_prompts_carry_context() {
        let limited = with_output_limits("crawl it");
        assert!(limited.starts_with("crawl it"));
        assert!(limited.contains("Output limits"));

        let repair = build_repair_prompt("https://shopee.tw/p", "missing status", "not json");
        assert!(repair.contains("https://shopee.tw/p"));
        assert!(repair.contains("missing status"));
        assert!(repair.contains("not json"));
        assert!(repair.contains("\"captured_at\""));
        assert!(repair.contains("Do not call any tools"));
    }
}
