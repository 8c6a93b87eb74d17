use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use product_miner::adapter::codex::{CodexAdapter, CodexConfig};
use product_miner::adapter::{AdapterRegistry, Invocation, ToolAdapter};
use product_miner::{CrawlError, CrawlRequest, CrawlService};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const URL: &str = "https://shopee.tw/product/1/2";

/// Replays canned answers, newest call last, and records every prompt.
struct Stub {
    answers: Mutex<Vec<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    auth: Result<(), String>,
}

impl Stub {
    fn new(answers: Vec<Result<&str, &str>>) -> Arc<Self> {
        let mut answers = answers
            .into_iter()
            .map(|answer| answer.map(str::to_owned).map_err(str::to_owned))
            .collect::<Vec<_>>();
        answers.reverse();
        Arc::new(Self {
            answers: Mutex::new(answers),
            prompts: Mutex::new(Vec::new()),
            auth: Ok(()),
        })
    }

    fn failing_auth(answers: Vec<Result<&str, &str>>) -> Arc<Self> {
        let stub = Self::new(answers);
        let mut stub = Arc::into_inner(stub).unwrap();
        stub.auth = Err("not logged in".to_owned());
        Arc::new(stub)
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompt(&self, idx: usize) -> String {
        self.prompts.lock().unwrap()[idx].clone()
    }
}

#[async_trait]
impl ToolAdapter for Stub {
    fn name(&self) -> &str {
        "stub"
    }

    async fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push(invocation.prompt.to_owned());
        match self.answers.lock().unwrap().pop() {
            Some(Ok(answer)) => Ok(answer),
            Some(Err(err)) => Err(anyhow::anyhow!(err)),
            None => Err(anyhow::anyhow!("stub exhausted")),
        }
    }

    async fn check_auth(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.auth.clone().map_err(|err| anyhow::anyhow!(err))
    }
}

fn service(stub: &Arc<Stub>) -> CrawlService {
    let adapter: Arc<dyn ToolAdapter> = stub.clone();
    CrawlService::new(AdapterRegistry::new(vec![adapter]).unwrap()).with_env(|_| None)
}

fn legacy_request(out_dir: &Path) -> CrawlRequest {
    let prompt_file = out_dir.join("prompt.txt");
    fs::create_dir_all(out_dir).unwrap();
    fs::write(&prompt_file, "Crawl {{URL}} and answer with JSON.").unwrap();
    CrawlRequest {
        tool: Some("stub".to_owned()),
        prompt_file: Some(prompt_file),
        ..CrawlRequest::new(URL, out_dir)
    }
}

fn skill_request(out_dir: &Path, skill: Option<&str>, run_id: Option<&str>) -> CrawlRequest {
    CrawlRequest {
        tool: Some("stub".to_owned()),
        prompt_mode: Some("skill".to_owned()),
        skill_name: skill.map(str::to_owned),
        run_id: run_id.map(str::to_owned),
        ..CrawlRequest::new(URL, out_dir)
    }
}

fn result_files(out_dir: &Path) -> Vec<String> {
    let mut names = fs::read_dir(out_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".json"))
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[tokio::test]
async fn direct_answer_is_stamped_and_written() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![Ok(
        r#"Here you go: {"url":"https://shopee.tw/product/1/2","status":"ok","title":"Mug","currency":"twd","price":"120"}"#,
    )]);

    let outcome = service(&stub)
        .run_once(&legacy_request(temp.path()), &CancellationToken::new())
        .await;

    assert!(outcome.is_ok(), "{:?}", outcome.error);
    assert!(stub.prompt(0).contains(URL));
    let result = &outcome.result;
    assert_eq!(result.get_str("currency"), Some("TWD"));
    assert_eq!(result.get_str("source"), Some("shopee"));
    assert_eq!(result.get_str("tool"), Some("stub"));
    assert_eq!(result.get_str("result_source"), Some("tool_output"));
    assert_eq!(result.get("repair_attempts"), Some(&json!(0)));

    let path = outcome.artifact_path.expect("result file path");
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.contains("_shopee_"), "{name}");
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["title"], "Mug");
}

#[tokio::test]
async fn unusable_output_is_repaired_at_most_once() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![Ok("I could not do it."), Ok("still no JSON"), Ok("{}")]);

    let outcome = service(&stub)
        .run_once(&legacy_request(temp.path()), &CancellationToken::new())
        .await;

    assert_eq!(stub.calls(), 2);
    assert!(stub.prompt(1).contains("Previous output:"));
    let err = outcome.error.expect("error");
    assert!(matches!(err, CrawlError::Extraction(_)), "{err}");
    assert_eq!(outcome.result.status(), Some("error"));
    assert_eq!(outcome.result.get_str("url"), Some(URL));
    assert!(outcome.artifact_path.is_some());
}

#[tokio::test]
async fn repaired_answer_counts_the_attempt() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![
        Ok(r#"{"url":"https://shopee.tw/product/1/2","status":"needs_manual"}"#),
        Ok(r#"{"url":"https://shopee.tw/product/1/2","status":"needs_manual","notes":"captcha"}"#),
    ]);

    let outcome = service(&stub)
        .run_once(&legacy_request(temp.path()), &CancellationToken::new())
        .await;

    assert!(outcome.is_ok(), "{:?}", outcome.error);
    assert_eq!(stub.calls(), 2);
    assert_eq!(outcome.result.get_str("notes"), Some("captcha"));
    assert_eq!(outcome.result.get("repair_attempts"), Some(&json!(1)));
}

#[tokio::test]
async fn tool_failure_is_an_execution_error_without_retry() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![Err("exit status 2")]);

    let outcome = service(&stub)
        .run_once(&legacy_request(temp.path()), &CancellationToken::new())
        .await;

    assert_eq!(stub.calls(), 1);
    let err = outcome.error.expect("error");
    assert!(matches!(err, CrawlError::Execution { .. }), "{err}");
    assert!(err.to_string().contains("exit status 2"), "{err}");
}

#[tokio::test]
async fn final_record_wins_over_failed_tool() {
    let temp = tempfile::TempDir::new().unwrap();
    let run_dir = temp.path().join("artifacts").join("run-1");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(
        run_dir.join("final.json"),
        json!({
            "url": URL,
            "status": "ok",
            "captured_at": "2026-01-18T00:00:00Z",
            "title": "From artifact",
        })
        .to_string(),
    )
    .unwrap();
    let stub = Stub::new(vec![Err("timeout after 900s")]);

    let outcome = service(&stub)
        .run_once(
            &skill_request(temp.path(), None, Some("run-1")),
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.is_ok(), "{:?}", outcome.error);
    assert!(stub.prompt(0).contains("run-1"));
    let result = &outcome.result;
    assert_eq!(result.get_str("title"), Some("From artifact"));
    assert_eq!(result.get_str("result_source"), Some("artifact_final"));
    assert_eq!(result.get_str("run_id"), Some("run-1"));
    assert!(
        result
            .get_str("tool_error")
            .is_some_and(|err| err.contains("timeout"))
    );
    assert!(outcome.artifact_path.is_none());
    assert!(result_files(temp.path()).is_empty());
}

#[tokio::test]
async fn final_record_with_error_status_fails_the_job() {
    let temp = tempfile::TempDir::new().unwrap();
    let run_dir = temp.path().join("artifacts").join("run-2");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(
        run_dir.join("final.json"),
        json!({
            "url": URL,
            "status": "error",
            "captured_at": "2026-01-18T00:00:00Z",
            "error": "blocked by captcha",
        })
        .to_string(),
    )
    .unwrap();
    let stub = Stub::new(vec![Ok("done")]);

    let outcome = service(&stub)
        .run_once(
            &skill_request(temp.path(), None, Some("run-2")),
            &CancellationToken::new(),
        )
        .await;

    let err = outcome.error.expect("error");
    assert!(err.to_string().contains("status error"), "{err}");
    assert!(err.to_string().contains("blocked by captcha"), "{err}");
    assert_eq!(outcome.result.status(), Some("error"));
    assert_eq!(outcome.result.get_str("error"), Some("blocked by captcha"));
}

#[tokio::test]
async fn final_error_record_is_completed_before_returning() {
    let temp = tempfile::TempDir::new().unwrap();
    let run_dir = temp.path().join("artifacts").join("run-4");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(
        run_dir.join("final.json"),
        json!({"url": URL, "status": "error", "captured_at": "yesterday"}).to_string(),
    )
    .unwrap();
    let stub = Stub::new(vec![Ok("done")]);

    let outcome = service(&stub)
        .run_once(
            &skill_request(temp.path(), None, Some("run-4")),
            &CancellationToken::new(),
        )
        .await;

    let err = outcome.error.expect("error");
    assert!(matches!(err, CrawlError::Artifact { .. }), "{err}");
    let result = &outcome.result;
    assert_eq!(result.status(), Some("error"));
    assert!(
        result
            .get_str("error")
            .is_some_and(|err| err.contains("status error")),
        "{:?}",
        result.get("error")
    );
    let captured_at = result.get_str("captured_at").unwrap();
    assert!(
        chrono::DateTime::parse_from_rfc3339(captured_at).is_ok(),
        "{captured_at}"
    );
    assert!(product_miner::contract::validate(result).is_ok());
}

#[tokio::test]
async fn cancellation_kills_the_agent_and_records_the_error() {
    let temp = tempfile::TempDir::new().unwrap();
    let script = temp.path().join("codex.sh");
    fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
    make_executable(&script);
    let adapter: Arc<dyn ToolAdapter> = Arc::new(CodexAdapter::new(CodexConfig {
        bin: script.to_string_lossy().into_owned(),
        model: None,
        skip_git_repo_check: true,
        work_dir: None,
        timeout: Duration::from_secs(60),
    }));
    let service =
        CrawlService::new(AdapterRegistry::new(vec![adapter]).unwrap()).with_env(|_| None);

    let out_dir = temp.path().join("out");
    let request = CrawlRequest {
        tool: Some("codex".to_owned()),
        ..legacy_request(&out_dir)
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = service.run_once(&request, &cancel).await;

    assert!(started.elapsed() < Duration::from_secs(20));
    let err = outcome.error.expect("error");
    assert!(matches!(err, CrawlError::Execution { .. }), "{err}");
    assert!(err.to_string().contains("cancelled"), "{err}");
    assert_eq!(outcome.result.status(), Some("error"));

    let path = outcome.artifact_path.expect("error record path");
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["status"], "error");
    assert_eq!(written["tool"], "codex");
}

#[tokio::test]
async fn missing_final_record_names_the_expected_path() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![Ok("all done, see artifacts")]);

    let outcome = service(&stub)
        .run_once(
            &skill_request(temp.path(), None, Some("run-3")),
            &CancellationToken::new(),
        )
        .await;

    let err = outcome.error.expect("error");
    assert!(matches!(err, CrawlError::Artifact { .. }), "{err}");
    assert!(
        err.to_string()
            .contains(&format!("artifacts{}run-3", std::path::MAIN_SEPARATOR)),
        "{err}"
    );
}

#[tokio::test]
async fn snapshot_pointer_is_joined_from_run_dir() {
    let temp = tempfile::TempDir::new().unwrap();
    let run_dir = temp.path().join("artifacts").join("snap-1");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(
        run_dir.join("page_state.json"),
        r#"{"extracted":{"title":"Kettle","description":"1L","currency":"TWD","price":"890"}}"#,
    )
    .unwrap();
    fs::write(
        run_dir.join("overlay_images.json"),
        r#"["https://img/a","https://img/b"]"#,
    )
    .unwrap();
    fs::write(
        run_dir.join("variations.json"),
        r#"[{"position":0,"text":"White"}]"#,
    )
    .unwrap();
    fs::write(
        run_dir.join("variation_image_map.json"),
        r#"[{"text":"White","imageUrl":"https://img/white"}]"#,
    )
    .unwrap();

    let pointer = json!({
        "url": URL,
        "status": "ok",
        "run_id": "snap-1",
        "snapshot_files": {
            "page_state": "page_state.json",
            "overlay_images": "overlay_images.json",
            "variations": "variations.json",
            "variation_image_map": "variation_image_map.json",
        },
    });
    let answer = format!("Snapshot saved. {pointer}");
    let stub = Stub::new(vec![Ok(answer.as_str())]);

    let outcome = service(&stub)
        .run_once(
            &skill_request(temp.path(), Some("shopee-page-snapshot"), None),
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.is_ok(), "{:?}", outcome.error);
    let result = &outcome.result;
    assert_eq!(result.get_str("title"), Some("Kettle"));
    assert_eq!(result.get_str("result_source"), Some("artifact_snapshot"));
    assert_eq!(result.get_str("run_id"), Some("snap-1"));
    assert_eq!(
        result.get("images"),
        Some(&json!(["https://img/a", "https://img/b"]))
    );
    assert_eq!(
        result.get("variations"),
        Some(&json!([{
            "title": "White",
            "position": 0,
            "image": "https://img/white",
            "images": ["https://img/white"],
        }]))
    );
    assert!(outcome.artifact_path.is_none());
}

#[tokio::test]
async fn unsupported_skill_never_runs_the_tool() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![Ok("{}")]);

    let outcome = service(&stub)
        .run_once(
            &skill_request(temp.path(), Some("shopee-product-crawler"), Some("r1")),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(stub.calls(), 0);
    let err = outcome.error.expect("error");
    assert!(matches!(err, CrawlError::Input(_)), "{err}");
    assert!(err.to_string().contains("shopee-orchestrator-pipeline"), "{err}");
}

#[tokio::test]
async fn unsupported_source_and_tool_are_input_errors() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![]);

    let mut request = legacy_request(temp.path());
    request.url = "https://example.com/item".to_owned();
    let outcome = service(&stub)
        .run_once(&request, &CancellationToken::new())
        .await;
    assert!(matches!(outcome.error, Some(CrawlError::Input(_))));
    assert_eq!(outcome.result.get_str("tool"), Some("stub"));

    let mut request = legacy_request(temp.path());
    request.tool = Some("claude".to_owned());
    let outcome = service(&stub)
        .run_once(&request, &CancellationToken::new())
        .await;
    let err = outcome.error.expect("error");
    assert!(err.to_string().contains("available: stub"), "{err}");
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn failed_auth_check_is_recorded_not_fatal() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::failing_auth(vec![Ok(
        r#"{"url":"https://shopee.tw/product/1/2","status":"ok"}"#,
    )]);

    let outcome = service(&stub)
        .run_once(&legacy_request(temp.path()), &CancellationToken::new())
        .await;

    assert!(outcome.is_ok(), "{:?}", outcome.error);
    assert_eq!(
        outcome.result.get_str("auth_check_error"),
        Some("not logged in")
    );
}

#[tokio::test]
async fn invalid_request_is_rejected_without_output() {
    let temp = tempfile::TempDir::new().unwrap();
    let stub = Stub::new(vec![]);
    let request = CrawlRequest {
        run_id: Some("../escape".to_owned()),
        ..skill_request(temp.path(), None, None)
    };

    let outcome = service(&stub)
        .run_once(&request, &CancellationToken::new())
        .await;

    assert!(matches!(outcome.error, Some(CrawlError::Input(_))));
    assert_eq!(outcome.result.status(), Some("error"));
    assert!(outcome.artifact_path.is_none());
}

fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt as _;
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}
