//! The six concrete stage executors.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::executor::{ExecutorRegistry, StageContext, StageExecutor, StageOutcome};
use super::models::{PipelineRun, StageName, StageStatus};
use crate::ai::TextGenerator;
use crate::ai::prompts::{DECOMPOSITION_SYSTEM_PROMPT, PRD_SYSTEM_PROMPT, code_system_prompt};
use crate::config::BizimatchToml;
use crate::errors::StageError;

/// Settings the stage executors need, taken from the loaded config once.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub language: String,
    pub max_tokens: u32,
    pub test_command: Option<String>,
    pub test_timeout: Duration,
    pub workspace_dir: PathBuf,
    pub deploy_dir: PathBuf,
}

impl StageSettings {
    pub fn from_toml(toml: &BizimatchToml) -> Self {
        Self {
            language: toml.generation.language.clone(),
            max_tokens: toml.ai.max_tokens,
            test_command: toml.testing.command.clone(),
            test_timeout: Duration::from_secs(toml.testing.timeout_secs),
            workspace_dir: toml.testing.workspace_dir.clone(),
            deploy_dir: toml.deploy.output_dir.clone(),
        }
    }
}

impl ExecutorRegistry {
    /// Registry with the standard executor for every stage.
    pub fn standard(generator: Arc<dyn TextGenerator>, settings: StageSettings) -> Self {
        let settings = Arc::new(settings);
        ExecutorRegistry::new()
            .with(Arc::new(PrdGenerationExecutor::new(generator.clone(), settings.clone())))
            .with(Arc::new(TaskDecompositionExecutor::new(generator.clone(), settings.clone())))
            .with(Arc::new(CodeGenerationExecutor::new(generator, settings.clone())))
            .with(Arc::new(TestingExecutor::new(settings.clone())))
            .with(Arc::new(ReviewGateExecutor))
            .with(Arc::new(DeploymentExecutor::new(settings)))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

fn require_output(run: &PipelineRun, stage: StageName) -> Result<&Value, StageError> {
    run.latest_output(stage).ok_or_else(|| {
        StageError::Precondition(format!("missing output of stage '{}'", stage))
    })
}

fn require_str<'a>(value: &'a Value, stage: StageName, key: &str) -> Result<&'a str, StageError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            StageError::Precondition(format!("stage '{}' output has no '{}'", stage, key))
        })
}

fn require_tasks(run: &PipelineRun) -> Result<Vec<Task>, StageError> {
    let output = require_output(run, StageName::TaskDecomposition)?;
    let tasks: Vec<Task> = output
        .get("tasks")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StageError::Precondition(format!("invalid task list: {}", e)))?
        .unwrap_or_default();
    if tasks.is_empty() {
        return Err(StageError::Precondition("task list is empty".to_string()));
    }
    Ok(tasks)
}

/// File extension for generated code in `language`.
pub fn extension_for(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "python" => "py",
        "rust" => "rs",
        "typescript" => "ts",
        "javascript" => "js",
        "go" => "go",
        "java" => "java",
        "ruby" => "rb",
        _ => "txt",
    }
}

/// Body of the first fenced code block, or the whole text when unfenced.
pub fn extract_code(text: &str) -> String {
    let Some(start) = text.find("```") else {
        return text.trim().to_string();
    };
    let after_fence = &text[start + 3..];
    // Skip the info string (e.g. "python") on the opening fence line
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

fn code_file_name(language: &str) -> String {
    format!("main.{}", extension_for(language))
}

/// Write the generated code into `dir`, overwriting any previous copy.
async fn materialize_code(dir: &Path, language: &str, code: &str) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(code_file_name(language));
    tokio::fs::write(&path, extract_code(code))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

// ── PRD generation ────────────────────────────────────────────────────

pub struct PrdGenerationExecutor {
    generator: Arc<dyn TextGenerator>,
    settings: Arc<StageSettings>,
}

impl PrdGenerationExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: Arc<StageSettings>) -> Self {
        Self { generator, settings }
    }
}

#[async_trait]
impl StageExecutor for PrdGenerationExecutor {
    fn stage(&self) -> StageName {
        StageName::PrdGeneration
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        _ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        if run.original_prompt.trim().is_empty() {
            return Err(StageError::Precondition("prompt is empty".to_string()));
        }
        let prd = self
            .generator
            .generate(&run.original_prompt, PRD_SYSTEM_PROMPT, self.settings.max_tokens)
            .await?;
        Ok(StageOutcome::Completed(json!({ "prd": prd })))
    }
}

// ── Task decomposition ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TaskList {
    #[serde(default)]
    tasks: Vec<Task>,
}

impl TaskList {
    /// Parse a JSON task list, tolerating prose or code fences around it.
    fn parse(text: &str) -> anyhow::Result<Self> {
        let cleaned = match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if start < end => &text[start..=end],
            _ => text,
        };
        serde_json::from_str(cleaned).context("Failed to parse task list as JSON")
    }
}

pub struct TaskDecompositionExecutor {
    generator: Arc<dyn TextGenerator>,
    settings: Arc<StageSettings>,
}

impl TaskDecompositionExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: Arc<StageSettings>) -> Self {
        Self { generator, settings }
    }

    fn fallback(prd: &str) -> Vec<Task> {
        vec![Task {
            title: "Implement the product requirements".to_string(),
            description: prd.to_string(),
        }]
    }
}

#[async_trait]
impl StageExecutor for TaskDecompositionExecutor {
    fn stage(&self) -> StageName {
        StageName::TaskDecomposition
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        _ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let prd_output = require_output(run, StageName::PrdGeneration)?;
        let prd = require_str(prd_output, StageName::PrdGeneration, "prd")?;

        let response = self
            .generator
            .generate(prd, DECOMPOSITION_SYSTEM_PROMPT, self.settings.max_tokens)
            .await?;

        let (tasks, fallback) = match TaskList::parse(&response) {
            Ok(list) if !list.tasks.is_empty() => (list.tasks, false),
            Ok(_) => (Self::fallback(prd), true),
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, error = %e, "unparsable task list, using single-task fallback");
                (Self::fallback(prd), true)
            }
        };
        Ok(StageOutcome::Completed(json!({ "tasks": tasks, "fallback": fallback })))
    }
}

// ── Code generation ───────────────────────────────────────────────────

pub struct CodeGenerationExecutor {
    generator: Arc<dyn TextGenerator>,
    settings: Arc<StageSettings>,
}

impl CodeGenerationExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: Arc<StageSettings>) -> Self {
        Self { generator, settings }
    }

    fn build_prompt(run: &PipelineRun, prd: &str, tasks: &[Task]) -> String {
        let task_lines: Vec<String> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {}: {}", i + 1, t.title, t.description))
            .collect();
        format!(
            "Implement the following product.\n\n\
             ## Original request\n{}\n\n\
             ## Product requirements\n{}\n\n\
             ## Tasks\n{}\n",
            run.original_prompt,
            prd,
            task_lines.join("\n"),
        )
    }
}

#[async_trait]
impl StageExecutor for CodeGenerationExecutor {
    fn stage(&self) -> StageName {
        StageName::CodeGeneration
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        _ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let prd_output = require_output(run, StageName::PrdGeneration)?;
        let prd = require_str(prd_output, StageName::PrdGeneration, "prd")?;
        let tasks = require_tasks(run)?;

        let language = &self.settings.language;
        let code = self
            .generator
            .generate(
                &Self::build_prompt(run, prd, &tasks),
                &code_system_prompt(language),
                self.settings.max_tokens,
            )
            .await?;
        Ok(StageOutcome::Completed(json!({
            "language": language,
            "code": code,
        })))
    }
}

// ── Testing ───────────────────────────────────────────────────────────

pub struct TestingExecutor {
    settings: Arc<StageSettings>,
}

impl TestingExecutor {
    pub fn new(settings: Arc<StageSettings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl StageExecutor for TestingExecutor {
    fn stage(&self) -> StageName {
        StageName::Testing
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let code_output = require_output(run, StageName::CodeGeneration)?;
        let code = require_str(code_output, StageName::CodeGeneration, "code")?;
        let language = code_output
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or(&self.settings.language);

        let Some(command) = self.settings.test_command.as_deref() else {
            return Ok(StageOutcome::Skipped("no test command configured".to_string()));
        };

        let workspace = self.settings.workspace_dir.join(&run.run_id);
        materialize_code(&workspace, language, code)
            .await
            .map_err(|e| StageError::Execution(format!("{:#}", e)))?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", command])
            .current_dir(&workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.output();

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(StageError::Execution("test run cancelled".to_string()));
            }
            result = tokio::time::timeout(self.settings.test_timeout, child) => match result {
                Err(_) => {
                    return Err(StageError::Execution(format!(
                        "test command timed out after {}s",
                        self.settings.test_timeout.as_secs()
                    )));
                }
                Ok(Err(e)) => {
                    return Err(StageError::Execution(format!("failed to spawn test command: {}", e)));
                }
                Ok(Ok(output)) => output,
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(StageError::Execution(format!(
                "test command exited with {}: {}",
                output.status.code().map_or("signal".to_string(), |c| c.to_string()),
                tail(&format!("{}{}", stdout, stderr), 2000).trim()
            )));
        }

        Ok(StageOutcome::Completed(json!({
            "command": command,
            "exit_code": 0,
            "output": tail(&stdout, 2000),
        })))
    }
}

// ── Review gate ───────────────────────────────────────────────────────

/// Parks the run until someone approves or rejects it.
pub struct ReviewGateExecutor;

#[async_trait]
impl StageExecutor for ReviewGateExecutor {
    fn stage(&self) -> StageName {
        StageName::Review
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        _ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let code_output = require_output(run, StageName::CodeGeneration)?;
        let task_count = run
            .latest_output(StageName::TaskDecomposition)
            .and_then(|o| o.get("tasks"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let testing = run
            .latest_result(StageName::Testing)
            .map_or(StageStatus::Pending, |r| r.status);

        Ok(StageOutcome::AwaitingApproval(json!({
            "summary": {
                "tasks": task_count,
                "language": code_output.get("language").cloned().unwrap_or(Value::Null),
                "testing": testing,
            },
            "message": "Review the generated code, then approve or reject this run.",
        })))
    }
}

// ── Deployment ────────────────────────────────────────────────────────

/// Publishes the run's artifacts to `deploy_dir/<run_id>/`.
pub struct DeploymentExecutor {
    settings: Arc<StageSettings>,
}

impl DeploymentExecutor {
    pub fn new(settings: Arc<StageSettings>) -> Self {
        Self { settings }
    }

    async fn publish(&self, run: &PipelineRun, prd: &str, code_output: &Value) -> anyhow::Result<Value> {
        let dir = self.settings.deploy_dir.join(&run.run_id);
        let code = code_output.get("code").and_then(Value::as_str).unwrap_or_default();
        let language = code_output
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or(&self.settings.language);

        let code_path = materialize_code(&dir, language, code).await?;
        let mut files = vec![code_path];

        let writes = [
            ("PRD.md", prd.to_string()),
            ("GENERATED.md", code.to_string()),
            (
                "tasks.json",
                serde_json::to_string_pretty(
                    run.latest_output(StageName::TaskDecomposition)
                        .and_then(|o| o.get("tasks"))
                        .unwrap_or(&Value::Null),
                )?,
            ),
            (
                "run.json",
                serde_json::to_string_pretty(&json!({
                    "run_id": run.run_id,
                    "prompt": run.original_prompt,
                    "language": language,
                    "created_at": run.created_at,
                }))?,
            ),
        ];
        for (name, content) in writes {
            let path = dir.join(name);
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            files.push(path);
        }

        let files: Vec<String> = files
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        Ok(json!({ "path": dir.to_string_lossy(), "files": files }))
    }
}

#[async_trait]
impl StageExecutor for DeploymentExecutor {
    fn stage(&self) -> StageName {
        StageName::Deployment
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        _ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let review_passed = run
            .latest_result(StageName::Review)
            .is_some_and(|r| r.status.is_complete());
        if !review_passed {
            return Err(StageError::Precondition("review has not been approved".to_string()));
        }
        let prd_output = require_output(run, StageName::PrdGeneration)?;
        let prd = require_str(prd_output, StageName::PrdGeneration, "prd")?;
        let code_output = require_output(run, StageName::CodeGeneration)?;
        require_str(code_output, StageName::CodeGeneration, "code")?;

        let published = self
            .publish(run, prd, code_output)
            .await
            .map_err(|e| StageError::Execution(format!("{:#}", e)))?;
        Ok(StageOutcome::Completed(published))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::errors::AiError;
    use crate::pipeline::models::{ActiveAttempt, StageResult};
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Returns canned responses in order and records the system prompts it saw.
    struct ScriptedGenerator {
        responses: Mutex<Vec<Result<String, AiError>>>,
        systems: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<String, AiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                systems: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str, system: &str, _max: u32) -> Result<String, AiError> {
            self.systems.lock().unwrap().push(system.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(AiError::EmptyResponse))
        }
    }

    fn settings(dir: &TempDir, test_command: Option<&str>) -> Arc<StageSettings> {
        Arc::new(StageSettings {
            language: "python".to_string(),
            max_tokens: 100,
            test_command: test_command.map(str::to_string),
            test_timeout: Duration::from_secs(10),
            workspace_dir: dir.path().join("ws"),
            deploy_dir: dir.path().join("deploy"),
        })
    }

    fn ctx() -> StageContext {
        StageContext::new(1, CancellationToken::new())
    }

    fn record(run: &mut PipelineRun, stage: StageName, output: Value) {
        let attempt = ActiveAttempt {
            stage,
            attempt: 1,
            started_at: Utc::now(),
        };
        run.record(StageResult::succeeded(&attempt, output));
    }

    fn run_with_code() -> PipelineRun {
        let mut run = PipelineRun::new("Build a todo app", PipelineConfig::default());
        record(&mut run, StageName::PrdGeneration, json!({"prd": "# Todo PRD"}));
        record(
            &mut run,
            StageName::TaskDecomposition,
            json!({"tasks": [{"title": "Model", "description": "Todo struct"}], "fallback": false}),
        );
        record(
            &mut run,
            StageName::CodeGeneration,
            json!({"language": "python", "code": "```python\nprint('todo')\n```"}),
        );
        run
    }

    #[test]
    fn test_extract_code_fenced_and_plain() {
        assert_eq!(extract_code("```python\nprint(1)\n```\ntrailing"), "print(1)");
        assert_eq!(extract_code("intro\n```\nx = 2\n```"), "x = 2");
        assert_eq!(extract_code("  plain text  "), "plain text");
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("Python"), "py");
        assert_eq!(extension_for("rust"), "rs");
        assert_eq!(extension_for("cobol"), "txt");
    }

    #[test]
    fn test_task_list_parse_tolerates_fences() {
        let list = TaskList::parse(
            "Here you go:\n```json\n{\"tasks\": [{\"title\": \"A\", \"description\": \"do a\"}]}\n```",
        )
        .unwrap();
        assert_eq!(list.tasks.len(), 1);
        assert_eq!(list.tasks[0].title, "A");
        assert!(TaskList::parse("no json here").is_err());
    }

    #[tokio::test]
    async fn test_prd_generation_uses_prd_prompt() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new(vec![Ok("# PRD".to_string())]);
        let exec = PrdGenerationExecutor::new(generator.clone(), settings(&dir, None));
        let run = PipelineRun::new("Build a todo app", PipelineConfig::default());

        let outcome = exec.execute(&run, &ctx()).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed(json!({"prd": "# PRD"})));
        assert_eq!(generator.systems.lock().unwrap()[0], PRD_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn test_prd_generation_service_error_is_transient() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new(vec![Err(AiError::RateLimited)]);
        let exec = PrdGenerationExecutor::new(generator, settings(&dir, None));
        let run = PipelineRun::new("Build a todo app", PipelineConfig::default());

        let err = exec.execute(&run, &ctx()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_decomposition_requires_prd() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new(vec![]);
        let exec = TaskDecompositionExecutor::new(generator.clone(), settings(&dir, None));
        let run = PipelineRun::new("Build a todo app", PipelineConfig::default());

        let err = exec.execute(&run, &ctx()).await.unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
        assert!(generator.systems.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decomposition_parses_and_falls_back() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new(vec![
            Ok(r#"{"tasks": [{"title": "API", "description": "CRUD"}, {"title": "UI"}]}"#.to_string()),
            Ok("I could not produce JSON".to_string()),
        ]);
        let exec = TaskDecompositionExecutor::new(generator, settings(&dir, None));
        let mut run = PipelineRun::new("Build a todo app", PipelineConfig::default());
        record(&mut run, StageName::PrdGeneration, json!({"prd": "# Todo PRD"}));

        let StageOutcome::Completed(first) = exec.execute(&run, &ctx()).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(first["tasks"].as_array().unwrap().len(), 2);
        assert_eq!(first["tasks"][1]["description"], "");
        assert_eq!(first["fallback"], false);

        let StageOutcome::Completed(second) = exec.execute(&run, &ctx()).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(second["fallback"], true);
        assert_eq!(second["tasks"][0]["description"], "# Todo PRD");
    }

    #[tokio::test]
    async fn test_code_generation_requires_tasks() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new(vec![Ok("code".to_string())]);
        let exec = CodeGenerationExecutor::new(generator, settings(&dir, None));
        let mut run = PipelineRun::new("Build a todo app", PipelineConfig::default());
        record(&mut run, StageName::PrdGeneration, json!({"prd": "# Todo PRD"}));

        let err = exec.execute(&run, &ctx()).await.unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_code_generation_uses_language_prompt() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new(vec![Ok("print('hi')".to_string())]);
        let exec = CodeGenerationExecutor::new(generator.clone(), settings(&dir, None));
        let run = run_with_code();

        let outcome = exec.execute(&run, &ctx()).await.unwrap();
        assert_eq!(
            outcome,
            StageOutcome::Completed(json!({"language": "python", "code": "print('hi')"}))
        );
        assert!(generator.systems.lock().unwrap()[0].contains("expert python developer"));
    }

    #[tokio::test]
    async fn test_testing_skipped_without_command() {
        let dir = TempDir::new().unwrap();
        let exec = TestingExecutor::new(settings(&dir, None));
        let outcome = exec.execute(&run_with_code(), &ctx()).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_testing_runs_command_in_workspace() {
        let dir = TempDir::new().unwrap();
        let exec = TestingExecutor::new(settings(&dir, Some("test -f main.py && echo ok")));
        let run = run_with_code();

        let StageOutcome::Completed(output) = exec.execute(&run, &ctx()).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(output["exit_code"], 0);
        assert!(output["output"].as_str().unwrap().contains("ok"));
        let written = std::fs::read_to_string(dir.path().join("ws").join(&run.run_id).join("main.py")).unwrap();
        assert_eq!(written, "print('todo')");
    }

    #[tokio::test]
    async fn test_testing_failure_is_execution_error() {
        let dir = TempDir::new().unwrap();
        let exec = TestingExecutor::new(settings(&dir, Some("echo boom >&2; exit 3")));
        let err = exec.execute(&run_with_code(), &ctx()).await.unwrap_err();
        match err {
            StageError::Execution(msg) => {
                assert!(msg.contains("exited with 3"));
                assert!(msg.contains("boom"));
            }
            other => panic!("expected Execution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_testing_observes_cancellation() {
        let dir = TempDir::new().unwrap();
        let exec = TestingExecutor::new(settings(&dir, Some("sleep 30")));
        let token = CancellationToken::new();
        token.cancel();
        let err = exec
            .execute(&run_with_code(), &StageContext::new(1, token))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_review_gate_awaits_approval() {
        let outcome = ReviewGateExecutor.execute(&run_with_code(), &ctx()).await.unwrap();
        let StageOutcome::AwaitingApproval(payload) = outcome else {
            panic!("expected AwaitingApproval");
        };
        assert_eq!(payload["summary"]["tasks"], 1);
        assert_eq!(payload["summary"]["language"], "python");
        assert_eq!(payload["summary"]["testing"], "pending");
    }

    #[tokio::test]
    async fn test_deployment_requires_approved_review() {
        let dir = TempDir::new().unwrap();
        let exec = DeploymentExecutor::new(settings(&dir, None));
        let err = exec.execute(&run_with_code(), &ctx()).await.unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_deployment_publishes_artifacts_idempotently() {
        let dir = TempDir::new().unwrap();
        let exec = DeploymentExecutor::new(settings(&dir, None));
        let mut run = run_with_code();
        record(&mut run, StageName::Review, json!({"decision": "approve"}));

        let first = exec.execute(&run, &ctx()).await.unwrap();
        let second = exec.execute(&run, &ctx()).await.unwrap();
        assert_eq!(first, second);

        let out = dir.path().join("deploy").join(&run.run_id);
        assert_eq!(std::fs::read_to_string(out.join("PRD.md")).unwrap(), "# Todo PRD");
        assert_eq!(std::fs::read_to_string(out.join("main.py")).unwrap(), "print('todo')");
        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("run.json")).unwrap()).unwrap();
        assert_eq!(manifest["prompt"], "Build a todo app");
        let StageOutcome::Completed(output) = first else {
            panic!("expected Completed");
        };
        assert_eq!(output["files"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_standard_registry_covers_every_stage() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptedGenerator::new(vec![]);
        let registry = ExecutorRegistry::standard(generator, (*settings(&dir, None)).clone());
        assert!(registry.missing().is_empty());
    }
}
