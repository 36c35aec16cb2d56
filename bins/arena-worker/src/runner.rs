//! Language Runners - turn a submitted source file into something runnable
//!
//! Each runner has two phases. `prepare` stages the source into the run's
//! workspace (and compiles it, for compiled languages) exactly once per
//! grading run; `execute` runs the prepared program against one stdin.
//!
//! Where the program runs is decided by the worker's `Backend`, which is
//! probed once at startup rather than per call.

use crate::config::{LanguageConfig, LanguageConfigManager, WorkerConfig};
use crate::sandbox::{
    sandbox_path, ExecOutput, LocalProcess, LocalRequest, Sandbox, SandboxError, SandboxPolicy,
    SandboxRequest, DockerSandbox,
};
use arena_common::types::Language;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("timeout")]
    Timeout,
    #[error("compilation failed")]
    Compile { diagnostics: String },
    #[error("unsupported language")]
    UnsupportedLanguage,
    #[error("{0}")]
    Sandbox(SandboxError),
    #[error("failed to stage submission: {0}")]
    Stage(#[from] std::io::Error),
    #[error("runner panicked: {0}")]
    Panic(String),
}

impl From<SandboxError> for RunError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout(_) => RunError::Timeout,
            other => RunError::Sandbox(other),
        }
    }
}

/// One process invocation, described for both execution paths
#[derive(Debug, Clone, Copy)]
pub struct Step<'a> {
    pub image: &'a str,
    pub sandbox_command: &'a str,
    pub local_program: &'a Path,
    pub local_args: &'a [String],
    pub workdir: &'a Path,
    pub stdin: Option<&'a str>,
    pub timeout: Duration,
    pub local_timeout: Duration,
}

/// Where programs run, decided once per worker
pub struct Backend {
    sandbox: Option<Arc<dyn Sandbox>>,
    local: LocalProcess,
    local_fallback: bool,
}

impl Backend {
    pub fn sandboxed(sandbox: Arc<dyn Sandbox>, local_fallback: bool) -> Self {
        Self {
            sandbox: Some(sandbox),
            local: LocalProcess,
            local_fallback,
        }
    }

    /// No isolation at all. Trusted/dev environments only.
    pub fn local_only() -> Self {
        Self {
            sandbox: None,
            local: LocalProcess,
            local_fallback: true,
        }
    }

    /// Probe the isolation backend and settle on an execution mode
    pub async fn probe(config: &WorkerConfig, policy: SandboxPolicy) -> Result<Self, SandboxError> {
        if config.force_local {
            warn!("ARENA_FORCE_LOCAL is set: submissions run WITHOUT isolation");
            return Ok(Self::local_only());
        }

        match DockerSandbox::connect(policy).await {
            Ok(sandbox) => Ok(Self::sandboxed(Arc::new(sandbox), config.local_fallback)),
            Err(e) if config.local_fallback => {
                warn!(
                    error = %e,
                    "Sandbox unavailable: falling back to local execution WITHOUT isolation"
                );
                Ok(Self::local_only())
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandbox.is_some()
    }

    pub async fn exec(&self, step: Step<'_>) -> Result<ExecOutput, SandboxError> {
        if let Some(sandbox) = &self.sandbox {
            match self.exec_sandboxed(sandbox.as_ref(), &step).await {
                Err(SandboxError::IsolationUnavailable(reason)) if self.local_fallback => {
                    warn!(reason = %reason, "Sandbox became unavailable, running locally");
                }
                other => return other,
            }
        }

        self.local
            .run(LocalRequest {
                program: step.local_program,
                args: step.local_args,
                workdir: step.workdir,
                stdin: step.stdin,
                timeout: step.local_timeout,
            })
            .await
    }

    async fn exec_sandboxed(
        &self,
        sandbox: &dyn Sandbox,
        step: &Step<'_>,
    ) -> Result<ExecOutput, SandboxError> {
        // stdin reaches the container as a file in the mounted workspace
        let stdin_file = match step.stdin {
            Some(data) => {
                let name = format!("stdin-{}.txt", uuid::Uuid::new_v4().simple());
                tokio::fs::write(step.workdir.join(&name), data).await?;
                Some(name)
            }
            None => None,
        };

        let command = match &stdin_file {
            Some(name) => format!("{} < {}", step.sandbox_command, sandbox_path(name)),
            None => step.sandbox_command.to_string(),
        };

        let result = sandbox
            .run(SandboxRequest {
                image: step.image,
                command: &command,
                workdir: step.workdir,
                timeout: step.timeout,
            })
            .await;

        if let Some(name) = stdin_file {
            let _ = tokio::fs::remove_file(step.workdir.join(name)).await;
        }

        result
    }
}

/// A staged (and, if needed, compiled) submission ready to run
#[derive(Debug, Clone)]
pub struct Program {
    pub image: String,
    pub sandbox_command: String,
    pub local_program: PathBuf,
    pub local_args: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub local_timeout: Duration,
}

impl Program {
    fn step<'a>(&'a self, stdin: Option<&'a str>) -> Step<'a> {
        Step {
            image: &self.image,
            sandbox_command: &self.sandbox_command,
            local_program: &self.local_program,
            local_args: &self.local_args,
            workdir: &self.workdir,
            stdin,
            timeout: self.timeout,
            local_timeout: self.local_timeout,
        }
    }
}

#[async_trait]
pub trait LanguageRunner: Send + Sync {
    /// Stage `source` into `workdir`; compiled languages also build here
    async fn prepare(&self, source: &Path, workdir: &Path) -> Result<Program, RunError>;

    /// Run a prepared program with `stdin`
    async fn execute(&self, program: &Program, stdin: &str) -> Result<ExecOutput, RunError>;
}

/// Copy the submission into the workspace under a fixed, shell-safe name
async fn stage_source(source: &Path, workdir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let staged = workdir.join(file_name);
    tokio::fs::copy(source, &staged).await?;
    Ok(staged)
}

/// Interpreted runner: the interpreter reads the staged file directly
pub struct PythonRunner {
    backend: Arc<Backend>,
    config: LanguageConfig,
}

impl PythonRunner {
    const SOURCE_NAME: &'static str = "main.py";

    pub fn new(backend: Arc<Backend>, config: LanguageConfig) -> Self {
        Self { backend, config }
    }
}

#[async_trait]
impl LanguageRunner for PythonRunner {
    async fn prepare(&self, source: &Path, workdir: &Path) -> Result<Program, RunError> {
        let staged = stage_source(source, workdir, Self::SOURCE_NAME).await?;

        Ok(Program {
            image: self.config.image.clone(),
            sandbox_command: format!("python3 {}", sandbox_path(Self::SOURCE_NAME)),
            local_program: PathBuf::from("python3"),
            local_args: vec![staged.to_string_lossy().into_owned()],
            workdir: workdir.to_path_buf(),
            timeout: self.config.timeouts.run(),
            local_timeout: self.config.timeouts.local_run(),
        })
    }

    async fn execute(&self, program: &Program, stdin: &str) -> Result<ExecOutput, RunError> {
        Ok(self.backend.exec(program.step(Some(stdin))).await?)
    }
}

/// Compiled runner: build once in its own invocation, then run the artifact
pub struct CRunner {
    backend: Arc<Backend>,
    config: LanguageConfig,
}

impl CRunner {
    const SOURCE_NAME: &'static str = "main.c";
    const ARTIFACT_NAME: &'static str = "program";

    pub fn new(backend: Arc<Backend>, config: LanguageConfig) -> Self {
        Self { backend, config }
    }
}

#[async_trait]
impl LanguageRunner for CRunner {
    async fn prepare(&self, source: &Path, workdir: &Path) -> Result<Program, RunError> {
        let staged = stage_source(source, workdir, Self::SOURCE_NAME).await?;
        let artifact = workdir.join(Self::ARTIFACT_NAME);

        // never run a binary this compile did not produce
        if artifact.exists() {
            tokio::fs::remove_file(&artifact).await?;
        }

        let compile_command = format!(
            "gcc {} -o {}",
            sandbox_path(Self::SOURCE_NAME),
            sandbox_path(Self::ARTIFACT_NAME)
        );
        let compile_args = vec![
            staged.to_string_lossy().into_owned(),
            "-o".to_string(),
            artifact.to_string_lossy().into_owned(),
        ];

        let compiled = self
            .backend
            .exec(Step {
                image: &self.config.image,
                sandbox_command: &compile_command,
                local_program: Path::new("gcc"),
                local_args: &compile_args,
                workdir,
                stdin: None,
                timeout: self.config.timeouts.compile(),
                local_timeout: self.config.timeouts.local_compile(),
            })
            .await?;

        if !compiled.success() {
            let diagnostics = if compiled.stderr.is_empty() {
                compiled.stdout
            } else {
                compiled.stderr
            };
            debug!(exit_code = compiled.exit_code, "Compilation failed");
            return Err(RunError::Compile { diagnostics });
        }

        if !artifact.exists() {
            return Err(RunError::Compile {
                diagnostics: "compiler produced no executable".to_string(),
            });
        }

        debug!(compile_ms = compiled.execution_time_ms, "Compilation succeeded");

        Ok(Program {
            image: self.config.image.clone(),
            sandbox_command: sandbox_path(Self::ARTIFACT_NAME),
            local_program: artifact,
            local_args: Vec::new(),
            workdir: workdir.to_path_buf(),
            timeout: self.config.timeouts.run(),
            local_timeout: self.config.timeouts.local_run(),
        })
    }

    async fn execute(&self, program: &Program, stdin: &str) -> Result<ExecOutput, RunError> {
        Ok(self.backend.exec(program.step(Some(stdin))).await?)
    }
}

/// Runner per supported language; anything missing is unsupported
#[derive(Clone, Default)]
pub struct RunnerSet {
    runners: HashMap<Language, Arc<dyn LanguageRunner>>,
}

impl RunnerSet {
    pub fn from_config(manager: &LanguageConfigManager, backend: Arc<Backend>) -> Self {
        let mut set = Self::default();
        for (language, config) in manager.configs() {
            let runner: Arc<dyn LanguageRunner> = match language {
                Language::Python => Arc::new(PythonRunner::new(backend.clone(), config.clone())),
                Language::C => Arc::new(CRunner::new(backend.clone(), config.clone())),
                Language::Unsupported(name) => {
                    warn!(language = %name, "No runner for configured language");
                    continue;
                }
            };
            info!(
                language = %language,
                image = %config.image,
                sandboxed = backend.is_sandboxed(),
                "Runner registered"
            );
            set.runners.insert(language.clone(), runner);
        }
        set
    }

    pub fn with(mut self, language: Language, runner: Arc<dyn LanguageRunner>) -> Self {
        self.runners.insert(language, runner);
        self
    }

    pub fn get(&self, language: &Language) -> Option<Arc<dyn LanguageRunner>> {
        self.runners.get(language).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use std::sync::Mutex;

    type Handler = dyn Fn(&SandboxRequest<'_>) -> Result<ExecOutput, SandboxError> + Send + Sync;

    /// Sandbox double: records each command and the stdin file it saw
    struct FakeSandbox {
        handler: Box<Handler>,
        commands: Mutex<Vec<String>>,
        stdin_seen: Mutex<Vec<String>>,
    }

    impl FakeSandbox {
        fn new(
            handler: impl Fn(&SandboxRequest<'_>) -> Result<ExecOutput, SandboxError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                commands: Mutex::new(Vec::new()),
                stdin_seen: Mutex::new(Vec::new()),
            })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecOutput, SandboxError> {
            self.commands.lock().unwrap().push(request.command.to_string());
            for entry in std::fs::read_dir(request.workdir).unwrap() {
                let entry = entry.unwrap();
                if entry.file_name().to_string_lossy().starts_with("stdin-") {
                    let data = std::fs::read_to_string(entry.path()).unwrap();
                    self.stdin_seen.lock().unwrap().push(data);
                }
            }
            (self.handler)(&request)
        }
    }

    fn output(exit_code: i64, stdout: &str, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            execution_time_ms: 1,
        }
    }

    fn language_config(name: &str) -> LanguageConfig {
        LanguageConfig {
            name: name.to_string(),
            image: format!("test/{}:latest", name),
            timeouts: Timeouts {
                compile_secs: 12,
                local_compile_secs: 10,
                run_secs: 6,
                local_run_secs: 5,
            },
        }
    }

    fn sh_step<'a>(workdir: &'a Path, args: &'a [String], stdin: Option<&'a str>) -> Step<'a> {
        Step {
            image: "test/sh:latest",
            sandbox_command: "cat",
            local_program: Path::new("sh"),
            local_args: args,
            workdir,
            stdin,
            timeout: Duration::from_secs(5),
            local_timeout: Duration::from_secs(5),
        }
    }

    fn write_source(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_sandboxed_stdin_goes_through_workspace_file() {
        let sandbox = FakeSandbox::new(|_| Ok(output(0, "7\n", "")));
        let backend = Backend::sandboxed(sandbox.clone(), false);
        let workdir = tempfile::tempdir().unwrap();
        let args: Vec<String> = Vec::new();

        let out = backend
            .exec(sh_step(workdir.path(), &args, Some("3 4\n")))
            .await
            .unwrap();

        assert_eq!(out.stdout, "7\n");
        let commands = sandbox.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("cat < /work/stdin-"));
        assert_eq!(sandbox.stdin_seen.lock().unwrap().as_slice(), ["3 4\n"]);
        // removed after the call
        assert_eq!(std::fs::read_dir(workdir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_falls_back_to_local() {
        let sandbox = FakeSandbox::new(|_| {
            Err(SandboxError::IsolationUnavailable("daemon not running".to_string()))
        });
        let backend = Backend::sandboxed(sandbox.clone(), true);
        let workdir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "cat".to_string()];

        let out = backend
            .exec(sh_step(workdir.path(), &args, Some("hello")))
            .await
            .unwrap();

        assert_eq!(out.stdout, "hello");
        assert_eq!(sandbox.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_without_fallback_is_an_error() {
        let sandbox = FakeSandbox::new(|_| {
            Err(SandboxError::IsolationUnavailable("daemon not running".to_string()))
        });
        let backend = Backend::sandboxed(sandbox, false);
        let workdir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "cat".to_string()];

        let result = backend.exec(sh_step(workdir.path(), &args, Some("hello"))).await;

        assert!(matches!(result, Err(SandboxError::IsolationUnavailable(_))));
    }

    #[tokio::test]
    async fn test_sandbox_timeout_is_not_retried_locally() {
        let sandbox = FakeSandbox::new(|r| Err(SandboxError::Timeout(r.timeout)));
        let backend = Backend::sandboxed(sandbox.clone(), true);
        let workdir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "cat".to_string()];

        let result = backend.exec(sh_step(workdir.path(), &args, Some("x"))).await;

        assert!(matches!(result, Err(SandboxError::Timeout(_))));
        assert!(matches!(RunError::from(result.unwrap_err()), RunError::Timeout));
    }

    #[tokio::test]
    async fn test_python_prepare_stages_source_and_runs_interpreter() {
        let sandbox = FakeSandbox::new(|_| Ok(output(0, "7\n", "")));
        let backend = Arc::new(Backend::sandboxed(sandbox.clone(), false));
        let runner = PythonRunner::new(backend, language_config("python"));

        let uploads = tempfile::tempdir().unwrap();
        let source = write_source(uploads.path(), "submission_abc.py", "print(7)\n");
        let workdir = tempfile::tempdir().unwrap();

        let program = runner.prepare(&source, workdir.path()).await.unwrap();
        assert!(workdir.path().join("main.py").is_file());
        assert_eq!(program.image, "test/python:latest");
        assert_eq!(program.timeout, Duration::from_secs(6));

        let out = runner.execute(&program, "").await.unwrap();
        assert_eq!(out.stdout, "7\n");
        assert!(sandbox.commands()[0].starts_with("python3 /work/main.py < /work/stdin-"));
    }

    #[tokio::test]
    async fn test_c_compile_failure_skips_run_phase() {
        let sandbox = FakeSandbox::new(|_| Ok(output(1, "", "main.c:1: error: expected ';'")));
        let backend = Arc::new(Backend::sandboxed(sandbox.clone(), false));
        let runner = CRunner::new(backend, language_config("c"));

        let uploads = tempfile::tempdir().unwrap();
        let source = write_source(uploads.path(), "main.c", "int main( { }");
        let workdir = tempfile::tempdir().unwrap();

        let result = runner.prepare(&source, workdir.path()).await;

        match result {
            Err(RunError::Compile { diagnostics }) => {
                assert_eq!(diagnostics, "main.c:1: error: expected ';'")
            }
            other => panic!("expected compile error, got {:?}", other),
        }
        let commands = sandbox.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0], "gcc /work/main.c -o /work/program");
    }

    #[tokio::test]
    async fn test_c_compiles_then_runs_artifact() {
        let sandbox = FakeSandbox::new(|request| {
            if request.command.starts_with("gcc") {
                std::fs::write(request.workdir.join("program"), b"").unwrap();
                Ok(output(0, "", ""))
            } else {
                Ok(output(0, "42\n", ""))
            }
        });
        let backend = Arc::new(Backend::sandboxed(sandbox.clone(), false));
        let runner = CRunner::new(backend, language_config("c"));

        let uploads = tempfile::tempdir().unwrap();
        let source = write_source(uploads.path(), "main.c", "int main(){return 0;}");
        let workdir = tempfile::tempdir().unwrap();

        let program = runner.prepare(&source, workdir.path()).await.unwrap();
        assert_eq!(program.sandbox_command, "/work/program");

        let out = runner.execute(&program, "6 7").await.unwrap();
        assert_eq!(out.stdout, "42\n");

        let commands = sandbox.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[1].starts_with("/work/program < /work/stdin-"));
    }

    #[tokio::test]
    async fn test_c_removes_stale_artifact_before_compiling() {
        let sandbox = FakeSandbox::new(|_| Ok(output(0, "", "")));
        let backend = Arc::new(Backend::sandboxed(sandbox, false));
        let runner = CRunner::new(backend, language_config("c"));

        let uploads = tempfile::tempdir().unwrap();
        let source = write_source(uploads.path(), "main.c", "int main(){return 0;}");
        let workdir = tempfile::tempdir().unwrap();
        std::fs::write(workdir.path().join("program"), b"stale").unwrap();

        // compiler "succeeds" without writing a binary
        let result = runner.prepare(&source, workdir.path()).await;

        assert!(matches!(result, Err(RunError::Compile { .. })));
        assert!(!workdir.path().join("program").exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_a_staging_error() {
        let backend = Arc::new(Backend::local_only());
        let runner = PythonRunner::new(backend, language_config("python"));
        let workdir = tempfile::tempdir().unwrap();

        let result = runner
            .prepare(Path::new("/nonexistent/submission.py"), workdir.path())
            .await;

        assert!(matches!(result, Err(RunError::Stage(_))));
    }

    #[test]
    fn test_runner_set_from_builtin_config() {
        let manager = LanguageConfigManager::builtin();
        let runners = RunnerSet::from_config(&manager, Arc::new(Backend::local_only()));

        assert!(runners.get(&Language::Python).is_some());
        assert!(runners.get(&Language::C).is_some());
        assert!(runners.get(&Language::parse("Java")).is_none());
    }

    #[tokio::test]
    #[ignore] // Requires python3 on PATH
    async fn test_python_local_end_to_end() {
        let backend = Arc::new(Backend::local_only());
        let runner = PythonRunner::new(backend, language_config("python"));
        let uploads = tempfile::tempdir().unwrap();
        let source = write_source(uploads.path(), "main.py", "a, b = map(int, input().split())\nprint(a + b)\n");
        let workdir = tempfile::tempdir().unwrap();

        let program = runner.prepare(&source, workdir.path()).await.unwrap();
        let out = runner.execute(&program, "3 4\n").await.unwrap();
        assert_eq!(out.stdout.trim(), "7");
    }

    #[tokio::test]
    #[ignore] // Requires gcc on PATH
    async fn test_c_local_compile_error_carries_diagnostics() {
        let backend = Arc::new(Backend::local_only());
        let runner = CRunner::new(backend, language_config("c"));
        let uploads = tempfile::tempdir().unwrap();
        let source = write_source(uploads.path(), "main.c", "int main( { return 0 }");
        let workdir = tempfile::tempdir().unwrap();

        match runner.prepare(&source, workdir.path()).await {
            Err(RunError::Compile { diagnostics }) => assert!(diagnostics.contains("error")),
            other => panic!("expected compile error, got {:?}", other),
        }
    }
}
