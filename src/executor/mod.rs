//! Sandboxed execution of submitted programs.
//!
//! Every submission gets a throwaway working directory under the configured
//! work root. Python sources run under the interpreter directly; C++ sources
//! are compiled first. The run step is bounded by a wall-clock timeout, after
//! which the process is killed and reaped within a short grace period. The
//! working directory is removed whatever the outcome.
//!
//! Programs print their grid with each cell XOR-masked (see [`crate::shape`]);
//! the executor parses stdout and unmasks it before handing the shape back.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::shape::Shape;

const PYTHON_SOURCE: &str = "code.py";
const CPP_SOURCE: &str = "code.cpp";
const CPP_BINARY: &str = "code";

/// How long a killed process gets to be reaped before we stop waiting.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Submission languages accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
        }
    }
}

/// Terminal result of one submission run.
///
/// Infrastructure problems (missing interpreter, unwritable work root) are
/// folded into the failure variants, callers never see an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Program ran, exited zero and printed a well-formed grid. The shape
    /// is already unmasked.
    Success { shape: Shape, wall_time_ms: u64 },
    /// The C++ toolchain rejected the source or could not be launched.
    CompileFailure { diagnostics: String },
    /// Program exited non-zero or could not be started.
    RuntimeFailure {
        diagnostics: String,
        exit_code: Option<i32>,
    },
    /// Wall-clock limit exceeded; the process was killed.
    Timeout,
    /// Program exited zero but stdout was not a rectangular integer grid.
    ParseFailure { raw_output: String },
}

/// Runs untrusted submissions in per-run working directories.
#[derive(Debug, Clone)]
pub struct Executor {
    python_bin: String,
    cpp_compiler: String,
    work_root: PathBuf,
    timeout: Duration,
}

impl Executor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Executor {
            python_bin: config.python_bin.clone(),
            cpp_compiler: config.cpp_compiler.clone(),
            work_root: config.work_root.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Runs one submission start to finish and cleans up its directory.
    pub async fn execute(&self, source_code: &str, language: Language) -> ExecutionOutcome {
        let workdir = self.work_root.join(Uuid::new_v4().to_string());
        let outcome = self.execute_in(&workdir, source_code, language).await;
        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %workdir.display(), error = %e, "failed to remove submission workdir");
            }
        }
        outcome
    }

    async fn execute_in(
        &self,
        workdir: &Path,
        source_code: &str,
        language: Language,
    ) -> ExecutionOutcome {
        if let Err(e) = tokio::fs::create_dir_all(workdir).await {
            return infra_failure(format!("could not prepare working directory: {e}"));
        }
        // Relative work roots would confuse path resolution once the child
        // process runs with its cwd set to the workdir.
        let workdir = match tokio::fs::canonicalize(workdir).await {
            Ok(dir) => dir,
            Err(e) => return infra_failure(format!("could not resolve working directory: {e}")),
        };

        let command = match language {
            Language::Python => {
                let source = workdir.join(PYTHON_SOURCE);
                if let Err(e) = tokio::fs::write(&source, source_code).await {
                    return infra_failure(format!("could not write source file: {e}"));
                }
                let mut cmd = Command::new(&self.python_bin);
                cmd.arg(source).current_dir(&workdir);
                cmd
            }
            Language::Cpp => {
                let source = workdir.join(CPP_SOURCE);
                let binary = workdir.join(CPP_BINARY);
                if let Err(e) = tokio::fs::write(&source, source_code).await {
                    return infra_failure(format!("could not write source file: {e}"));
                }
                if let Err(outcome) = self.compile_cpp(&source, &binary).await {
                    return outcome;
                }
                let mut cmd = Command::new(&binary);
                cmd.current_dir(&workdir);
                cmd
            }
        };

        self.run_with_timeout(command).await
    }

    async fn compile_cpp(&self, source: &Path, binary: &Path) -> Result<(), ExecutionOutcome> {
        let output = Command::new(&self.cpp_compiler)
            .arg("-std=c++17")
            .arg("-O1")
            .arg("-pipe")
            .arg(source)
            .arg("-o")
            .arg(binary)
            .output()
            .await;
        match output {
            Err(e) => Err(ExecutionOutcome::CompileFailure {
                diagnostics: format!("could not launch {}: {e}", self.cpp_compiler),
            }),
            Ok(out) if !out.status.success() => Err(ExecutionOutcome::CompileFailure {
                diagnostics: String::from_utf8_lossy(&out.stderr).into_owned(),
            }),
            Ok(_) => Ok(()),
        }
    }

    async fn run_with_timeout(&self, mut command: Command) -> ExecutionOutcome {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return infra_failure(format!("could not start program: {e}")),
        };

        // Drain pipes in the background so a chatty program cannot block on
        // a full pipe buffer while we wait for it.
        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());
        let started = Instant::now();

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Err(_elapsed) => {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                return ExecutionOutcome::Timeout;
            }
            Ok(Err(e)) => return infra_failure(format!("could not wait for program: {e}")),
            Ok(Ok(status)) => status,
        };
        let wall_time_ms = started.elapsed().as_millis() as u64;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return ExecutionOutcome::RuntimeFailure {
                diagnostics: stderr,
                exit_code: status.code(),
            };
        }

        match Shape::parse_program_output(&stdout) {
            Ok(shape) => ExecutionOutcome::Success {
                shape: shape.unmasked(),
                wall_time_ms,
            },
            Err(e) => {
                debug!(error = %e, "program output is not a grid");
                ExecutionOutcome::ParseFailure { raw_output: stdout }
            }
        }
    }
}

fn infra_failure(diagnostics: String) -> ExecutionOutcome {
    ExecutionOutcome::RuntimeFailure {
        diagnostics,
        exit_code: None,
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::OBFUSCATION_KEY;

    /// Skips toolchain tests on machines without the binary installed.
    fn have(binary: &str) -> bool {
        std::process::Command::new("which")
            .arg(binary)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn test_executor(timeout_ms: u64) -> Executor {
        Executor::new(&ExecutorConfig {
            python_bin: "python3".into(),
            cpp_compiler: "g++".into(),
            work_root: std::env::temp_dir().join(format!("gridcode-exec-{}", Uuid::new_v4())),
            timeout_ms,
        })
    }

    fn masked_python_grid() -> String {
        format!(
            "k = {OBFUSCATION_KEY}\nfor row in [[1, 2], [3, 4]]:\n    print(' '.join(str(c ^ k) for c in row))\n"
        )
    }

    #[tokio::test]
    async fn python_output_is_unmasked_into_a_shape() {
        if !have("python3") {
            return;
        }
        let executor = test_executor(5_000);
        match executor.execute(&masked_python_grid(), Language::Python).await {
            ExecutionOutcome::Success {
                shape,
                wall_time_ms,
            } => {
                let want = Shape::from_rows(vec![vec![1, 2], vec![3, 4]]).unwrap();
                assert_eq!(shape, want);
                assert!(wall_time_ms < 5_000);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn python_crash_reports_stderr_and_exit_code() {
        if !have("python3") {
            return;
        }
        let executor = test_executor(5_000);
        let source = "import sys\nsys.stderr.write('boom')\nsys.exit(3)\n";
        match executor.execute(source, Language::Python).await {
            ExecutionOutcome::RuntimeFailure {
                diagnostics,
                exit_code,
            } => {
                assert!(diagnostics.contains("boom"));
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn infinite_loop_is_killed_within_the_limit() {
        if !have("python3") {
            return;
        }
        let executor = test_executor(300);
        let started = Instant::now();
        let outcome = executor
            .execute("while True:\n    pass\n", Language::Python)
            .await;
        assert_eq!(outcome, ExecutionOutcome::Timeout);
        // Timeout plus kill grace plus scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn non_grid_output_is_a_parse_failure() {
        if !have("python3") {
            return;
        }
        let executor = test_executor(5_000);
        match executor
            .execute("print('hello world')\n", Language::Python)
            .await
        {
            ExecutionOutcome::ParseFailure { raw_output } => {
                assert!(raw_output.contains("hello world"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_runtime_failure() {
        let executor = Executor::new(&ExecutorConfig {
            python_bin: "gridcode-no-such-python".into(),
            cpp_compiler: "g++".into(),
            work_root: std::env::temp_dir().join(format!("gridcode-exec-{}", Uuid::new_v4())),
            timeout_ms: 1_000,
        });
        match executor.execute("print(1)", Language::Python).await {
            ExecutionOutcome::RuntimeFailure {
                diagnostics,
                exit_code,
            } => {
                assert!(diagnostics.contains("could not start program"));
                assert_eq!(exit_code, None);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cpp_program_compiles_and_runs() {
        if !have("g++") {
            return;
        }
        let executor = test_executor(10_000);
        let source = format!(
            "#include <iostream>\n\
             int main() {{\n\
                 long long k = {OBFUSCATION_KEY}LL;\n\
                 long long grid[2][2] = {{{{7, 0}}, {{0, 7}}}};\n\
                 for (int r = 0; r < 2; r++) {{\n\
                     for (int c = 0; c < 2; c++) {{\n\
                         if (c > 0) std::cout << ' ';\n\
                         std::cout << (grid[r][c] ^ k);\n\
                     }}\n\
                     std::cout << '\\n';\n\
                 }}\n\
                 return 0;\n\
             }}\n"
        );
        match executor.execute(&source, Language::Cpp).await {
            ExecutionOutcome::Success { shape, .. } => {
                let want = Shape::from_rows(vec![vec![7, 0], vec![0, 7]]).unwrap();
                assert_eq!(shape, want);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn broken_cpp_is_a_compile_failure() {
        if !have("g++") {
            return;
        }
        let executor = test_executor(5_000);
        match executor.execute("int main( {", Language::Cpp).await {
            ExecutionOutcome::CompileFailure { diagnostics } => {
                assert!(!diagnostics.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn workdir_is_removed_after_the_run() {
        if !have("python3") {
            return;
        }
        let executor = test_executor(5_000);
        let work_root = executor.work_root.clone();
        executor.execute(&masked_python_grid(), Language::Python).await;

        let mut entries = tokio::fs::read_dir(&work_root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
