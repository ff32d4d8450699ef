//! ISA conformance harness.
//!
//! Drives pre-built ISA test binaries through a simulator entry point and
//! classifies each run by its exit code:
//!
//! | exit                      | outcome | log written                      |
//! |---------------------------|---------|----------------------------------|
//! | 1                         | pass    | none                             |
//! | 3, or killed by signal 6  | fail    | `fail.<test>.log` (trace re-run) |
//! | 2, or wall-clock timeout  | timeout | `timeout.<test>.log`             |
//! | anything else             | fault   | aborts the batch                 |
//!
//! Signal 6 is how the simulator stops on a wait-for-interrupt trap.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Runtime;

/// Environment variable naming the project root.
pub const PROJ_ROOT_ENV: &str = "PROJ_ROOT";

/// Converts test ELFs into flat binaries.
pub const OBJCOPY: &str = "riscv64-unknown-elf-objcopy";

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("test '{test}' exited with unexpected code {code:?} (signal {signal:?})")]
    UnexpectedExitCode {
        test: String,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("simulator entry point {0} does not exist")]
    MissingEntryPoint(PathBuf),

    #[error("test '{0}' does not exist in the test directory")]
    MissingTest(String),

    #[error("output directory {0} does not exist")]
    MissingOutputDir(PathBuf),

    #[error("no tests selected, use -n, -v, -p or -a")]
    NoSelection,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Which tests to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// A single test by name.
    Name(String),
    /// Every `*.bin` containing `-v-`.
    Virtual,
    /// Every `*.bin` containing `-p-`.
    Physical,
    /// Every `*.bin`.
    All,
}

impl Selection {
    fn matches(&self, file_name: &str) -> bool {
        if file_name == "Makefile" || !file_name.ends_with(".bin") {
            return false;
        }
        match self {
            Selection::Name(_) => false,
            Selection::Virtual => file_name.contains("-v-"),
            Selection::Physical => file_name.contains("-p-"),
            Selection::All => true,
        }
    }
}

/// The classified result of one test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    Timeout,
}

/// Classifies an exit code, or the signal that killed the process.
///
/// Returns `None` for codes that have no meaning to the harness.
pub fn classify(code: Option<i32>, signal: Option<i32>) -> Option<Outcome> {
    match (code, signal) {
        (Some(1), _) => Some(Outcome::Pass),
        (Some(3), _) | (None, Some(6)) => Some(Outcome::Fail),
        (Some(2), _) => Some(Outcome::Timeout),
        _ => None,
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Filesystem layout the harness works against.
#[derive(Clone, Debug)]
pub struct HarnessPaths {
    /// Directory holding the test ELFs and their `.bin` images
    pub test_dir: PathBuf,
    /// Simulator entry point, invoked as `<entry> <test> [--trace]`
    pub entry: PathBuf,
    /// Where fail and timeout logs go
    pub output: PathBuf,
}

impl HarnessPaths {
    /// Standard layout below a project root.
    pub fn under(proj_root: impl AsRef<Path>) -> Self {
        let root = proj_root.as_ref();
        Self {
            test_dir: root.join("isatest"),
            entry: root.join("build").join("playground").join("playground_main"),
            output: root.join("isatest_logs"),
        }
    }

    /// Standard layout below `$PROJ_ROOT`.
    pub fn from_env() -> HarnessResult<Self> {
        let root = std::env::var_os(PROJ_ROOT_ENV).ok_or(HarnessError::MissingEnv(PROJ_ROOT_ENV))?;
        Ok(Self::under(root))
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }
}

/// Per-batch result counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HarnessSummary {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
}

impl HarnessSummary {
    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.timed_out.len()
    }

    pub fn all_passed(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }

    fn record(&mut self, test: &str, outcome: Outcome) {
        let list = match outcome {
            Outcome::Pass => &mut self.passed,
            Outcome::Fail => &mut self.failed,
            Outcome::Timeout => &mut self.timed_out,
        };
        list.push(test.to_string());
    }

    pub fn print(&self) {
        println!("\n=== ISA Test Summary ===");
        println!("Total:    {}", self.total());
        println!("Passed:   {}", self.passed.len());
        println!("Failed:   {}", self.failed.len());
        for t in &self.failed {
            println!("  - {}", t);
        }
        println!("Timeout:  {}", self.timed_out.len());
        for t in &self.timed_out {
            println!("  - {}", t);
        }
    }
}

/// Runs ISA tests against a simulator entry point.
#[derive(Clone, Debug)]
pub struct Harness {
    paths: HarnessPaths,
    timeout: Duration,
}

impl Harness {
    pub fn new(paths: HarnessPaths) -> Self {
        Self {
            paths,
            timeout: Duration::from_secs(60),
        }
    }

    /// Sets the wall-clock limit for a single simulator run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn paths(&self) -> &HarnessPaths {
        &self.paths
    }

    fn list_test_dir(&self) -> HarnessResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.paths.test_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolves a selection into test names, without the `.bin` suffix.
    pub fn discover(&self, selection: &Selection) -> HarnessResult<Vec<String>> {
        let files = self.list_test_dir()?;
        if let Selection::Name(name) = selection {
            if !files.iter().any(|f| f == name) {
                return Err(HarnessError::MissingTest(name.clone()));
            }
            return Ok(vec![name.clone()]);
        }
        Ok(files
            .iter()
            .filter(|f| selection.matches(f))
            .map(|f| f.trim_end_matches(".bin").to_string())
            .collect())
    }

    /// Converts every extension-less test ELF into `<test>.bin`.
    ///
    /// Returns the number of images written.
    pub fn gen_bin(&self) -> HarnessResult<usize> {
        let mut converted = 0;
        for name in self.list_test_dir()? {
            if name.contains('.') || name == "Makefile" {
                continue;
            }
            let elf = self.paths.test_dir.join(&name);
            let bin = self.paths.test_dir.join(format!("{}.bin", name));
            let status = Command::new(OBJCOPY)
                .args(["-I", "elf64-littleriscv", "-O", "binary"])
                .arg(&elf)
                .arg(&bin)
                .status()?;
            if status.success() {
                converted += 1;
            } else {
                tracing::warn!(test = %name, ?status, "objcopy failed");
            }
        }
        tracing::info!(converted, dir = %self.paths.test_dir.display(), "generated test images");
        Ok(converted)
    }

    /// Removes `*.log` files left in the output directory by earlier runs.
    pub fn clear_logs(&self) -> HarnessResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.paths.output)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map(|e| e == "log").unwrap_or(false) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn check_layout(&self) -> HarnessResult<()> {
        if !self.paths.entry.exists() {
            return Err(HarnessError::MissingEntryPoint(self.paths.entry.clone()));
        }
        if !self.paths.output.is_dir() {
            return Err(HarnessError::MissingOutputDir(self.paths.output.clone()));
        }
        Ok(())
    }

    /// Runs the selected tests and returns the per-outcome summary.
    ///
    /// Fails and timeouts are recorded and the batch continues; an exit code
    /// the harness does not understand aborts it.
    pub fn run(&self, selection: &Selection) -> HarnessResult<HarnessSummary> {
        self.check_layout()?;
        let tests = self.discover(selection)?;
        if !matches!(selection, Selection::Name(_)) {
            let removed = self.clear_logs()?;
            tracing::debug!(removed, "cleared previous logs");
        }

        let rt = runtime()?;
        let mut summary = HarnessSummary::default();
        for test in &tests {
            let outcome = rt.block_on(self.run_test(test))?;
            summary.record(test, outcome);
        }
        tracing::info!(
            total = summary.total(),
            passed = summary.passed.len(),
            failed = summary.failed.len(),
            timed_out = summary.timed_out.len(),
            "ISA batch finished"
        );
        Ok(summary)
    }

    /// Runs one test and writes its log if it did not pass.
    pub fn run_one(&self, test: &str) -> HarnessResult<Outcome> {
        runtime()?.block_on(self.run_test(test))
    }

    async fn run_test(&self, test: &str) -> HarnessResult<Outcome> {
        let child = tokio::process::Command::new(&self.paths.entry)
            .arg(test)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let outcome = match self.wait(child).await? {
            None => {
                tracing::warn!(test, timeout = ?self.timeout, "wall-clock timeout, process killed");
                Outcome::Timeout
            }
            Some(status) => {
                let (code, signal) = (status.code(), exit_signal(&status));
                classify(code, signal).ok_or_else(|| HarnessError::UnexpectedExitCode {
                    test: test.to_string(),
                    code,
                    signal,
                })?
            }
        };

        match outcome {
            Outcome::Pass => tracing::info!(test, "pass"),
            Outcome::Fail => {
                tracing::info!(test, "fail, re-running with trace");
                self.capture_trace(test).await?;
            }
            Outcome::Timeout => {
                tracing::info!(test, "timeout");
                let mut log = File::create(self.paths.output.join(format!("timeout.{}.log", test)))?;
                writeln!(log, "timeout")?;
            }
        }
        Ok(outcome)
    }

    async fn capture_trace(&self, test: &str) -> HarnessResult<()> {
        let log = File::create(self.paths.output.join(format!("fail.{}.log", test)))?;
        let child = tokio::process::Command::new(&self.paths.entry)
            .arg(test)
            .arg("--trace")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        if self.wait(child).await?.is_none() {
            tracing::warn!(test, "trace re-run hit the wall-clock timeout");
        }
        Ok(())
    }

    /// Waits for `child`, killing it at the deadline. `None` means killed.
    async fn wait(&self, mut child: tokio::process::Child) -> HarnessResult<Option<ExitStatus>> {
        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        match waited {
            Ok(status) => Ok(Some(status?)),
            Err(_) => {
                // kill() also reaps the process
                child.kill().await?;
                Ok(None)
            }
        }
    }
}

/// Single-threaded runtime driving the simulator subprocesses.
fn runtime() -> HarnessResult<Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some(1), None), Some(Outcome::Pass));
        assert_eq!(classify(Some(3), None), Some(Outcome::Fail));
        assert_eq!(classify(None, Some(6)), Some(Outcome::Fail));
        assert_eq!(classify(Some(2), None), Some(Outcome::Timeout));
        assert_eq!(classify(Some(0), None), None);
        assert_eq!(classify(None, Some(9)), None);
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["rv64ui-p-add", "rv64ui-p-add.bin", "rv64ui-v-add.bin", "rv64um-p-mul.bin", "Makefile"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let harness = Harness::new(HarnessPaths {
            test_dir: dir.path().to_path_buf(),
            entry: dir.path().join("sim"),
            output: dir.path().to_path_buf(),
        });

        assert_eq!(harness.discover(&Selection::Virtual).unwrap(), vec!["rv64ui-v-add"]);
        assert_eq!(
            harness.discover(&Selection::Physical).unwrap(),
            vec!["rv64ui-p-add", "rv64um-p-mul"]
        );
        assert_eq!(harness.discover(&Selection::All).unwrap().len(), 3);
        assert_eq!(
            harness.discover(&Selection::Name("rv64ui-p-add".into())).unwrap(),
            vec!["rv64ui-p-add"]
        );
        assert!(matches!(
            harness.discover(&Selection::Name("nope".into())),
            Err(HarnessError::MissingTest(_))
        ));
    }

    #[test]
    fn test_paths_under_root() {
        let paths = HarnessPaths::under("/proj");
        assert_eq!(paths.test_dir, PathBuf::from("/proj/isatest"));
        assert_eq!(paths.entry, PathBuf::from("/proj/build/playground/playground_main"));
        assert_eq!(paths.output, PathBuf::from("/proj/isatest_logs"));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = HarnessSummary::default();
        summary.record("a", Outcome::Pass);
        summary.record("b", Outcome::Fail);
        assert_eq!(summary.total(), 2);
        assert!(!summary.all_passed());
    }
}
