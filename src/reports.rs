/// Post-run checks: scan gtest XML reports for failures, and format a run's
/// logs for humans.
///
/// Reports are the `*.xml` files a test subject leaves in a directory. Each
/// report's first `failures="N"` attribute (the `<testsuites>` root in gtest
/// output) decides pass or fail.
use crate::detector::TIMEOUT_CODE;
use crate::supervisor::RunResult;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Environment variable naming the directory where reports are archived.
pub const ARCHIVE_DIR_ENV: &str = "TEST_UNDECLARED_OUTPUTS_DIR";

static FAILURES_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"failures\s*=\s*"(\d+)""#).unwrap());

/// Reports that were checked, in file-name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSummary {
    pub checked: Vec<String>,
}

/// Errors produced by the report check.
#[derive(Debug)]
pub enum ReportError {
    /// The report directory does not exist.
    MissingDir(PathBuf),
    /// Reading or archiving a report failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// One or more reports show failures.
    Failures(Vec<String>),
    /// The number of reports differs from what the caller expected.
    CountMismatch { expected: usize, found: Vec<String> },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::MissingDir(path) => {
                write!(f, "report directory {} does not exist", path.display())
            }
            ReportError::Io { path, source } => {
                write!(f, "I/O error on report {}: {}", path.display(), source)
            }
            ReportError::Failures(files) => {
                write!(
                    f,
                    "Failures found in the following files:\n {}",
                    files.join("\n")
                )
            }
            ReportError::CountMismatch { expected, found } => write!(
                f,
                "Expected to find {} xml files, instead found {}:\n{}",
                expected,
                found.len(),
                found.join("\n")
            ),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failure count declared by a report, or `None` if it declares none.
pub fn report_failures(xml: &str) -> Option<u64> {
    FAILURES_ATTR
        .captures(xml)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Archive directory from [`ARCHIVE_DIR_ENV`], if set.
pub fn archive_dir_from_env() -> Option<PathBuf> {
    std::env::var_os(ARCHIVE_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Check every `*.xml` report in `dir`.
///
/// Fails if any report shows failures (or declares no failure count), then
/// if the number of reports is not `expected_count`. Each report is copied
/// into `archive_dir` when one is given.
pub fn check_for_failures(
    dir: &Path,
    expected_count: usize,
    archive_dir: Option<&Path>,
) -> Result<ReportSummary, ReportError> {
    if !dir.is_dir() {
        return Err(ReportError::MissingDir(dir.to_path_buf()));
    }

    let pattern = format!(
        "{}/*.xml",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let mut reports: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| ReportError::Io {
            path: dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable report entry");
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();
    reports.sort();

    let mut failing = Vec::new();
    let mut checked = Vec::new();
    for path in &reports {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let xml = std::fs::read_to_string(path).map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;

        match report_failures(&xml) {
            Some(0) => tracing::debug!(report = %name, "report passed"),
            failures => {
                tracing::warn!(report = %name, ?failures, "report shows failures");
                failing.push(name.clone());
            }
        }
        checked.push(name.clone());

        if let Some(archive) = archive_dir {
            let target = archive.join(&name);
            std::fs::copy(path, &target).map_err(|e| ReportError::Io {
                path: target,
                source: e,
            })?;
        }
    }

    if !failing.is_empty() {
        return Err(ReportError::Failures(failing));
    }
    if checked.len() != expected_count {
        return Err(ReportError::CountMismatch {
            expected: expected_count,
            found: checked,
        });
    }
    Ok(ReportSummary { checked })
}

/// Human-readable dump of a run: stdout, stderr and the exit status.
pub fn format_logs(result: &RunResult) -> String {
    let extra = if result.exit_code == TIMEOUT_CODE {
        " (timeout)"
    } else {
        ""
    };
    format!(
        "stdout:\n{}\n\nstderr:\n{}\n\nExit status = {}{}",
        result.stdout, result.stderr, result.exit_code, extra
    )
}
