/// Control selection: which kind of target the subject runs on.
///
/// The platform is picked once from configuration; everything downstream
/// talks to the returned [`Controller`] and never re-checks the platform.
use crate::command::Command;
use crate::detector::DeadlineSpec;
use crate::supervisor::{self, RunError, RunResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of target the subject runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// A process on this machine.
    #[default]
    Local,
    /// A virtualized target (e.g. QEMU). Not implemented.
    Virtualized,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Local => write!(f, "local"),
            Platform::Virtualized => write!(f, "virtualized"),
        }
    }
}

/// Control implementation for the selected platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    /// Runs the subject as a local process group.
    Local,
}

impl Controller {
    /// Select the control implementation for `platform`.
    pub fn for_platform(platform: Platform) -> Result<Self, RunError> {
        match platform {
            Platform::Local => Ok(Controller::Local),
            Platform::Virtualized => Err(RunError::UnsupportedPlatform(platform)),
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Controller::Local => Platform::Local,
        }
    }

    /// See [`supervisor::run_to_completion`].
    pub async fn run_to_completion(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<RunResult, RunError> {
        match self {
            Controller::Local => supervisor::run_to_completion(command, timeout).await,
        }
    }

    /// See [`supervisor::run_until_signaled`].
    pub async fn run_until_signaled(
        &self,
        command: &Command,
        spec: &DeadlineSpec,
    ) -> Result<RunResult, RunError> {
        match self {
            Controller::Local => supervisor::run_until_signaled(command, spec).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_platform_selects_local_controller() {
        let controller = Controller::for_platform(Platform::Local).unwrap();
        assert_eq!(controller, Controller::Local);
        assert_eq!(controller.platform(), Platform::Local);
    }

    #[test]
    fn test_virtualized_platform_is_unsupported() {
        let err = Controller::for_platform(Platform::Virtualized).unwrap_err();
        assert!(matches!(
            err,
            RunError::UnsupportedPlatform(Platform::Virtualized)
        ));
        assert_eq!(err.to_string(), "platform virtualized is not supported yet");
    }

    #[test]
    fn test_platform_default_is_local() {
        assert_eq!(Platform::default(), Platform::Local);
    }

    #[tokio::test]
    async fn test_controller_runs_subject() {
        let controller = Controller::for_platform(Platform::Local).unwrap();
        let cmd = Command::new(["/bin/sh", "-c", "echo via-controller"]);
        let result = controller
            .run_to_completion(&cmd, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "via-controller\n");
    }
}
