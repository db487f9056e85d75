/// The subject's command line: argv, environment and an optional launcher
/// prefix. Immutable once handed to the supervisor.
use crate::config::CommandConfig;
use crate::supervisor::RunError;
use std::collections::BTreeMap;
use std::process::Stdio;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    launcher: Vec<String>,
    inherit_env: bool,
}

impl Command {
    /// Create a command from its argv. The first element is the program.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set one environment variable for the subject.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables for the subject.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Prefix the argv with a launcher (e.g. `fakeroot fakechroot -s chroot .`).
    pub fn launcher<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher = prefix.into_iter().map(Into::into).collect();
        self
    }

    /// Keep the harness's own environment underneath the explicit variables.
    /// Off by default: the subject sees exactly the variables set here.
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// The full argv as spawned: launcher prefix followed by the subject's args.
    pub fn argv(&self) -> Vec<String> {
        self.launcher.iter().chain(&self.args).cloned().collect()
    }

    /// The executable that will actually be spawned.
    pub fn program(&self) -> Option<&str> {
        self.launcher
            .first()
            .or_else(|| self.args.first())
            .map(String::as_str)
    }

    /// Build the tokio command: piped stdout/stderr, null stdin, and a new
    /// process group led by the subject (pgid == pid).
    pub(crate) fn to_tokio(&self) -> Result<tokio::process::Command, RunError> {
        if self.args.is_empty() {
            return Err(RunError::EmptyCommand);
        }
        let argv = self.argv();
        let (program, rest) = argv.split_first().ok_or(RunError::EmptyCommand)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest);
        if !self.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        Ok(cmd)
    }
}

impl From<&CommandConfig> for Command {
    fn from(config: &CommandConfig) -> Self {
        let args = std::iter::once(config.program.clone())
            .filter(|p| !p.is_empty())
            .chain(config.args.iter().cloned());
        Command::new(args)
            .envs(config.env.clone())
            .launcher(config.launcher.clone())
            .inherit_env(config.inherit_env)
    }
}
