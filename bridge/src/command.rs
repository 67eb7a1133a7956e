use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::LaunchError;

/// What to launch: program, arguments and the environment to start it in.
///
/// The child inherits the caller's environment unless `clear_env` is set;
/// entries in `env` are applied on top either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<OsString, OsString>,
    pub clear_env: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build a spec from `argv[0]` and the remaining arguments.
    pub fn from_argv<S>(argv: &[S]) -> Result<Self, LaunchError>
    where
        S: AsRef<OsStr>,
    {
        let Some((program, args)) = argv.split_first() else {
            return Err(LaunchError::EmptyProgram);
        };
        Ok(Self::new(program.as_ref().to_os_string())
            .args(args.iter().map(|arg| arg.as_ref().to_os_string())))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn clear_env(mut self, clear_env: bool) -> Self {
        self.clear_env = clear_env;
        self
    }

    pub(crate) fn ensure_program(&self) -> Result<(), LaunchError> {
        if self.program.is_empty() {
            return Err(LaunchError::EmptyProgram);
        }
        Ok(())
    }

    pub(crate) fn program_display(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}
