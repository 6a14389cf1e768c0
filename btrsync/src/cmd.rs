use crate::error::BtrSyncError;
use anyhow::Result;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

/// Where a stage's stdin/stdout/stderr is routed. A closed set of cases so
/// stage wiring in [`crate::flow::Flow`] never has to guess at a duck-typed
/// file-like object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSpec {
    Inherit,
    Null,
    Pipe,
    Fd(i32),
    File(PathBuf, FileMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    /// Create-or-truncate for writing.
    WriteCreate,
}

/// An immutable description of one external command invocation. Built as a
/// value and only turned into a live process by [`crate::flow::Flow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub argv: Vec<OsString>,
    pub env_overrides: HashMap<OsString, OsString>,
    pub stdin: StreamSpec,
    pub stdout: StreamSpec,
    pub stderr: StreamSpec,
}

impl Cmd {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env_overrides: HashMap::new(),
            stdin: StreamSpec::Inherit,
            stdout: StreamSpec::Inherit,
            stderr: StreamSpec::Inherit,
        }
    }

    pub fn with_stdin(mut self, spec: StreamSpec) -> Self {
        self.stdin = spec;
        self
    }

    pub fn with_stdout(mut self, spec: StreamSpec) -> Self {
        self.stdout = spec;
        self
    }

    pub fn with_stderr(mut self, spec: StreamSpec) -> Self {
        self.stderr = spec;
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }

    fn argv0(&self) -> String {
        self.argv
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Prepend `sudo <flag>` to this command's argv. Applies to a single
    /// stage; call once per stage when wrapping a [`Pipeline`].
    pub fn wrap_sudo(mut self, sudo_flag: &str) -> Self {
        let mut argv = vec![OsString::from("sudo"), OsString::from(sudo_flag)];
        argv.append(&mut self.argv);
        self.argv = argv;
        self
    }
}

/// A linear composition of stages, `stage_0` feeding `stage_1` and so on.
/// Each non-final stage's stdout is wired to the next stage's stdin by the
/// [`crate::flow::Flow`] that realizes this value as running processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<Cmd>,
}

impl Pipeline {
    pub fn single(cmd: Cmd) -> Self {
        Self { stages: vec![cmd] }
    }

    pub fn is_single_stage(&self) -> bool {
        self.stages.len() <= 1
    }

    /// Wrap every stage's argv in `sudo <flag>`.
    pub fn wrap_sudo(self, sudo_flag: &str) -> Self {
        Self {
            stages: self.stages.into_iter().map(|c| c.wrap_sudo(sudo_flag)).collect(),
        }
    }

    /// Replace this pipeline with a single `ssh` invocation whose remote
    /// shell command reconstructs the pipeline on the remote side. A
    /// multi-stage pipeline is only meaningful to wrap as a whole when every
    /// stage is meant to run remotely; wrapping an already-composed local
    /// pipeline that mixes local and remote stages is ill-defined, so a
    /// `Pipeline` with more than one stage is rejected here -- compose
    /// `wrap_ssh` on each [`Cmd`] individually instead and pipe the results.
    pub fn wrap_ssh(self, user: &str, host: &str, port: Option<u16>) -> Result<Cmd> {
        if self.stages.len() > 1 {
            return Err(BtrSyncError::configuration(
                "cannot SSH-wrap an already-composed local pipeline; wrap each stage individually and pipe the results",
            )
            .into());
        }
        let cmd = self.stages.into_iter().next().expect("single stage checked above");
        Ok(wrap_ssh_cmd(cmd, user, host, port))
    }
}

/// Build a pipeline from any number of commands.
pub fn pipeline<I: IntoIterator<Item = Cmd>>(cmds: I) -> Pipeline {
    Pipeline { stages: cmds.into_iter().collect() }
}

/// SSH-wrap a single command: replace its argv with `ssh [-p port] user@host <remote argv>`,
/// where `<remote argv>` is this command's own argv, POSIX-single-quoted.
pub fn wrap_ssh_cmd(cmd: Cmd, user: &str, host: &str, port: Option<u16>) -> Cmd {
    let remote_command = shell_quote_argv(&cmd.argv);

    let mut argv = vec![OsString::from("ssh")];
    if let Some(port) = port {
        argv.push(OsString::from("-p"));
        argv.push(OsString::from(port.to_string()));
    }
    argv.push(OsString::from(format!("{}@{}", user, host)));
    argv.push(OsString::from(remote_command));

    Cmd {
        argv,
        env_overrides: cmd.env_overrides,
        stdin: cmd.stdin,
        stdout: cmd.stdout,
        stderr: cmd.stderr,
    }
}

fn shell_quote_argv(argv: &[OsString]) -> String {
    argv.iter().map(|a| shell_quote(&a.to_string_lossy())).collect::<Vec<_>>().join(" ")
}

/// POSIX single-quote escaping: wrap in single quotes, and for every literal
/// single quote in the input emit `'\''` (close quote, escaped quote, reopen
/// quote).
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=".contains(c)) {
        return arg.to_string();
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_round_trips_through_sh() {
        let quoted = shell_quote("a b$c'd");
        assert_eq!(quoted, r#"'a b$c'\''d'"#);
        // Feed the quoted form to `sh -c 'printf %s ARG'` and check it decodes exactly.
        let script = format!("printf '%s' {}", quoted);
        let output = std::process::Command::new("sh").arg("-c").arg(&script).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "a b$c'd");
    }

    #[test]
    fn plain_alnum_args_are_not_quoted() {
        assert_eq!(shell_quote("simple-arg_1.2:3"), "simple-arg_1.2:3");
    }

    #[test]
    fn wrap_ssh_builds_single_remote_shell_command() {
        let cmd = Cmd::new(vec!["btrfs", "send", "a b$c'd"]);
        let wrapped = wrap_ssh_cmd(cmd, "root", "backup-host", Some(2222));
        let argv: Vec<String> = wrapped.argv.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(argv[0], "ssh");
        assert_eq!(argv[1], "-p");
        assert_eq!(argv[2], "2222");
        assert_eq!(argv[3], "root@backup-host");
        assert_eq!(argv[4], "btrfs send 'a b$c'\\''d'");
    }

    #[test]
    fn wrap_ssh_rejects_multi_stage_pipeline() {
        let p = pipeline(vec![Cmd::new(vec!["a"]), Cmd::new(vec!["b"])]);
        let err = p.wrap_ssh("u", "h", None).unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn pipeline_of_individually_wrapped_commands_succeeds() {
        let a = wrap_ssh_cmd(Cmd::new(vec!["a"]), "u", "h", None);
        let b = wrap_ssh_cmd(Cmd::new(vec!["b"]), "u", "h", None);
        let p = pipeline(vec![a, b]);
        assert_eq!(p.stages.len(), 2);
    }

    #[test]
    fn sudo_wraps_every_stage() {
        let p = pipeline(vec![Cmd::new(vec!["btrfs", "send", "x"]), Cmd::new(vec!["btrfs", "receive", "y"])])
            .wrap_sudo("-n");
        for stage in &p.stages {
            assert_eq!(stage.argv[0], "sudo");
            assert_eq!(stage.argv[1], "-n");
        }
    }
}
