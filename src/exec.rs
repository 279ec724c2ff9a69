//! Secure command execution.
//!
//! Every external process the orchestrator runs — git, build tools, test
//! runners, the agent binary — goes through [`SecureExecutor::run`]. The
//! executor never involves a shell: commands are spawned from an argv
//! vector, the executable must appear in a caller-supplied allowlist, and
//! each argument is screened for shell metacharacters in raw, URL-decoded,
//! and double-decoded form.
//!
//! When the sandbox is enabled the command is wrapped in a container launch
//! with all capabilities dropped, a non-root user, a read-only rootfs,
//! resource caps, and read-only bind mounts. The container image must be
//! pinned by SHA-256 digest; `:latest`, untagged references, and
//! placeholder digests are rejected when the policy is constructed, not at
//! run time.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::OrchestratorError;
use crate::sandbox::percent_decode;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Shell metacharacters that must never appear in an argument.
///
/// Multi-character sequences are listed alongside their single-character
/// prefixes so the rejection reason names the exact token that matched.
const SHELL_METACHARACTERS: [&str; 12] = [
    ";", "|", "&", "$(", "${", "$", "`", "\n", ">>", "<<", ">", "<",
];

/// How often the executor polls a running child for exit or timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// Container network mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// No network access (default).
    #[default]
    None,
    /// Share the host network namespace.
    Host,
    /// Bridged networking.
    Bridge,
}

impl NetworkMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Host => "host",
            Self::Bridge => "bridge",
        }
    }
}

/// Container sandbox configuration for a single command.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    /// Wrap the command in a container launch.
    pub use_container: bool,
    /// Mount the container rootfs read-only.
    pub read_only_rootfs: bool,
    /// Network mode for the container.
    pub network_mode: NetworkMode,
    /// Extra paths bind-mounted read-only into the container.
    pub allowed_paths: Vec<PathBuf>,
    /// Memory cap in megabytes.
    pub max_memory_mb: u64,
    /// CPU cap expressed as CPU-seconds per wall minute.
    pub max_cpu_seconds: u64,
    /// Maximum number of processes inside the container.
    pub pids_limit: u64,
    /// `uid:gid` the command runs as; never root.
    pub user: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            use_container: true,
            read_only_rootfs: true,
            network_mode: NetworkMode::None,
            allowed_paths: Vec::new(),
            max_memory_mb: 512,
            max_cpu_seconds: 60,
            pids_limit: 100,
            user: "1000:1000".to_owned(),
        }
    }
}

impl SandboxConfig {
    /// A sandbox config that runs commands directly on the host.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            use_container: false,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ArgumentRules
// ---------------------------------------------------------------------------

/// Per-executable argument constraints.
#[derive(Clone, Debug, Default)]
pub struct ArgumentRules {
    /// If set, only these flags may be passed (values after `=` ignored).
    pub allowed_flags: Option<Vec<String>>,
    /// Flags that are always rejected.
    pub denied_flags: Vec<String>,
    /// Regex patterns (matched at the start of an argument) that are rejected.
    pub denied_patterns: Vec<String>,
    /// If set, the first non-flag argument must be one of these.
    pub allowed_subcommands: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// ExecPolicy
// ---------------------------------------------------------------------------

/// Security policy for command execution.
///
/// Construct with [`ExecPolicy::new`]; the sandbox image is validated at
/// construction so a misconfigured policy fails before anything runs.
#[derive(Clone, Debug)]
pub struct ExecPolicy {
    /// Executables that may be spawned. Matched against the full string the
    /// caller passes (a bare name or a path).
    pub allowed_executables: Vec<String>,
    /// Per-executable argument rules, keyed by executable basename.
    pub argument_rules: HashMap<String, ArgumentRules>,
    sandbox_image: Option<String>,
}

impl ExecPolicy {
    /// Create a policy without a container image (direct execution only).
    #[must_use]
    pub fn new(allowed_executables: Vec<String>) -> Self {
        Self {
            allowed_executables,
            argument_rules: HashMap::new(),
            sandbox_image: None,
        }
    }

    /// Create a policy with a container image for sandboxed execution.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Security`] if the image is not pinned by
    /// a full SHA-256 digest, references `:latest`, or carries a placeholder
    /// digest.
    pub fn with_sandbox_image(
        allowed_executables: Vec<String>,
        image: &str,
    ) -> Result<Self, OrchestratorError> {
        validate_image_pin(image)?;
        Ok(Self {
            allowed_executables,
            argument_rules: HashMap::new(),
            sandbox_image: Some(image.to_owned()),
        })
    }

    /// Attach argument rules for an executable basename.
    #[must_use]
    pub fn with_rules(mut self, executable: &str, rules: ArgumentRules) -> Self {
        self.argument_rules.insert(executable.to_owned(), rules);
        self
    }

    /// The pinned sandbox image, if one was configured.
    #[must_use]
    pub fn sandbox_image(&self) -> Option<&str> {
        self.sandbox_image.as_deref()
    }
}

/// Reject container images that are not pinned by a real SHA-256 digest.
fn validate_image_pin(image: &str) -> Result<(), OrchestratorError> {
    if image.contains(":latest") {
        return Err(OrchestratorError::security(
            "container image must be pinned by SHA-256 digest, not :latest",
        ));
    }
    let Some((_, digest)) = image.split_once("@sha256:") else {
        return Err(OrchestratorError::security(format!(
            "container image '{image}' is not pinned by SHA-256 digest"
        )));
    };
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OrchestratorError::security(format!(
            "container image '{image}' carries a placeholder or malformed digest"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SecureCommand / CommandOutput
// ---------------------------------------------------------------------------

/// A fully-specified command to run.
#[derive(Clone, Debug)]
pub struct SecureCommand {
    /// The executable. Must appear in the policy allowlist.
    pub executable: String,
    /// Arguments, passed as a vector — never through a shell.
    pub args: Vec<String>,
    /// Working directory for the child process.
    pub working_dir: PathBuf,
    /// Hard timeout; on expiry the process is killed.
    pub timeout: Duration,
    /// Sandbox configuration for this command.
    pub sandbox: SandboxConfig,
}

impl SecureCommand {
    /// Build a command with a disabled sandbox and the given timeout.
    #[must_use]
    pub fn direct(
        executable: impl Into<String>,
        args: Vec<String>,
        working_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            executable: executable.into(),
            args,
            working_dir,
            timeout,
            sandbox: SandboxConfig::disabled(),
        }
    }
}

/// Result of a completed command.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    /// Process exit code. `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    /// Captured stdout, lossily decoded as UTF-8.
    pub stdout: String,
    /// Captured stderr, lossily decoded as UTF-8.
    pub stderr: String,
    /// Whether the command was killed on timeout. Always `false` in results
    /// returned by [`SecureExecutor::run`], which raises on timeout instead;
    /// callers that convert timeouts into results set it themselves.
    pub timed_out: bool,
}

impl CommandOutput {
    /// True when the command exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// SecureExecutor
// ---------------------------------------------------------------------------

/// Runs commands under an [`ExecPolicy`].
#[derive(Clone, Debug)]
pub struct SecureExecutor {
    policy: ExecPolicy,
}

impl SecureExecutor {
    /// Create an executor with the given policy.
    #[must_use]
    pub const fn new(policy: ExecPolicy) -> Self {
        Self { policy }
    }

    /// The policy this executor enforces.
    #[must_use]
    pub const fn policy(&self) -> &ExecPolicy {
        &self.policy
    }

    /// Run a command after validating it against the policy.
    ///
    /// # Errors
    /// - [`OrchestratorError::Security`] if the executable is not
    ///   allowlisted, an argument contains a (possibly encoded) shell
    ///   metacharacter or null byte, or a per-executable rule is violated.
    /// - [`OrchestratorError::Timeout`] if the command exceeds its timeout;
    ///   the process is killed and partial output is discarded.
    /// - [`OrchestratorError::Io`] if spawning fails.
    pub fn run(&self, cmd: &SecureCommand) -> Result<CommandOutput, OrchestratorError> {
        if !self.policy.allowed_executables.contains(&cmd.executable) {
            return Err(OrchestratorError::security(format!(
                "executable not allowed: {}",
                cmd.executable
            )));
        }

        validate_no_metacharacters(&cmd.args)?;

        let basename = PathBuf::from(&cmd.executable)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cmd.executable.clone());
        if let Some(rules) = self.policy.argument_rules.get(&basename) {
            validate_argument_rules(&cmd.args, rules)?;
        }

        if cmd.sandbox.use_container {
            let image = self.policy.sandbox_image().ok_or_else(|| {
                OrchestratorError::security(
                    "sandboxed execution requested but no pinned container image is configured",
                )
            })?;
            let argv = container_argv(cmd, image);
            spawn_with_timeout(&argv[0], &argv[1..], None, cmd.timeout, &describe(cmd))
        } else {
            spawn_with_timeout(
                &cmd.executable,
                &cmd.args,
                Some(&cmd.working_dir),
                cmd.timeout,
                &describe(cmd),
            )
        }
    }
}

fn describe(cmd: &SecureCommand) -> String {
    format!("command '{}'", cmd.executable)
}

/// Build the container argv wrapping a command, with hardening flags.
fn container_argv(cmd: &SecureCommand, image: &str) -> Vec<String> {
    let sandbox = &cmd.sandbox;
    let mut argv = vec![
        "docker".to_owned(),
        "run".to_owned(),
        "--rm".to_owned(),
        "--cap-drop=ALL".to_owned(),
        format!("--user={}", sandbox.user),
        format!("--pids-limit={}", sandbox.pids_limit),
        "--security-opt=no-new-privileges".to_owned(),
    ];
    if sandbox.read_only_rootfs {
        argv.push("--read-only".to_owned());
    }
    argv.push(format!("--network={}", sandbox.network_mode.as_str()));
    argv.push(format!("--memory={}m", sandbox.max_memory_mb));
    // CPU-seconds per minute approximates a cpus fraction.
    argv.push(format!(
        "--cpus={:.2}",
        sandbox.max_cpu_seconds as f64 / 60.0
    ));
    for path in &sandbox.allowed_paths {
        let p = path.display();
        argv.push("-v".to_owned());
        argv.push(format!("{p}:{p}:ro"));
    }
    let wd = cmd.working_dir.display();
    argv.push("-v".to_owned());
    argv.push(format!("{wd}:{wd}"));
    argv.push("-w".to_owned());
    argv.push(wd.to_string());
    argv.push(image.to_owned());
    argv.push(cmd.executable.clone());
    argv.extend(cmd.args.iter().cloned());
    argv
}

// ---------------------------------------------------------------------------
// Argument validation
// ---------------------------------------------------------------------------

/// Reject arguments containing shell metacharacters or null bytes, in raw,
/// single-decoded, and double-decoded form.
fn validate_no_metacharacters(args: &[String]) -> Result<(), OrchestratorError> {
    for arg in args {
        check_metacharacters(arg, arg, "")?;

        let decoded = percent_decode(arg);
        if decoded != *arg {
            check_metacharacters(&decoded, arg, "encoded ")?;
            let double_decoded = percent_decode(&decoded);
            if double_decoded != decoded {
                check_metacharacters(&double_decoded, arg, "double-encoded ")?;
            }
        }

        if arg.contains('\0') {
            return Err(OrchestratorError::security(format!(
                "argument contains a null byte: {arg:?}"
            )));
        }
    }
    Ok(())
}

fn check_metacharacters(
    candidate: &str,
    original: &str,
    prefix: &str,
) -> Result<(), OrchestratorError> {
    for meta in SHELL_METACHARACTERS {
        if candidate.contains(meta) {
            return Err(OrchestratorError::security(format!(
                "argument contains {prefix}shell metacharacter {meta:?}: {original}"
            )));
        }
    }
    Ok(())
}

/// Enforce per-executable argument rules.
fn validate_argument_rules(args: &[String], rules: &ArgumentRules) -> Result<(), OrchestratorError> {
    for arg in args {
        if rules.denied_flags.contains(arg) {
            return Err(OrchestratorError::security(format!("denied flag: {arg}")));
        }

        for pattern in &rules.denied_patterns {
            let anchored = format!("^(?:{pattern})");
            let re = Regex::new(&anchored).map_err(|e| {
                OrchestratorError::security(format!("invalid denied pattern '{pattern}': {e}"))
            })?;
            if re.is_match(arg) {
                return Err(OrchestratorError::security(format!(
                    "argument matches denied pattern '{pattern}': {arg}"
                )));
            }
        }

        if let Some(allowed) = &rules.allowed_flags {
            if arg.starts_with('-') {
                let base = arg.split('=').next().unwrap_or(arg);
                if !allowed.iter().any(|f| f == arg || f == base) {
                    return Err(OrchestratorError::security(format!(
                        "flag not in allowlist: {arg}"
                    )));
                }
            }
        }
    }

    if let Some(subcommands) = &rules.allowed_subcommands {
        if let Some(sub) = args.iter().find(|a| !a.starts_with('-')) {
            if !subcommands.contains(sub) {
                return Err(OrchestratorError::security(format!(
                    "subcommand not allowed: {sub}"
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Spawn a process and wait for it with a hard timeout.
///
/// Output pipes are drained on dedicated threads so a chatty child cannot
/// deadlock against a full pipe buffer while the parent polls for exit.
fn spawn_with_timeout(
    executable: &str,
    args: &[String],
    working_dir: Option<&std::path::Path>,
    timeout: Duration,
    operation: &str,
) -> Result<CommandOutput, OrchestratorError> {
    let mut command = Command::new(executable);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;
    let stdout_handle = drain_pipe(child.stdout.take());
    let stderr_handle = drain_pipe(child.stderr.take());

    let status = wait_with_deadline(&mut child, timeout, operation)?;

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        exit_code: status,
        stdout,
        stderr,
        timed_out: false,
    })
}

fn drain_pipe<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    operation: &str,
) -> Result<i32, OrchestratorError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code().unwrap_or(-1));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(OrchestratorError::Timeout {
                operation: operation.to_owned(),
                seconds: timeout.as_secs(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(executables: &[&str]) -> ExecPolicy {
        ExecPolicy::new(executables.iter().map(|s| (*s).to_owned()).collect())
    }

    fn echo_cmd(args: &[&str]) -> SecureCommand {
        SecureCommand::direct(
            "echo",
            args.iter().map(|s| (*s).to_owned()).collect(),
            std::env::temp_dir(),
            Duration::from_secs(10),
        )
    }

    // -- allowlist --

    #[test]
    fn rejects_unlisted_executable() {
        let executor = SecureExecutor::new(policy(&["echo"]));
        let mut cmd = echo_cmd(&["hi"]);
        cmd.executable = "curl".to_owned();
        let err = executor.run(&cmd).unwrap_err();
        assert!(format!("{err}").contains("not allowed"));
    }

    #[test]
    fn runs_allowed_executable() {
        let executor = SecureExecutor::new(policy(&["echo"]));
        let out = executor.run(&echo_cmd(&["hello"])).unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("hello"));
        assert!(!out.timed_out);
    }

    // -- metacharacters --

    #[test]
    fn rejects_raw_metacharacters() {
        let executor = SecureExecutor::new(policy(&["echo"]));
        for bad in [
            "a;b", "a|b", "a&b", "$(id)", "${HOME}", "a`b`", "a\nb", "a>b", "a<b", "a>>b",
        ] {
            let err = executor.run(&echo_cmd(&[bad])).unwrap_err();
            assert!(
                matches!(err, OrchestratorError::Security { .. }),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn rejects_encoded_semicolon() {
        let executor = SecureExecutor::new(policy(&["echo"]));
        let err = executor.run(&echo_cmd(&["%3B"])).unwrap_err();
        assert!(format!("{err}").contains("metacharacter"));
    }

    #[test]
    fn rejects_double_encoded_semicolon() {
        // %253B decodes to %3B, which decodes to ';'.
        let executor = SecureExecutor::new(policy(&["echo"]));
        assert!(executor.run(&echo_cmd(&["%253B"])).is_err());
        assert!(executor.run(&echo_cmd(&["%25%3B"])).is_err());
    }

    #[test]
    fn rejects_null_byte_argument() {
        let executor = SecureExecutor::new(policy(&["echo"]));
        assert!(executor.run(&echo_cmd(&["a\0b"])).is_err());
    }

    #[test]
    fn accepts_plain_arguments() {
        let executor = SecureExecutor::new(policy(&["echo"]));
        assert!(executor.run(&echo_cmd(&["--flag", "plain-value_1.txt"])).is_ok());
    }

    // -- argument rules --

    #[test]
    fn rejects_denied_flag() {
        let rules = ArgumentRules {
            denied_flags: vec!["--force".to_owned()],
            ..ArgumentRules::default()
        };
        let executor = SecureExecutor::new(policy(&["echo"]).with_rules("echo", rules));
        assert!(executor.run(&echo_cmd(&["--force"])).is_err());
        assert!(executor.run(&echo_cmd(&["--quiet"])).is_ok());
    }

    #[test]
    fn rejects_denied_pattern() {
        let rules = ArgumentRules {
            denied_patterns: vec![r"--upload.*".to_owned()],
            ..ArgumentRules::default()
        };
        let executor = SecureExecutor::new(policy(&["echo"]).with_rules("echo", rules));
        assert!(executor.run(&echo_cmd(&["--upload-pack=x"])).is_err());
    }

    #[test]
    fn enforces_allowed_flags() {
        let rules = ArgumentRules {
            allowed_flags: Some(vec!["--verbose".to_owned(), "--tb".to_owned()]),
            ..ArgumentRules::default()
        };
        let executor = SecureExecutor::new(policy(&["echo"]).with_rules("echo", rules));
        assert!(executor.run(&echo_cmd(&["--verbose"])).is_ok());
        // Flag with a value resolves to its base before the allowlist check.
        assert!(executor.run(&echo_cmd(&["--tb=short"])).is_ok());
        assert!(executor.run(&echo_cmd(&["--evil"])).is_err());
    }

    #[test]
    fn enforces_allowed_subcommands() {
        let rules = ArgumentRules {
            allowed_subcommands: Some(vec!["status".to_owned(), "diff".to_owned()]),
            ..ArgumentRules::default()
        };
        let executor = SecureExecutor::new(policy(&["echo"]).with_rules("echo", rules));
        assert!(executor.run(&echo_cmd(&["status"])).is_ok());
        assert!(executor.run(&echo_cmd(&["push"])).is_err());
    }

    // -- image pinning --

    #[test]
    fn rejects_latest_image() {
        let err =
            ExecPolicy::with_sandbox_image(vec!["echo".to_owned()], "runner:latest").unwrap_err();
        assert!(format!("{err}").contains(":latest"));
    }

    #[test]
    fn rejects_untagged_image() {
        assert!(ExecPolicy::with_sandbox_image(vec![], "runner").is_err());
    }

    #[test]
    fn rejects_placeholder_digest() {
        assert!(ExecPolicy::with_sandbox_image(vec![], "runner@sha256:placeholder").is_err());
    }

    #[test]
    fn accepts_pinned_digest() {
        let digest = "a".repeat(64);
        let policy =
            ExecPolicy::with_sandbox_image(vec![], &format!("runner@sha256:{digest}")).unwrap();
        assert!(policy.sandbox_image().is_some());
    }

    #[test]
    fn sandbox_requires_image() {
        let executor = SecureExecutor::new(policy(&["echo"]));
        let mut cmd = echo_cmd(&["hi"]);
        cmd.sandbox = SandboxConfig::default();
        let err = executor.run(&cmd).unwrap_err();
        assert!(format!("{err}").contains("pinned container image"));
    }

    // -- container argv --

    #[test]
    fn container_argv_hardening_flags() {
        let mut cmd = echo_cmd(&["hi"]);
        cmd.sandbox = SandboxConfig::default();
        let digest = "b".repeat(64);
        let image = format!("runner@sha256:{digest}");
        let argv = container_argv(&cmd, &image);
        assert_eq!(argv[0], "docker");
        assert!(argv.contains(&"--cap-drop=ALL".to_owned()));
        assert!(argv.contains(&"--security-opt=no-new-privileges".to_owned()));
        assert!(argv.contains(&"--read-only".to_owned()));
        assert!(argv.contains(&"--network=none".to_owned()));
        assert!(argv.contains(&"--user=1000:1000".to_owned()));
        assert!(argv.contains(&image));
        assert_eq!(argv.last().unwrap(), "hi");
    }

    // -- timeout --

    #[test]
    fn kills_on_timeout() {
        let executor = SecureExecutor::new(policy(&["sleep"]));
        let cmd = SecureCommand::direct(
            "sleep",
            vec!["5".to_owned()],
            std::env::temp_dir(),
            Duration::from_millis(200),
        );
        let start = Instant::now();
        let err = executor.run(&cmd).unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn captures_exit_code() {
        let executor = SecureExecutor::new(policy(&["false"]));
        let cmd = SecureCommand::direct(
            "false",
            vec![],
            std::env::temp_dir(),
            Duration::from_secs(5),
        );
        let out = executor.run(&cmd).unwrap();
        assert_eq!(out.exit_code, 1);
    }
}
