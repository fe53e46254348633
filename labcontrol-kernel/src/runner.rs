/**
 * PROCESS RUNNER - Exécution des commandes externes du labo
 *
 * RÔLE :
 * Lance les commandes issues des templates, en synchrone avec délai maximal
 * ou en détaché (captures, webterms) suivies par fichiers PID.
 *
 * FONCTIONNEMENT :
 * - Exec direct d'un argv, aucun shell sauf si le template en nomme un
 * - Détaché = nouvelle session, stdout/stderr redirigés vers `<run>/<clé>.*`
 * - `claim` réserve atomiquement `<clé>.pid` avant le lancement
 * - Arrêt : SIGTERM avec attente croissante, puis SIGKILL
 *
 * LIMITE CONNUE :
 * Un fichier PID peut survivre à son processus et désigner un pid réutilisé.
 */

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::LabConfig;
use crate::error::{LabError, LabResult, TemplateError};

/// Lexed command, ready to exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<String>,
}

impl CommandLine {
    /// Splits a trusted command string with shell quoting rules, no expansion
    pub fn parse(cmd: &str) -> LabResult<Self> {
        let argv = shell_words::split(cmd).map_err(|e| TemplateError::Lex(e.to_string()))?;
        Self::from_argv(argv)
    }

    pub fn from_argv(argv: Vec<String>) -> LabResult<Self> {
        if argv.first().map_or(true, |a| a.is_empty()) {
            return Err(TemplateError::Lex("empty command".into()).into());
        }
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_words::join(&self.argv))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Non-zero exit becomes `LabError::Execution`
    pub fn into_result(self) -> LabResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(LabError::Execution {
            command: self.command,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Content of a PID file: the pid and, for captures, the data file it writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    pub pid: i32,
    pub data_path: Option<PathBuf>,
}

impl PidFile {
    fn render(&self) -> String {
        match &self.data_path {
            Some(p) => format!("{}\n{}\n", self.pid, p.display()),
            None => format!("{}\n", self.pid),
        }
    }

    fn parse(path: &Path, content: &str) -> LabResult<Self> {
        let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
        let pid = lines
            .next()
            .and_then(|l| l.parse::<i32>().ok())
            .filter(|pid| *pid > 1)
            .ok_or_else(|| LabError::invalid("pid file", format!("{} has no valid pid", path.display())))?;
        Ok(Self {
            pid,
            data_path: lines.next().map(PathBuf::from),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    utils_dir: PathBuf,
    run_dir: PathBuf,
    kill_retries: u32,
    kill_backoff: Duration,
}

impl ProcessRunner {
    pub fn new(config: &LabConfig) -> Self {
        Self {
            utils_dir: config.utils_dir(),
            run_dir: config.run_dir(),
            kill_retries: config.kill_retries,
            kill_backoff: Duration::from_millis(config.kill_backoff_ms.max(1)),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Bare program names found in the utils directory are replaced by that path
    pub fn resolve(&self, cmd: &CommandLine) -> CommandLine {
        let program = cmd.program();
        if program.contains('/') {
            return cmd.clone();
        }
        let candidate = self.utils_dir.join(program);
        if !candidate.is_file() {
            return cmd.clone();
        }
        let mut argv = cmd.argv.clone();
        argv[0] = candidate.to_string_lossy().into_owned();
        CommandLine { argv }
    }

    /// Runs to completion within `timeout`; the child is killed when the deadline passes
    pub async fn run_sync(&self, cmd: &CommandLine, timeout: Duration) -> LabResult<ExecutionResult> {
        let cmd = self.resolve(cmd);
        let cmd_line = cmd.to_string();
        debug!(command = %cmd_line, timeout_secs = timeout.as_secs(), "running command");

        let started = Instant::now();
        let mut command = Command::new(cmd.program());
        command
            .args(&cmd.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => {
                warn!(command = %cmd_line, timeout_secs = timeout.as_secs(), "command timed out, killed");
                return Err(LabError::Timeout {
                    command: cmd_line,
                    seconds: timeout.as_secs(),
                });
            }
            Ok(Err(e)) => {
                return Err(LabError::Execution {
                    command: cmd_line,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("spawn failed: {e}"),
                })
            }
            Ok(Ok(output)) => output,
        };

        let result = ExecutionResult {
            command: cmd_line,
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: started.elapsed(),
        };
        debug!(command = %result.command, exit_code = ?result.exit_code, elapsed_ms = result.elapsed.as_millis() as u64, "command finished");
        Ok(result)
    }

    pub fn pid_path(&self, key: &str) -> PathBuf {
        self.run_dir.join(format!("{key}.pid"))
    }

    pub fn stdout_path(&self, key: &str) -> PathBuf {
        self.run_dir.join(format!("{key}.stdout"))
    }

    pub fn stderr_path(&self, key: &str) -> PathBuf {
        self.run_dir.join(format!("{key}.stderr"))
    }

    /// Reserves `<key>.pid` by creating it empty; false when it already exists.
    /// A claimed key stays unusable for others until `run_async` fills it in
    /// or `cleanup` removes it.
    pub fn claim(&self, key: &str) -> LabResult<bool> {
        crate::store::validate_name("key", key)?;
        std::fs::create_dir_all(&self.run_dir).map_err(|e| LabError::io(&self.run_dir, e))?;
        let path = self.pid_path(key);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(LabError::io(&path, e)),
        }
    }

    /// Spawns a detached process (own session) with output redirected to
    /// `<key>.stdout` / `<key>.stderr` and records it in `<key>.pid`.
    /// On failure the run files of `key`, a claimed PID file included, are removed.
    pub async fn run_async(
        &self,
        key: &str,
        cmd: &CommandLine,
        data_path: Option<&Path>,
    ) -> LabResult<i32> {
        crate::store::validate_name("key", key)?;
        let result = self.spawn_detached(key, cmd, data_path).await;
        if result.is_err() {
            self.cleanup(key);
        }
        result
    }

    async fn spawn_detached(
        &self,
        key: &str,
        cmd: &CommandLine,
        data_path: Option<&Path>,
    ) -> LabResult<i32> {
        let cmd = self.resolve(cmd);
        let cmd_line = cmd.to_string();

        std::fs::create_dir_all(&self.run_dir).map_err(|e| LabError::io(&self.run_dir, e))?;
        let stdout_path = self.stdout_path(key);
        let stderr_path = self.stderr_path(key);
        let stdout = File::create(&stdout_path).map_err(|e| LabError::io(&stdout_path, e))?;
        let stderr = File::create(&stderr_path).map_err(|e| LabError::io(&stderr_path, e))?;

        let mut command = Command::new(cmd.program());
        command
            .args(&cmd.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // SAFETY: setsid is async-signal-safe and touches no parent state. A new
        // session rather than process_group(0) detaches the child from the
        // server's controlling terminal as well as its process group.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = command.spawn().map_err(|e| LabError::Execution {
            command: cmd_line.clone(),
            exit_code: None,
            stdout: String::new(),
            stderr: format!("spawn failed: {e}"),
        })?;
        let pid = child
            .id()
            .map(|id| id as i32)
            .ok_or_else(|| LabError::ProcessControl {
                pid: 0,
                reason: "spawned process exited before its pid was read".into(),
            })?;

        let pid_file = PidFile {
            pid,
            data_path: data_path.map(Path::to_path_buf),
        };
        let pid_path = self.pid_path(key);
        if let Err(e) = std::fs::write(&pid_path, pid_file.render()) {
            let _ = child.start_kill();
            return Err(LabError::io(&pid_path, e));
        }
        info!(key, pid, command = %cmd_line, "detached process started");

        let key = key.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(key, pid, %status, "detached process exited"),
                Err(e) => warn!(key, pid, error = %e, "waiting for detached process failed"),
            }
        });
        Ok(pid)
    }

    pub fn read_pid_file(&self, key: &str) -> LabResult<Option<PidFile>> {
        let path = self.pid_path(key);
        match std::fs::read_to_string(&path) {
            // claimed, process not spawned yet
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => PidFile::parse(&path, &content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LabError::io(&path, e)),
        }
    }

    /// Removes the PID file and transient output files of `key`
    pub fn cleanup(&self, key: &str) {
        for path in [self.pid_path(key), self.stdout_path(key), self.stderr_path(key)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove run file"),
            }
        }
    }

    /// SIGTERM with doubling backoff, then SIGKILL; a survivor is an error
    pub async fn kill(&self, pid: i32) -> LabResult<()> {
        if pid <= 1 {
            return Err(LabError::ProcessControl {
                pid,
                reason: "refusing to signal a non-process pid".into(),
            });
        }
        if !is_alive(pid) {
            debug!(pid, "process already gone");
            return Ok(());
        }

        send_signal(pid, Signal::SIGTERM);
        let mut delay = self.kill_backoff;
        for _ in 0..self.kill_retries {
            tokio::time::sleep(delay).await;
            if !is_alive(pid) {
                info!(pid, "process terminated");
                return Ok(());
            }
            delay = delay.saturating_mul(2);
        }

        warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        send_signal(pid, Signal::SIGKILL);
        for _ in 0..self.kill_retries.max(1) {
            tokio::time::sleep(self.kill_backoff).await;
            if !is_alive(pid) {
                info!(pid, "process killed");
                return Ok(());
            }
        }

        error!(pid, "process still running after SIGKILL");
        Err(LabError::ProcessControl {
            pid,
            reason: "kill escalation exhausted".into(),
        })
    }
}

/// Signals the process group when `pid` leads one, the process otherwise
fn send_signal(pid: i32, sig: Signal) {
    let target = Pid::from_raw(pid);
    if signal::killpg(target, sig).is_ok() {
        return;
    }
    if let Err(e) = signal::kill(target, sig) {
        if e != Errno::ESRCH {
            warn!(pid, signal = sig.as_str(), error = %e, "signal delivery failed");
        }
    }
}

/// True when `pid` exists and is not a zombie
pub fn is_alive(pid: i32) -> bool {
    if pid <= 1 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map_or(true, |state| state != 'Z' && state != 'X'),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn runner(dir: &Path) -> ProcessRunner {
        let mut cfg = LabConfig::with_base_dir(dir);
        cfg.kill_backoff_ms = 20;
        ProcessRunner::new(&cfg)
    }

    #[tokio::test]
    async fn run_sync_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());

        let ok = r
            .run_sync(&CommandLine::parse("echo 'hello world'").unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout, "hello world\n");

        let failed = r
            .run_sync(&CommandLine::parse("sh -c 'echo oops >&2; exit 3'").unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(failed.exit_code, Some(3));
        let err = failed.into_result().unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn run_sync_decodes_invalid_utf8_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        let res = r
            .run_sync(&CommandLine::parse(r"sh -c 'printf \\377ok'").unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(res.stdout.ends_with("ok"));
        assert!(res.stdout.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn run_sync_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        let started = Instant::now();
        let err = r
            .run_sync(&CommandLine::parse("sleep 30").unwrap(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        let err = r
            .run_sync(&CommandLine::parse("definitely-not-a-program-xyz").unwrap(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution");
    }

    #[tokio::test]
    async fn bare_names_resolve_through_utils_dir() {
        let dir = tempfile::tempdir().unwrap();
        let utils = dir.path().join("utils");
        std::fs::create_dir_all(&utils).unwrap();
        let script = utils.join("pdu-ctl");
        std::fs::write(&script, "#!/bin/sh\necho \"pdu $1\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let r = runner(dir.path());
        let cmd = CommandLine::parse("pdu-ctl on").unwrap();
        assert_eq!(r.resolve(&cmd).program(), script.to_str().unwrap());
        let res = r.run_sync(&cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(res.stdout, "pdu on\n");

        let untouched = CommandLine::parse("echo hi").unwrap();
        assert_eq!(r.resolve(&untouched), untouched);
    }

    #[tokio::test]
    async fn detached_process_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        let data = dir.path().join("out.txt");
        let cmd = CommandLine::parse("sh -c 'echo started; exec sleep 30'").unwrap();

        let pid = r.run_async("serial0-tok", &cmd, Some(&data)).await.unwrap();
        assert!(is_alive(pid));
        let pid_file = r.read_pid_file("serial0-tok").unwrap().unwrap();
        assert_eq!(pid_file.pid, pid);
        assert_eq!(pid_file.data_path.as_deref(), Some(data.as_path()));

        r.kill(pid).await.unwrap();
        assert!(!is_alive(pid));
        r.cleanup("serial0-tok");
        assert!(r.read_pid_file("serial0-tok").unwrap().is_none());
        assert!(!r.stdout_path("serial0-tok").exists());
    }

    #[tokio::test]
    async fn sigterm_resistant_process_gets_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        let cmd = CommandLine::parse("sh -c 'trap \"\" TERM; while true; do sleep 1; done'").unwrap();
        let pid = r.run_async("stubborn", &cmd, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        r.kill(pid).await.unwrap();
        assert!(!is_alive(pid));
        r.cleanup("stubborn");
    }

    #[test]
    fn empty_commands_are_rejected() {
        assert!(CommandLine::parse("   ").is_err());
        assert!(CommandLine::parse("echo 'unterminated").is_err());
    }

    #[test]
    fn pid_file_parsing() {
        let p = Path::new("x.pid");
        let parsed = PidFile::parse(p, "4242\n/tmp/data.txt\n").unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.data_path, Some(PathBuf::from("/tmp/data.txt")));
        assert!(PidFile::parse(p, "garbage").is_err());
        assert!(PidFile::parse(p, "1\n").is_err());
    }

    #[tokio::test]
    async fn claimed_keys_are_exclusive_until_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());

        assert!(r.claim("serial0-t1").unwrap());
        assert!(!r.claim("serial0-t1").unwrap());
        assert_eq!(r.read_pid_file("serial0-t1").unwrap(), None);

        let err = r
            .run_async("serial0-t1", &CommandLine::parse("/nonexistent/tool").unwrap(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(!r.pid_path("serial0-t1").exists());
        assert!(r.claim("serial0-t1").unwrap());
    }
}
