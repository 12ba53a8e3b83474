//! The single seam through which every external tool is invoked.
//!
//! Block layer, inspector and migrator all funnel process spawning through
//! the [`Runner`] trait. The real implementation spawns processes; the
//! simulated backend in `dummy.rs` is a second implementation of the same
//! trait, so call sites carry no simulation branches.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// A fully described tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl ToolCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Captured result of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok() -> Self {
        Self {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a failed invocation into an error carrying the tool's stderr.
    pub fn expect_success(self, what: &str) -> Result<ToolOutput> {
        if self.success() {
            Ok(self)
        } else {
            anyhow::bail!(
                "{} failed (exit {}): {}",
                what,
                self.code,
                if self.stderr.trim().is_empty() {
                    self.stdout.trim()
                } else {
                    self.stderr.trim()
                }
            );
        }
    }
}

pub trait Runner: Send + Sync {
    /// Run a mutating tool. In dry-run mode the intent is logged and a
    /// successful empty output is returned without spawning anything.
    fn execute(&self, cmd: &ToolCommand) -> Result<ToolOutput>;

    /// Run a read-only tool. Always spawns, even in dry-run mode.
    fn query(&self, cmd: &ToolCommand) -> Result<ToolOutput>;

    /// Run a mutating tool, feeding each output line (split on `\n` or
    /// `\r`, so carriage-return progress counts) to `on_line` as it
    /// arrives.
    fn stream(&self, cmd: &ToolCommand, on_line: &mut dyn FnMut(&str)) -> Result<ToolOutput>;

    /// Completed I/O operations on a device since boot, if the platform
    /// exposes a counter. Used by the settling wait.
    fn io_completions(&self, device: &str) -> Option<u64>;

    /// Whether a tool resolves on PATH (or is provided by the simulation).
    fn has_tool(&self, name: &str) -> bool;

    fn is_dry_run(&self) -> bool {
        false
    }

    /// True for the simulated backend; host-environment checks are skipped.
    fn is_simulated(&self) -> bool {
        false
    }
}

/// Append-only record of every tool invocation and failure, one
/// timestamped line per event. Held open for the process lifetime; a log
/// that cannot be written must never sink a conversion, so write errors
/// are ignored.
struct CommandLog {
    sink: std::sync::Mutex<std::fs::File>,
}

impl CommandLog {
    fn open(path: &std::path::Path) -> Result<Self> {
        let sink = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open command log {}", path.display()))?;
        Ok(Self {
            sink: std::sync::Mutex::new(sink),
        })
    }

    fn note(&self, event: &str, detail: &str) {
        use std::io::Write;
        if let Ok(mut sink) = self.sink.lock() {
            let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
            let _ = writeln!(sink, "{stamp} {event:<5} {detail}");
        }
    }

    fn invocation(&self, channel: &str, cmd: &ToolCommand) {
        self.note(channel, &cmd.display());
    }

    fn failure(&self, cmd: &ToolCommand, out: &ToolOutput) {
        let stderr = out.stderr.trim();
        if stderr.is_empty() {
            self.note("fail", &format!("{} exited {}", cmd.program, out.code));
        } else {
            self.note(
                "fail",
                &format!("{} exited {}: {}", cmd.program, out.code, stderr),
            );
        }
    }
}

/// Spawns real processes, keeping a command log of every invocation and
/// failure for post-mortem analysis.
pub struct SystemRunner {
    dry_run: bool,
    log: Option<CommandLog>,
}

impl SystemRunner {
    pub fn new(dry_run: bool, log_file: Option<PathBuf>) -> Self {
        let log = log_file.as_deref().and_then(|path| match CommandLog::open(path) {
            Ok(log) => Some(log),
            Err(e) => {
                eprintln!("warning: {e:#}; continuing without a command log");
                None
            }
        });
        Self { dry_run, log }
    }

    fn log_invocation(&self, channel: &str, cmd: &ToolCommand) {
        if let Some(log) = &self.log {
            log.invocation(channel, cmd);
        }
    }

    fn log_failure(&self, cmd: &ToolCommand, out: &ToolOutput) {
        if let Some(log) = &self.log {
            log.failure(cmd, out);
        }
    }

    fn spawn(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if cmd.stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", cmd.program))?;

        if let Some(input) = &cmd.stdin {
            use std::io::Write;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        let result = ToolOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            self.log_failure(cmd, &result);
        }

        Ok(result)
    }

    fn print_dry_run(&self, cmd: &ToolCommand) {
        if let Some(input) = &cmd.stdin {
            println!(
                "[DRY RUN] echo '{}' | {}",
                input.trim().replace('\n', "\\n"),
                cmd.display()
            );
        } else {
            println!("[DRY RUN] {}", cmd.display());
        }
    }
}

impl Runner for SystemRunner {
    fn execute(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        self.log_invocation("run", cmd);
        if self.dry_run {
            self.print_dry_run(cmd);
            return Ok(ToolOutput::ok());
        }
        self.spawn(cmd)
    }

    fn query(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        self.log_invocation("query", cmd);
        self.spawn(cmd)
    }

    fn stream(&self, cmd: &ToolCommand, on_line: &mut dyn FnMut(&str)) -> Result<ToolOutput> {
        self.log_invocation("run", cmd);
        if self.dry_run {
            self.print_dry_run(cmd);
            return Ok(ToolOutput::ok());
        }

        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if cmd.stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", cmd.program))?;

        if let Some(input) = &cmd.stdin {
            use std::io::Write;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        // stderr drains on a thread so a chatty tool cannot deadlock
        // against the stdout reader.
        let stderr = child.stderr.take();
        let stderr_handle = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let mut collected = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            let mut pending = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stdout.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                for &byte in &chunk[..n] {
                    if byte == b'\n' || byte == b'\r' {
                        if !pending.is_empty() {
                            let line = String::from_utf8_lossy(&pending).into_owned();
                            on_line(&line);
                            collected.push_str(&line);
                            collected.push('\n');
                            pending.clear();
                        }
                    } else {
                        pending.push(byte);
                    }
                }
            }
            if !pending.is_empty() {
                let line = String::from_utf8_lossy(&pending).into_owned();
                on_line(&line);
                collected.push_str(&line);
            }
        }

        let status = child.wait()?;
        let stderr_text = stderr_handle.join().unwrap_or_default();
        let result = ToolOutput {
            code: status.code().unwrap_or(-1),
            stdout: collected,
            stderr: stderr_text,
        };
        if !result.success() {
            self.log_failure(cmd, &result);
        }
        Ok(result)
    }

    fn io_completions(&self, device: &str) -> Option<u64> {
        // /sys/block/<base>/stat fields: reads completed is the first
        // column, writes completed the fifth.
        let base = device.trim_start_matches("/dev/").replace('/', "!");
        let stat = std::fs::read_to_string(format!("/sys/block/{}/stat", base)).ok()?;
        let fields: Vec<u64> = stat
            .split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect();
        match (fields.first(), fields.get(4)) {
            (Some(reads), Some(writes)) => Some(reads + writes),
            _ => None,
        }
    }

    fn has_tool(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_does_not_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let runner = SystemRunner::new(true, None);
        let cmd = ToolCommand::new("touch", [marker.to_string_lossy().to_string()]);
        let out = runner.execute(&cmd).unwrap();
        assert!(out.success());
        assert!(!marker.exists(), "dry run must not touch the filesystem");
    }

    #[test]
    fn test_query_runs_even_in_dry_run() {
        let runner = SystemRunner::new(true, None);
        let out = runner.query(&ToolCommand::new("echo", ["hello"])).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_stdin_is_delivered() {
        let runner = SystemRunner::new(false, None);
        let out = runner
            .query(&ToolCommand::new("cat", Vec::<String>::new()).with_stdin("payload"))
            .unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[test]
    fn test_stream_splits_on_carriage_return() {
        let runner = SystemRunner::new(false, None);
        let mut lines = Vec::new();
        let cmd = ToolCommand::new("printf", ["one\\rtwo\\nthree"]);
        runner.stream(&cmd, &mut |l| lines.push(l.to_string())).unwrap();
        assert_eq!(lines, ["one", "two", "three"]);
    }

    #[test]
    fn test_command_log_records_invocations_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("commands.log");
        let runner = SystemRunner::new(false, Some(log_path.clone()));
        let out = runner
            .query(&ToolCommand::new("false", Vec::<String>::new()))
            .unwrap();
        assert!(!out.success());

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("query"), "invocation recorded: {content}");
        assert!(content.contains("false exited 1"), "failure recorded: {content}");
    }

    #[test]
    fn test_expect_success_carries_stderr() {
        let out = ToolOutput {
            code: 3,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        let err = out.expect_success("test op").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
