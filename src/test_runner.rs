//! Test runner worker
//!
//! The single consumer of the execution queue. Each request becomes one
//! invocation of the external test command; its output is streamed, the
//! failure lines are parsed, and the failures seed the next run's
//! retry-first decision.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Instant;

use chrono::Local;
use colored::Colorize;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::errors::RunError;
use crate::queue::{ExecutionQueue, PendingRequest};
use crate::test_model::{FailureMode, FailureRecord, RunResult};

/// `MODE: name (qualified.test.path)`
static FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(ERROR|FAIL): (\S+) \(([^)]*)\)").expect("hardcoded failure regex")
});

/// A recognised line of runner output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Failure(FailureRecord),
    /// The named test could not be loaded at all
    Disappeared(String),
}

/// Parse one stderr line; `marker` identifies load failures.
pub fn parse_failure_line(line: &str, marker: &str) -> Option<ParsedLine> {
    let caps = FAILURE_RE.captures(line)?;
    let mode = FailureMode::parse(&caps[1])?;
    let name = &caps[2];
    let qualified = &caps[3];

    if !marker.is_empty() && line.contains(marker) {
        return Some(ParsedLine::Disappeared(name.to_string()));
    }

    // Older runners print the class path only, newer ones include the method
    let test = if qualified == name || qualified.ends_with(&format!(".{}", name)) {
        qualified.to_string()
    } else {
        format!("{}.{}", qualified, name)
    };

    Some(ParsedLine::Failure(FailureRecord { mode, test }))
}

/// Apply the retry-first policy to a dequeued request.
///
/// After a run with failures or disappeared tests, an identifier request is
/// replaced by the previous run's failed identifiers. Pattern requests are
/// never rewritten.
pub fn plan_invocation(request: PendingRequest, last: Option<&RunResult>) -> PendingRequest {
    match request {
        PendingRequest::Pattern(patterns) => PendingRequest::Pattern(patterns),
        PendingRequest::Identifiers(ids) => {
            let Some(last) = last.filter(|r| r.wants_retry()) else {
                return PendingRequest::Identifiers(ids);
            };

            let failed = last.failed_identifiers();
            if failed.is_empty() {
                // Only disappeared tests: nothing concrete to retry
                return PendingRequest::Identifiers(ids);
            }

            tracing::info!(
                retrying = failed.len(),
                skipped = ids.len(),
                "previous run failed, retrying failures first"
            );
            PendingRequest::Identifiers(failed.into_iter().collect())
        }
    }
}

/// Arguments after the runner program for one request
pub fn build_args(runner: &RunnerConfig, request: &PendingRequest) -> Vec<String> {
    let mut args: Vec<String> = runner.cmd.iter().skip(1).cloned().collect();
    args.push(runner.subcommand.clone());

    match request {
        PendingRequest::Identifiers(ids) => args.extend(ids.iter().cloned()),
        PendingRequest::Pattern(patterns) => {
            for pattern in patterns {
                args.push(runner.pattern_flag.clone());
                args.push(pattern.clone());
            }
        }
    }

    args
}

/// How an invocation ended
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunResult),
    /// Shutdown was requested mid-run and the process was killed
    Terminated,
}

/// Test runner worker
pub struct TestRunnerWorker {
    root: PathBuf,
    runner: RunnerConfig,
    queue: ExecutionQueue,
    last: Option<RunResult>,
    echo: bool,
}

impl TestRunnerWorker {
    pub fn new(root: &Path, runner: RunnerConfig, queue: ExecutionQueue) -> Self {
        Self {
            root: root.to_path_buf(),
            runner,
            queue,
            last: None,
            echo: true,
        }
    }

    /// Disable forwarding of the runner's output to this process
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn last_result(&self) -> Option<&RunResult> {
        self.last.as_ref()
    }

    /// Consume requests until `shutdown` flips to true (or its sender goes
    /// away). A run in flight at that point is killed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let request = tokio::select! {
                request = self.queue.pop() => request,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match self.run_once(request, &mut shutdown).await {
                Ok(RunOutcome::Completed(_)) => {}
                Ok(RunOutcome::Terminated) => {
                    println!("\n{} Test run aborted", "!".yellow());
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "{}", failure_context(&e));
                    eprintln!("{} {}", "✗".red(), e);
                }
            }

            println!("\n{}", "Watching for changes...".dimmed());
        }

        tracing::debug!("test runner worker stopped");
    }

    /// Plan, execute and record a single request
    pub async fn run_once(
        &mut self,
        request: PendingRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunOutcome, RunError> {
        let plan = plan_invocation(request, self.last.as_ref());
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", id = %run_id);

        let outcome = self.execute(&plan, shutdown).instrument(span).await?;

        if let RunOutcome::Completed(ref result) = outcome {
            print_summary(result);
            self.last = Some(result.clone());
        }

        Ok(outcome)
    }

    /// Launch the runner for `request` and collect its result
    pub async fn execute(
        &self,
        request: &PendingRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunOutcome, RunError> {
        let start = Instant::now();
        let program = self.runner.cmd.first().ok_or_else(|| RunError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty runner command"),
        })?;
        let args = build_args(&self.runner, request);

        println!(
            "\n{} {} {}",
            "→".blue(),
            format!("[{}]", Local::now().format("%H:%M:%S")).dimmed(),
            describe(request).bold()
        );
        tracing::info!(program = %program, args = ?args, "starting test run");

        let mut child = Command::new(program)
            .args(&args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(RunError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(RunError::MissingPipe("stderr"))?;
        let marker = self.runner.failed_marker.as_str();

        let streams = async {
            tokio::join!(
                forward_output(stdout, self.echo),
                collect_failures(stderr, marker, self.echo)
            )
        };

        let (stdout_lines, (failures, disappeared)) = tokio::select! {
            streams = streams => streams,
            _ = wait_for_shutdown(shutdown) => {
                tracing::warn!("shutdown requested, killing test process");
                child.kill().await?;
                return Ok(RunOutcome::Terminated);
            }
        };

        let status = child.wait().await?;

        tracing::debug!(stdout_lines, failures = failures.len(), "test output collected");

        Ok(RunOutcome::Completed(RunResult {
            failures,
            disappeared,
            exit_code: status.code(),
            duration_ms: start.elapsed().as_millis() as u64,
        }))
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown too
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Short log message for a run that produced no result
fn failure_context(err: &RunError) -> &'static str {
    match err {
        RunError::Spawn { .. } | RunError::MissingPipe(_) => "test run could not be started",
        RunError::Io(_) => "test run did not complete",
    }
}

/// Next line of `reader` without its terminator, invalid UTF-8 replaced.
/// `None` at end of stream.
async fn next_lossy_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(|c: char| c == '\n' || c == '\r').to_string()))
}

/// Echo stdout as it arrives; returns the number of lines seen
async fn forward_output<R: AsyncRead + Unpin>(stream: R, echo: bool) -> usize {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut count = 0;

    loop {
        match next_lossy_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if echo {
                    println!("{}", line);
                }
                count += 1;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stopped reading runner stdout");
                break;
            }
        }
    }

    count
}

/// Echo stderr and parse every line for failures and load errors.
/// A read error ends collection but keeps what was parsed so far.
async fn collect_failures<R: AsyncRead + Unpin>(
    stream: R,
    marker: &str,
    echo: bool,
) -> (Vec<FailureRecord>, Vec<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut failures = Vec::new();
    let mut disappeared = Vec::new();

    loop {
        let line = match next_lossy_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stopped reading runner stderr");
                break;
            }
        };
        if echo {
            eprintln!("{}", line);
        }
        match parse_failure_line(&line, marker) {
            Some(ParsedLine::Failure(record)) => failures.push(record),
            Some(ParsedLine::Disappeared(name)) => disappeared.push(name),
            None => {}
        }
    }

    (failures, disappeared)
}

fn describe(request: &PendingRequest) -> String {
    match request {
        PendingRequest::Identifiers(ids) if ids.is_empty() => "Running all tests".to_string(),
        PendingRequest::Identifiers(ids) => format!(
            "Running {} target(s): {}",
            ids.len(),
            ids.iter().cloned().collect::<Vec<_>>().join(" ")
        ),
        PendingRequest::Pattern(patterns) => {
            format!("Running tests matching: {}", patterns.join(", "))
        }
    }
}

fn print_summary(result: &RunResult) {
    println!("{}", "─".repeat(50).dimmed());

    if !result.is_failed() {
        println!(
            "{} All tests passed ({}ms)",
            "✓".green().bold(),
            result.duration_ms
        );
        return;
    }

    let exit = result
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());

    println!(
        "{} {} failed, {} errors, {} disappeared, exit {} ({}ms)",
        "✗".red().bold(),
        result.count(FailureMode::Fail).to_string().red(),
        result.count(FailureMode::Error).to_string().red(),
        result.disappeared.len().to_string().yellow(),
        exit,
        result.duration_ms
    );

    for failure in &result.failures {
        println!("  {} {} {}", "•".red(), failure.mode.as_str().red(), failure.test);
    }
    for name in &result.disappeared {
        println!("  {} {} {}", "•".yellow(), "GONE".yellow(), name);
    }

    tracing::warn!(
        failures = result.failures.len(),
        disappeared = result.disappeared.len(),
        exit_code = ?result.exit_code,
        "test run failed"
    );
}
