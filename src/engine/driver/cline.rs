use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};

use super::parser::{AddressChain, LineParser, extract_json_object, extract_task_summary};
use super::{AgentDriver, EventStream};
use crate::config::AgentSection;
use crate::engine::models::{
    Credentials, InstanceHandle, RunEvent, RunEventType, TaskMode, ToolResponse, describe_duration,
};
use crate::errors::DriverError;

/// Captured output is cut to this many characters in error messages.
const OUTPUT_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct ClineConfig {
    pub command: String,
    /// Bound on each output line read, both at startup and while following.
    pub read_timeout: Duration,
    /// How many startup lines to scan for the instance address.
    pub startup_line_limit: usize,
    /// Bound on one-shot commands (auth, submit, send, pause, kill).
    pub command_timeout: Duration,
}

impl Default for ClineConfig {
    fn default() -> Self {
        Self {
            command: "cline".to_string(),
            read_timeout: Duration::from_secs(30),
            startup_line_limit: 50,
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl ClineConfig {
    pub fn from_section(agent: &AgentSection, command: String) -> Self {
        Self {
            command,
            read_timeout: Duration::from_secs(agent.read_timeout_secs),
            startup_line_limit: agent.startup_line_limit,
            command_timeout: Duration::from_secs(agent.command_timeout_secs),
        }
    }
}

/// Runs one-shot CLI invocations with a timeout.
#[derive(Clone)]
struct CliRunner {
    command: String,
    timeout: Duration,
}

impl CliRunner {
    /// Command name plus subcommand, safe to log (never includes arguments).
    fn describe(&self, args: &[&str]) -> String {
        let sub: Vec<&str> = args.iter().take(2).copied().collect();
        format!("{} {}", self.command, sub.join(" "))
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<Output, DriverError> {
        let description = self.describe(args);
        let mut cmd = Command::new(&self.command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(DriverError::Spawn {
                command: description,
                source,
            }),
            Err(_) => Err(DriverError::Command {
                command: description,
                message: format!("timed out after {}", describe_duration(self.timeout)),
            }),
        }
    }

    /// Run and require a zero exit status.
    async fn run_checked(&self, cwd: &Path, args: &[&str]) -> Result<Output, DriverError> {
        let output = self.run(cwd, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(DriverError::Command {
                command: self.describe(args),
                message: failure_text(&output),
            })
        }
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(OUTPUT_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() { stdout } else { stderr };
    match output.status.code() {
        Some(code) => format!("exit code {}: {}", code, excerpt(&detail)),
        None => format!("terminated by signal: {}", excerpt(&detail)),
    }
}

/// The long-lived `instance new` process and where it runs.
struct InstanceProcess {
    child: Option<Child>,
    workspace: PathBuf,
    /// Mode of the current task. A completion marker only finishes an
    /// autonomous task; in plan mode it is the proposed plan.
    mode: TaskMode,
}

/// Drives the `cline` CLI. One instance process per run, tracked by address.
pub struct ClineDriver {
    config: ClineConfig,
    runner: CliRunner,
    addresses: AddressChain,
    parser: Arc<LineParser>,
    instances: Arc<Mutex<HashMap<InstanceHandle, InstanceProcess>>>,
}

impl ClineDriver {
    pub fn new(config: ClineConfig) -> Self {
        let runner = CliRunner {
            command: config.command.clone(),
            timeout: config.command_timeout,
        };
        Self {
            config,
            runner,
            addresses: AddressChain::default(),
            parser: Arc::new(LineParser::default()),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn workspace_of(&self, instance: &InstanceHandle) -> Result<PathBuf, DriverError> {
        self.instances
            .lock()
            .await
            .get(instance)
            .map(|p| p.workspace.clone())
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))
    }

    /// Fetch the finished task's result text from the non-following view.
    pub async fn task_summary(&self, instance: &InstanceHandle) -> Result<String, DriverError> {
        let workspace = self.workspace_of(instance).await?;
        fetch_summary(&self.runner, &workspace, instance).await
    }

    async fn set_mode(&self, instance: &InstanceHandle, mode: TaskMode) {
        if let Some(process) = self.instances.lock().await.get_mut(instance) {
            process.mode = mode;
        }
    }

    async fn send(&self, instance: &InstanceHandle, args: &[&str]) -> Result<(), DriverError> {
        let workspace = self.workspace_of(instance).await?;
        self.runner.run_checked(&workspace, args).await?;
        Ok(())
    }
}

async fn fetch_summary(
    runner: &CliRunner,
    workspace: &Path,
    instance: &InstanceHandle,
) -> Result<String, DriverError> {
    let output = runner
        .run_checked(
            workspace,
            &["task", "view", "--output-format", "plain", "--address", instance.as_str()],
        )
        .await?;
    Ok(extract_task_summary(&String::from_utf8_lossy(&output.stdout)))
}

/// Forward every line of a pipe into `tx` until EOF.
fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Keep reading a pipe so the child never blocks on a full buffer.
fn spawn_drain<R>(reader: R, address: String, pipe: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!(instance = %address, pipe, "{}", line);
        }
    });
}

struct FollowState {
    child: Child,
    rx: mpsc::Receiver<String>,
    parser: Arc<LineParser>,
    read_timeout: Duration,
    runner: CliRunner,
    workspace: PathBuf,
    instance: InstanceHandle,
    mode: TaskMode,
    finished: bool,
}

impl FollowState {
    async fn next_event(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        loop {
            match tokio::time::timeout(self.read_timeout, self.rx.recv()).await {
                Err(_) => {
                    self.finished = true;
                    let _ = self.child.start_kill();
                    tracing::warn!(
                        instance = %self.instance,
                        timeout_ms = self.read_timeout.as_millis() as u64,
                        "agent output stalled"
                    );
                    return Some(RunEvent::stream_timeout(self.read_timeout));
                }
                Ok(Some(line)) => {
                    let Some(event) = self.parser.parse_line(&line) else {
                        continue;
                    };
                    // `task view --follow` never exits on its own once the
                    // task is done, so the marker has to end the session.
                    if self.mode == TaskMode::Autonomous
                        && event.event_type == RunEventType::TaskResponse
                    {
                        self.finished = true;
                        let _ = self.child.start_kill();
                        return Some(self.completion_event(event).await);
                    }
                    if event.event_type.is_closing() {
                        self.finished = true;
                        let _ = self.child.start_kill();
                    }
                    return Some(event);
                }
                Ok(None) => {
                    self.finished = true;
                    return Some(self.exit_event().await);
                }
            }
        }
    }

    /// The `complete` event for a finished autonomous task.
    async fn completion_event(&self, marker: RunEvent) -> RunEvent {
        match fetch_summary(&self.runner, &self.workspace, &self.instance).await {
            Ok(summary) => RunEvent::complete(summary),
            Err(e) => {
                tracing::warn!(instance = %self.instance, error = %e, "could not fetch task summary");
                // JSON completion results carry the text themselves.
                let message = if marker.payload.is_some() && !marker.message.trim().is_empty() {
                    marker.message
                } else {
                    "Task completed successfully".to_string()
                };
                RunEvent::complete(message)
            }
        }
    }

    async fn exit_event(&mut self) -> RunEvent {
        match self.child.wait().await {
            Ok(status) if status.success() => {
                match fetch_summary(&self.runner, &self.workspace, &self.instance).await {
                    Ok(summary) => RunEvent::complete(summary),
                    Err(e) => {
                        tracing::warn!(instance = %self.instance, error = %e, "could not fetch task summary");
                        RunEvent::complete("Task completed successfully")
                    }
                }
            }
            Ok(status) => match status.code() {
                Some(code) => RunEvent::error(format!("Task failed with exit code {}", code))
                    .with_payload(serde_json::json!({"exit_code": code})),
                None => RunEvent::error("Task output process was terminated by a signal"),
            },
            Err(e) => RunEvent::error(format!("Failed to wait for task output process: {}", e)),
        }
    }
}

#[async_trait]
impl AgentDriver for ClineDriver {
    async fn create_instance(&self, workspace: &Path) -> Result<InstanceHandle, DriverError> {
        let description = format!("{} instance new", self.config.command);
        tracing::info!(workspace = %workspace.display(), "creating agent instance");

        let mut child = Command::new(&self.config.command)
            .args(["instance", "new"])
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DriverError::Spawn {
                command: description.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| DriverError::Command {
            command: description.clone(),
            message: "stdout was not captured".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let mut captured = String::new();
        let mut address = None;

        for _ in 0..self.config.startup_line_limit {
            match tokio::time::timeout(self.config.read_timeout, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    tracing::debug!("instance new: {}", line);
                    captured.push_str(&line);
                    captured.push('\n');
                    if let Some(found) = self.addresses.parse(&line) {
                        address = Some(found);
                        break;
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    captured.push_str(&format!("<read error: {}>", e));
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.config.read_timeout.as_millis() as u64,
                        "timed out waiting for instance output"
                    );
                    break;
                }
            }
        }

        let Some(address) = address else {
            let _ = child.kill().await;
            if let Some(mut stderr) = child.stderr.take() {
                let mut err_text = String::new();
                let read = tokio::io::AsyncReadExt::read_to_string(&mut stderr, &mut err_text);
                if tokio::time::timeout(Duration::from_secs(1), read).await.is_ok() {
                    captured.push_str(&err_text);
                }
            }
            return Err(DriverError::InstanceCreation {
                output: excerpt(&captured),
            });
        };

        spawn_drain(lines.into_inner(), address.clone(), "stdout");
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(stderr, address.clone(), "stderr");
        }

        let handle = InstanceHandle(address);
        tracing::info!(instance = %handle, "agent instance started");
        self.instances.lock().await.insert(
            handle.clone(),
            InstanceProcess {
                child: Some(child),
                workspace: workspace.to_path_buf(),
                mode: TaskMode::Plan,
            },
        );
        Ok(handle)
    }

    async fn configure_auth(
        &self,
        instance: &InstanceHandle,
        credentials: &Credentials,
    ) -> Result<(), DriverError> {
        let workspace = self.workspace_of(instance).await?;
        tracing::info!(
            instance = %instance,
            provider = %credentials.provider,
            model = %credentials.model_id,
            "configuring agent auth"
        );

        let mut args = vec![
            "auth",
            "--provider",
            credentials.provider.as_str(),
            "--apikey",
            credentials.api_key.as_str(),
            "--modelid",
            credentials.model_id.as_str(),
            "--output-format",
            "json",
        ];
        if let Some(base_url) = &credentials.base_url {
            args.extend(["--baseurl", base_url.as_str()]);
        }

        let output = self
            .runner
            .run(&workspace, &args)
            .await
            .map_err(|e| DriverError::AuthConfiguration(e.to_string()))?;
        if !output.status.success() {
            return Err(DriverError::AuthConfiguration(failure_text(&output)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(json) = extract_json_object(&stdout)
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(json)
            && let Some(error) = value.get("error").filter(|e| !e.is_null())
        {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(DriverError::AuthConfiguration(message));
        }
        Ok(())
    }

    async fn submit_task(
        &self,
        instance: &InstanceHandle,
        prompt: &str,
        mode: TaskMode,
    ) -> Result<String, DriverError> {
        let workspace = self.workspace_of(instance).await?;
        let mut args = vec!["task", "new"];
        match mode {
            TaskMode::Plan => args.extend(["-m", "plan"]),
            TaskMode::Autonomous => args.extend(["-y", "-m", "act"]),
        }
        args.extend(["--address", instance.as_str(), prompt]);

        let output = self
            .runner
            .run_checked(&workspace, &args)
            .await
            .map_err(|e| DriverError::TaskSubmission(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let task_id = extract_json_object(&stdout)
            .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
            .and_then(|v| {
                v.get("task_id")
                    .or_else(|| v.get("id"))
                    .and_then(|id| match id {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
            })
            .unwrap_or_else(|| instance.to_string());
        self.set_mode(instance, mode).await;
        tracing::info!(instance = %instance, task_id = %task_id, ?mode, "task submitted");
        Ok(task_id)
    }

    async fn stream_output(&self, instance: &InstanceHandle) -> Result<EventStream, DriverError> {
        let (workspace, mode) = self
            .instances
            .lock()
            .await
            .get(instance)
            .map(|p| (p.workspace.clone(), p.mode))
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))?;
        let description = format!("{} task view --follow", self.config.command);
        let mut child = Command::new(&self.config.command)
            .args([
                "task",
                "view",
                "--follow",
                "--output-format",
                "plain",
                "--address",
                instance.as_str(),
            ])
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DriverError::Spawn {
                command: description,
                source,
            })?;

        // stdout and stderr share one queue so ordering within each pipe is kept.
        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let state = FollowState {
            child,
            rx,
            parser: self.parser.clone(),
            read_timeout: self.config.read_timeout,
            runner: self.runner.clone(),
            workspace,
            instance: instance.clone(),
            mode,
            finished: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            state.next_event().await.map(|event| (event, state))
        });
        Ok(Box::pin(stream))
    }

    async fn approve(&self, instance: &InstanceHandle, message: &str) -> Result<(), DriverError> {
        tracing::info!(instance = %instance, "approving plan");
        self.send(
            instance,
            &["task", "send", "-y", "-m", "act", "--approve", "--address", instance.as_str(), message],
        )
        .await?;
        self.set_mode(instance, TaskMode::Autonomous).await;
        Ok(())
    }

    async fn respond(
        &self,
        instance: &InstanceHandle,
        response: ToolResponse,
        message: Option<&str>,
    ) -> Result<(), DriverError> {
        let flag = match response {
            ToolResponse::Approve => "--approve",
            ToolResponse::Deny => "--deny",
        };
        let mut args = vec!["task", "send", "--address", instance.as_str(), flag];
        if let Some(message) = message {
            args.push(message);
        }
        self.send(instance, &args).await
    }

    async fn send_message(
        &self,
        instance: &InstanceHandle,
        message: &str,
    ) -> Result<(), DriverError> {
        self.send(instance, &["task", "send", "--address", instance.as_str(), message])
            .await
    }

    async fn cancel(&self, instance: &InstanceHandle) -> Result<bool, DriverError> {
        let workspace = self.workspace_of(instance).await?;
        match self
            .runner
            .run_checked(&workspace, &["task", "pause", "--address", instance.as_str()])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "cancel request not delivered");
                Ok(false)
            }
        }
    }

    async fn destroy_instance(&self, instance: &InstanceHandle) -> Result<(), DriverError> {
        let Some(mut process) = self.instances.lock().await.remove(instance) else {
            return Ok(());
        };

        if let Some(mut child) = process.child.take()
            && let Err(e) = child.kill().await
        {
            tracing::debug!(instance = %instance, error = %e, "instance process already exited");
        }

        match self
            .runner
            .run_checked(&process.workspace, &["instance", "kill", instance.as_str()])
            .await
        {
            Ok(_) => {
                tracing::info!(instance = %instance, "agent instance destroyed");
                Ok(())
            }
            Err(e) => {
                // Keep the record so a later sweep retries the kill.
                self.instances.lock().await.insert(instance.clone(), process);
                Err(e)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for the CLI.
    fn fake_cli(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-cline");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    fn driver(command: String, read_timeout_ms: u64) -> ClineDriver {
        ClineDriver::new(ClineConfig {
            command,
            read_timeout: Duration::from_millis(read_timeout_ms),
            startup_line_limit: 5,
            command_timeout: Duration::from_secs(5),
        })
    }

    const INSTANCE_SCRIPT: &str = r####"
case "$1 $2" in
  "instance new") echo "Starting..."; echo "Address: 127.0.0.1:50052"; sleep 30 ;;
  "instance kill") exit 0 ;;
  "task view")
    if [ "$3" = "--follow" ]; then
      echo "### Progress"; echo "Reading files"; echo ""; echo "diff --git a/x b/x"; exit 0
    fi
    echo "### Task completed"; echo "Refactored the parser."; echo "### Progress"; exit 0 ;;
  "task new") echo '{"task_id": "task-42"}' ;;
  "auth --provider") echo '{"status": "ok"}' ;;
  *) exit 0 ;;
esac
"####;

    #[tokio::test]
    async fn test_create_instance_parses_legacy_address() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), INSTANCE_SCRIPT);
        let driver = driver(cli, 2000);

        let handle = driver.create_instance(dir.path()).await.unwrap();
        assert_eq!(handle.as_str(), "127.0.0.1:50052");

        driver.destroy_instance(&handle).await.unwrap();
        // second destroy is a no-op
        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_instance_without_address_fails_with_output() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), r#"echo "boot failed: no license"; exit 3"#);
        let driver = driver(cli, 2000);

        match driver.create_instance(dir.path()).await {
            Err(DriverError::InstanceCreation { output }) => {
                assert!(output.contains("boot failed"));
            }
            other => panic!("expected InstanceCreation, got {:?}", other.map(|h| h.0)),
        }
    }

    #[tokio::test]
    async fn test_create_instance_silent_process_times_out() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), "sleep 30");
        let driver = driver(cli, 200);

        let started = std::time::Instant::now();
        let result = driver.create_instance(dir.path()).await;
        assert!(matches!(result, Err(DriverError::InstanceCreation { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_submit_task_reads_task_id() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), INSTANCE_SCRIPT);
        let driver = driver(cli, 2000);
        let handle = driver.create_instance(dir.path()).await.unwrap();

        let task_id = driver.submit_task(&handle, "add tests", TaskMode::Plan).await.unwrap();
        assert_eq!(task_id, "task-42");

        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_is_auth_error() {
        let dir = TempDir::new().unwrap();
        let body = INSTANCE_SCRIPT.replace(
            r#""auth --provider") echo '{"status": "ok"}' ;;"#,
            r#""auth --provider") echo "bad key" >&2; exit 1 ;;"#,
        );
        let cli = fake_cli(dir.path(), &body);
        let driver = driver(cli, 2000);
        let handle = driver.create_instance(dir.path()).await.unwrap();

        let creds = Credentials {
            provider: "anthropic".into(),
            model_id: "model".into(),
            api_key: "sk-never-shown".into(),
            base_url: None,
        };
        match driver.configure_auth(&handle, &creds).await {
            Err(DriverError::AuthConfiguration(msg)) => {
                assert!(msg.contains("bad key"));
                assert!(!msg.contains("sk-never-shown"));
            }
            other => panic!("expected AuthConfiguration, got {:?}", other),
        }
        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_output_classifies_lines_and_completes() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), INSTANCE_SCRIPT);
        let driver = driver(cli, 2000);
        let handle = driver.create_instance(dir.path()).await.unwrap();

        let events: Vec<RunEvent> = driver.stream_output(&handle).await.unwrap().collect().await;
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        use crate::engine::models::RunEventType::*;
        assert_eq!(kinds, vec![Step, Log, Diff, Complete]);
        assert_eq!(events.last().unwrap().message, "Refactored the parser.");

        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_output_nonzero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let body = INSTANCE_SCRIPT.replace(
            r#"echo "diff --git a/x b/x"; exit 0"#,
            r#"echo "working"; exit 2"#,
        );
        let cli = fake_cli(dir.path(), &body);
        let driver = driver(cli, 2000);
        let handle = driver.create_instance(dir.path()).await.unwrap();

        let events: Vec<RunEvent> = driver.stream_output(&handle).await.unwrap().collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.event_type, crate::engine::models::RunEventType::Error);
        assert_eq!(last.message, "Task failed with exit code 2");

        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_output_times_out_on_silence() {
        let dir = TempDir::new().unwrap();
        let body = INSTANCE_SCRIPT.replace(
            r#"echo "diff --git a/x b/x"; exit 0"#,
            "sleep 30",
        );
        let cli = fake_cli(dir.path(), &body);
        let driver = driver(cli, 300);
        let handle = driver.create_instance(dir.path()).await.unwrap();

        let started = std::time::Instant::now();
        let events: Vec<RunEvent> = driver.stream_output(&handle).await.unwrap().collect().await;
        assert!(events.last().unwrap().is_stream_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));

        driver.destroy_instance(&handle).await.unwrap();
    }

    /// Follow output that reports completion and then keeps the view open.
    const COMPLETES_THEN_IDLES: &str = r####"
case "$1 $2" in
  "instance new") echo "Address: 127.0.0.1:50053"; sleep 30 ;;
  "task view")
    if [ "$3" = "--follow" ]; then
      echo "### Progress"; echo "Writing tests"; echo "### Task completed"; echo "Added 3 tests."; sleep 30
    fi
    echo "### Task completed"; echo "Added 3 tests."; exit 0 ;;
  *) exit 0 ;;
esac
"####;

    #[tokio::test]
    async fn test_completion_marker_ends_execution_stream() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), COMPLETES_THEN_IDLES);
        let driver = driver(cli, 300);
        let handle = driver.create_instance(dir.path()).await.unwrap();
        driver.submit_task(&handle, "add tests", TaskMode::Plan).await.unwrap();
        driver.approve(&handle, "go ahead").await.unwrap();

        let events: Vec<RunEvent> = driver.stream_output(&handle).await.unwrap().collect().await;
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        use crate::engine::models::RunEventType::*;
        assert_eq!(kinds, vec![Step, Log, Complete]);
        assert_eq!(events.last().unwrap().message, "Added 3 tests.");
        assert!(!events.iter().any(|e| e.is_stream_timeout()));

        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_autonomous_task_completes_on_marker() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), COMPLETES_THEN_IDLES);
        let driver = driver(cli, 300);
        let handle = driver.create_instance(dir.path()).await.unwrap();
        driver.submit_task(&handle, "add tests", TaskMode::Autonomous).await.unwrap();

        let events: Vec<RunEvent> = driver.stream_output(&handle).await.unwrap().collect().await;
        assert_eq!(
            events.last().unwrap().event_type,
            crate::engine::models::RunEventType::Complete
        );

        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_marker_in_plan_mode_is_the_plan() {
        let dir = TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), COMPLETES_THEN_IDLES);
        let driver = driver(cli, 300);
        let handle = driver.create_instance(dir.path()).await.unwrap();
        driver.submit_task(&handle, "add tests", TaskMode::Plan).await.unwrap();

        let events: Vec<RunEvent> = driver.stream_output(&handle).await.unwrap().collect().await;
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        use crate::engine::models::RunEventType::*;
        assert_eq!(kinds, vec![Step, Log, TaskResponse, Log, Error]);
        assert!(events.last().unwrap().is_stream_timeout());
        assert_eq!(events.last().unwrap().message, "No output from agent for 300ms");

        driver.destroy_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_on_unknown_instance_fail() {
        let driver = driver("cline-does-not-exist".into(), 100);
        let handle = InstanceHandle("nowhere:1".into());
        assert!(matches!(
            driver.approve(&handle, "go").await,
            Err(DriverError::UnknownInstance(_))
        ));
        driver.destroy_instance(&handle).await.unwrap();
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(600);
        let cut = excerpt(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), OUTPUT_EXCERPT_CHARS + 3);
    }
}
