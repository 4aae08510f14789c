//! Sidecar shutdown via remote exec
//!
//! The sidecar is asked to quit through its own admin endpoint. Once the
//! proxy exits the Pod can reach a terminal phase; depending on the
//! [`CompletionPolicy`] we either return right away or poll until it does.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use sidecar_cleaner_common::kube_utils::poll_until;

use crate::config::CleanerConfig;
use crate::error::CleanerError;
use crate::metrics;
use crate::pod::{self, PodKey, PodPhase};

/// Port of the Istio agent's status/admin listener
pub const DEFAULT_SIDECAR_HTTP_PORT: u16 = 15020;

/// Command sent to the sidecar container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ShutdownCommand {
    /// `pilot-agent request POST /quitquitquit`
    #[default]
    PilotAgent,
    /// POST to the agent's local HTTP endpoint through a shell
    LocalHttp { port: u16 },
}

impl ShutdownCommand {
    /// Argument vector executed inside the container
    pub fn argv(&self) -> Vec<String> {
        match self {
            ShutdownCommand::PilotAgent => ["pilot-agent", "request", "POST", "/quitquitquit"]
                .into_iter()
                .map(String::from)
                .collect(),
            ShutdownCommand::LocalHttp { port } => vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("curl -fsS -X POST http://127.0.0.1:{port}/quitquitquit"),
            ],
        }
    }
}

/// What `cleanup` waits for after the shutdown command succeeded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Return as soon as the command ran
    FireAndForget,
    /// Poll the Pod phase every `interval` until Succeeded, for at most `timeout`
    Confirm { interval: Duration, timeout: Duration },
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        CompletionPolicy::Confirm {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Captured output of the shutdown command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command inside a container of a Pod
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run `command` in `container` and collect its output
    ///
    /// A command that ran but did not succeed is an [`CleanerError::Exec`]
    /// carrying whatever it printed.
    async fn exec(
        &self,
        pod: &PodKey,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, CleanerError>;
}

/// Point read of a Pod's phase straight from the API server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodPhaseReader: Send + Sync {
    async fn phase(&self, pod: &PodKey) -> Result<PodPhase, CleanerError>;
}

/// [`PodExec`] and [`PodPhaseReader`] backed by a kube client
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExec for KubePodClient {
    async fn exec(
        &self,
        pod: &PodKey,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, CleanerError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(&pod.name, command, &params)
            .await
            .map_err(|e| exec_error(pod, format!("exec failed: {}", e), ExecOutput::default()))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let output = ExecOutput { stdout, stderr };

        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        if let Err(e) = attached.join().await {
            return Err(exec_error(pod, format!("exec stream failed: {}", e), output));
        }

        exec_outcome(pod, status, output)
    }
}

/// Map the exec status channel onto the caller's result
fn exec_outcome(
    pod: &PodKey,
    status: Option<Status>,
    output: ExecOutput,
) -> Result<ExecOutput, CleanerError> {
    match status {
        Some(s) if s.status.as_deref() == Some("Success") => Ok(output),
        Some(s) => {
            let message = s
                .message
                .or(s.reason)
                .unwrap_or_else(|| "command failed".to_string());
            Err(exec_error(pod, message, output))
        }
        None => Err(exec_error(
            pod,
            "exec finished without reporting a status",
            output,
        )),
    }
}

#[async_trait]
impl PodPhaseReader for KubePodClient {
    async fn phase(&self, pod: &PodKey) -> Result<PodPhase, CleanerError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let fresh = pods.get(&pod.name).await?;
        Ok(pod::phase(&fresh))
    }
}

fn exec_error(pod: &PodKey, message: impl Into<String>, output: ExecOutput) -> CleanerError {
    CleanerError::Exec {
        pod: pod.clone(),
        message: message.into(),
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "Exec output stream ended with an error");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Stops the sidecar of a Pod
pub struct SidecarCleaner {
    exec: Arc<dyn PodExec>,
    reader: Arc<dyn PodPhaseReader>,
    container: String,
    command: ShutdownCommand,
    completion: CompletionPolicy,
    exec_timeout: Duration,
}

impl SidecarCleaner {
    pub fn new(
        exec: Arc<dyn PodExec>,
        reader: Arc<dyn PodPhaseReader>,
        config: &CleanerConfig,
    ) -> Self {
        Self {
            exec,
            reader,
            container: config.profile.sidecar_container.clone(),
            command: config.shutdown_command.clone(),
            completion: config.completion,
            exec_timeout: config.exec_timeout,
        }
    }

    /// Cleaner talking to the cluster through `client`
    pub fn from_client(client: Client, config: &CleanerConfig) -> Self {
        let pods = Arc::new(KubePodClient::new(client));
        Self::new(pods.clone(), pods, config)
    }

    /// Ask the sidecar of `pod` to quit and apply the completion policy
    pub async fn cleanup(&self, pod: &PodKey) -> Result<ExecOutput, CleanerError> {
        let start = Instant::now();
        let result = self.run(pod).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::CLEANUPS.add(1, &metrics::result_label(outcome));
        metrics::CLEANUP_DURATION.record(start.elapsed().as_secs_f64(), &[]);

        result
    }

    async fn run(&self, pod: &PodKey) -> Result<ExecOutput, CleanerError> {
        info!(pod = %pod, container = %self.container, "Stopping sidecar");

        let output = tokio::time::timeout(
            self.exec_timeout,
            self.exec.exec(pod, &self.container, self.command.argv()),
        )
        .await
        .map_err(|_| CleanerError::ExecTimeout {
            pod: pod.clone(),
            timeout: self.exec_timeout,
        })??;

        match self.completion {
            CompletionPolicy::FireAndForget => {
                info!(pod = %pod, stdout = %output.stdout.trim(), "Sidecar shutdown requested");
                Ok(output)
            }
            CompletionPolicy::Confirm { interval, timeout } => {
                info!(
                    pod = %pod,
                    stdout = %output.stdout.trim(),
                    "Sidecar shutdown requested, waiting for pod to succeed"
                );
                let succeeded = poll_until(timeout, interval, || async {
                    Ok::<_, CleanerError>(self.reader.phase(pod).await? == PodPhase::Succeeded)
                })
                .await?;

                if succeeded {
                    info!(pod = %pod, "Pod succeeded after sidecar shutdown");
                    Ok(output)
                } else {
                    warn!(pod = %pod, timeout = ?timeout, "Pod did not succeed after sidecar shutdown");
                    Err(CleanerError::ConfirmationTimeout {
                        pod: pod.clone(),
                        timeout,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> PodKey {
        PodKey::new("batch", "etl-4xk9z")
    }

    fn config(completion: CompletionPolicy) -> CleanerConfig {
        CleanerConfig {
            completion,
            ..Default::default()
        }
    }

    fn ok_exec() -> MockPodExec {
        let mut exec = MockPodExec::new();
        exec.expect_exec()
            .times(1)
            .returning(|_, _, _| {
                Ok(ExecOutput {
                    stdout: "OK".to_string(),
                    stderr: String::new(),
                })
            });
        exec
    }

    #[test]
    fn shutdown_commands() {
        assert_eq!(
            ShutdownCommand::PilotAgent.argv(),
            vec!["pilot-agent", "request", "POST", "/quitquitquit"]
        );
        let http = ShutdownCommand::LocalHttp { port: 15020 }.argv();
        assert_eq!(http[0], "sh");
        assert_eq!(http[1], "-c");
        assert!(http[2].contains("http://127.0.0.1:15020/quitquitquit"));
    }

    #[tokio::test]
    async fn exec_streams_are_read_to_end() {
        let (stdout, stderr) = tokio::join!(
            read_all(Some(&b"OK\n"[..])),
            read_all(Some(&b"warning: draining\n"[..]))
        );
        assert_eq!(stdout, "OK\n");
        assert_eq!(stderr, "warning: draining\n");
        assert_eq!(read_all(None::<&[u8]>).await, "");
    }

    fn output() -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: "curl: (7) Failed to connect".to_string(),
        }
    }

    #[test]
    fn success_status_returns_output() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exec_outcome(&key(), Some(status), output()).unwrap(), output());
    }

    #[test]
    fn failure_status_keeps_message_and_output() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            message: Some("command terminated with non-zero exit code".to_string()),
            ..Default::default()
        };
        match exec_outcome(&key(), Some(status), output()) {
            Err(CleanerError::Exec {
                pod,
                message,
                stderr,
                ..
            }) => {
                assert_eq!(pod, key());
                assert_eq!(message, "command terminated with non-zero exit code");
                assert_eq!(stderr, "curl: (7) Failed to connect");
            }
            other => panic!("expected exec error, got {other:?}"),
        }
    }

    #[test]
    fn failure_without_message_falls_back_to_reason() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            ..Default::default()
        };
        let err = exec_outcome(&key(), Some(status), ExecOutput::default()).unwrap_err();
        assert!(matches!(err, CleanerError::Exec { ref message, .. } if message == "NonZeroExitCode"));
    }

    #[test]
    fn missing_status_is_an_error() {
        let err = exec_outcome(&key(), None, ExecOutput::default()).unwrap_err();
        assert_eq!(err.kind(), "exec");
    }

    #[tokio::test]
    async fn exec_targets_sidecar_with_configured_command() {
        let mut exec = MockPodExec::new();
        exec.expect_exec()
            .withf(|pod, container, command| {
                pod == &PodKey::new("batch", "etl-4xk9z")
                    && container == "istio-proxy"
                    && command[0] == "sh"
            })
            .times(1)
            .returning(|_, _, _| Ok(ExecOutput::default()));
        let reader = MockPodPhaseReader::new();

        let config = CleanerConfig {
            shutdown_command: ShutdownCommand::LocalHttp { port: 15020 },
            completion: CompletionPolicy::FireAndForget,
            ..Default::default()
        };
        let cleaner = SidecarCleaner::new(Arc::new(exec), Arc::new(reader), &config);

        assert!(cleaner.cleanup(&key()).await.is_ok());
    }

    #[tokio::test]
    async fn fire_and_forget_never_polls() {
        let mut reader = MockPodPhaseReader::new();
        reader.expect_phase().never();

        let cleaner = SidecarCleaner::new(
            Arc::new(ok_exec()),
            Arc::new(reader),
            &config(CompletionPolicy::FireAndForget),
        );

        let output = cleaner.cleanup(&key()).await.unwrap();
        assert_eq!(output.stdout, "OK");
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_succeeds_once_pod_succeeds() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let mut reader = MockPodPhaseReader::new();
        reader.expect_phase().returning(move |_| {
            if p.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(PodPhase::Running)
            } else {
                Ok(PodPhase::Succeeded)
            }
        });

        let cleaner = SidecarCleaner::new(
            Arc::new(ok_exec()),
            Arc::new(reader),
            &config(CompletionPolicy::default()),
        );

        assert!(cleaner.cleanup(&key()).await.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_times_out_when_pod_never_succeeds() {
        let mut reader = MockPodPhaseReader::new();
        reader.expect_phase().returning(|_| Ok(PodPhase::Running));

        let cleaner = SidecarCleaner::new(
            Arc::new(ok_exec()),
            Arc::new(reader),
            &config(CompletionPolicy::default()),
        );

        let start = tokio::time::Instant::now();
        let err = cleaner.cleanup(&key()).await.unwrap_err();
        assert!(matches!(
            err,
            CleanerError::ConfirmationTimeout { timeout, .. } if timeout == Duration::from_secs(10)
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_aborts_on_read_error() {
        let mut reader = MockPodPhaseReader::new();
        reader.expect_phase().times(1).returning(|_| {
            Err(CleanerError::Common(sidecar_cleaner_common::Error::internal(
                "apiserver unavailable",
            )))
        });

        let cleaner = SidecarCleaner::new(
            Arc::new(ok_exec()),
            Arc::new(reader),
            &config(CompletionPolicy::default()),
        );

        let err = cleaner.cleanup(&key()).await.unwrap_err();
        assert!(matches!(err, CleanerError::Common(_)));
    }

    #[tokio::test]
    async fn failed_exec_is_returned_without_polling() {
        let mut exec = MockPodExec::new();
        exec.expect_exec().times(1).returning(|pod, _, _| {
            Err(CleanerError::Exec {
                pod: pod.clone(),
                message: "command terminated with non-zero exit code".to_string(),
                stdout: String::new(),
                stderr: "no such file: pilot-agent".to_string(),
            })
        });
        let mut reader = MockPodPhaseReader::new();
        reader.expect_phase().never();

        let cleaner = SidecarCleaner::new(
            Arc::new(exec),
            Arc::new(reader),
            &config(CompletionPolicy::default()),
        );

        let err = cleaner.cleanup(&key()).await.unwrap_err();
        match err {
            CleanerError::Exec { stderr, .. } => assert!(stderr.contains("pilot-agent")),
            other => panic!("expected Exec error, got {other:?}"),
        }
    }

    struct HangingExec;

    #[async_trait]
    impl PodExec for HangingExec {
        async fn exec(&self, _: &PodKey, _: &str, _: Vec<String>) -> Result<ExecOutput, CleanerError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_sidecar_hits_exec_timeout() {
        let mut reader = MockPodPhaseReader::new();
        reader.expect_phase().never();

        let cleaner = SidecarCleaner::new(
            Arc::new(HangingExec),
            Arc::new(reader),
            &config(CompletionPolicy::default()),
        );

        let start = tokio::time::Instant::now();
        let err = cleaner.cleanup(&key()).await.unwrap_err();
        assert!(matches!(err, CleanerError::ExecTimeout { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
