//! Reconciliation error types

use std::time::Duration;

use crate::pod::PodKey;

#[derive(Debug, thiserror::Error)]
pub enum CleanerError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("shutdown command failed on {pod}: {message}\nstdout: {stdout}\nstderr: {stderr}")]
    Exec {
        pod: PodKey,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("shutdown command on {pod} did not finish within {timeout:?}")]
    ExecTimeout { pod: PodKey, timeout: Duration },

    #[error("{pod} did not reach Succeeded within {timeout:?} after its sidecar was stopped")]
    ConfirmationTimeout { pod: PodKey, timeout: Duration },

    #[error("reconcile of {pod} panicked: {message}")]
    Panic { pod: PodKey, message: String },

    #[error("{0}")]
    Common(#[from] sidecar_cleaner_common::Error),
}

impl CleanerError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CleanerError::Kube(_) => "kube",
            CleanerError::Exec { .. } => "exec",
            CleanerError::ExecTimeout { .. } => "exec_timeout",
            CleanerError::ConfirmationTimeout { .. } => "confirmation_timeout",
            CleanerError::Panic { .. } => "panic",
            CleanerError::Common(_) => "internal",
        }
    }
}
