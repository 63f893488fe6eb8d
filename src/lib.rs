use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("CRDS are not installed in cluster")]
    MissingCrds,

    #[error("MissingDependency: {0}")]
    MissingDependency(String),

    #[error("NoRunningPod: {0}")]
    NoRunningPod(String),

    #[error("ExecFailed: {0}")]
    ExecFailed(String),

    #[error("TokenError: {0}")]
    TokenError(#[from] crate::token::Error),

    #[error("WorkloadClusterError: {0}")]
    WorkloadClusterError(String),

    #[error("StdIoError")]
    StdIoError(#[from] std::io::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }

    /// Errors that retrying cannot fix without a change to the object.
    pub fn is_permanent(&self) -> bool {
        use kube::runtime::finalizer;
        match self {
            Error::TokenError(
                token::Error::UnsupportedRole(_) | token::Error::EmptyTokenId(_),
            ) => true,
            Error::FinalizerError(e) => match e.as_ref() {
                finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => {
                    e.is_permanent()
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Resources
pub mod resources;

/// Settings
mod settings;
pub use settings::Settings;

/// State
mod state;
pub use state::*;

/// Context
mod context;
pub use context::*;

/// Join token codec
pub mod token;

/// Remote command execution
pub mod exec;
pub use exec::{KubePodExecutor, PodExecutor, PodRef};
#[cfg(test)]
pub use exec::MockPodExecutor;
