use thiserror::Error;

pub use dispatch_common::error::ValidationError;
use dispatch_common::error::EmailError;

/// Enumeration of errors related to actually executing a model run: the
/// subprocess invocation and the LaTeX rendering pass that turns its
/// output into a PDF.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("model binary exited with status {0}")]
    NonZeroExit(i32),
    #[error("model binary was killed by a signal")]
    Terminated,
    #[error("missing declared attachment '{0}'")]
    MissingAttachment(String),
    #[error("task is missing a value for declared parameter '{0}'")]
    MissingParameterValue(String),
    #[error("stored parameter value rejected by its own schema: {0}")]
    BadStoredParameter(#[from] ValidationError),
    #[error("pdflatex run {run} exited with status {status}")]
    LatexFailed { run: u32, status: i32 },
    #[error("io error while running a model: {0}")]
    Io(#[from] std::io::Error),
}

/// Enumeration of errors related to polling the queue and dispatching a
/// task, mirroring `hook-worker`'s `WebhookError`/`WorkerError` split: one
/// for the operation being attempted (`RunError`), one for the
/// surrounding infrastructure (`WorkerError`).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("request to the queue daemon failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("queue daemon returned a response we couldn't interpret: {0}")]
    MalformedResponse(String),
    #[error("model run failed: {0}")]
    Run(#[from] RunError),
    #[error("result email could not be delivered: {0}")]
    Email(#[from] EmailError),
    #[error("blocking task panicked: {0}")]
    Panicked(String),
}
