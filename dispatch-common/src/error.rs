use thiserror::Error;

/// Errors raised while validating or (de)serializing a parameter value.
///
/// Carries the offending parameter's name so a caller (the web frontend,
/// or a test) can report which field of the submitted form was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{name}: value '{value}' is not a valid {expected}")]
    WrongType {
        name: String,
        value: String,
        expected: &'static str,
    },
    #[error("{name}: value '{value}' is out of range")]
    OutOfRange { name: String, value: String },
    #[error("{name}: range start after end ({start}-{end})")]
    RangeInverted { name: String, start: f64, end: f64 },
    #[error("{name}: '{value}' is not one of the allowed options")]
    NotAnOption { name: String, value: String },
    #[error("{name} has no value and no non-exist default")]
    MissingValue { name: String },
    #[error("{name}: serialized payload is for parameter '{other}'")]
    NameMismatch { name: String, other: String },
}

/// Errors raised while loading or querying the model registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("model directory '{0}' does not exist")]
    MissingDirectory(String),
    #[error("model definition '{0}' is missing required field '{1}'")]
    InvalidDefinition(String, &'static str),
    #[error("failed to parse model definition '{path}': {error}")]
    ParseError { path: String, error: String },
    #[error("no model named '{0}' is loaded")]
    UnknownModel(String),
    #[error("no model '{name}' at version '{version}' is loaded")]
    UnknownVersion { name: String, version: String },
    #[error("io error scanning model directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised persisting or reloading queue state.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("io error accessing state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors raised sending or queuing an email.
#[derive(Error, Debug)]
pub enum EmailError {
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("smtp transport unreachable: {0}")]
    SmtpUnreachable(String),
}
