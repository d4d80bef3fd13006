// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for metric-relay

/// Path traversal failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// A multi-element list was met before the end of the path while lists were not allowed.
    #[error("encountered a list at '{path}' when lists are not allowed")]
    AmbiguousCollection { path: String },
}

/// Arithmetic expression evaluation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("expression nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Template and field-spec resolution failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to evaluate expression '{expression}': {source}")]
    Expression {
        expression: String,
        #[source]
        source: ExprError,
    },
}

impl From<FormatError> for ExtractError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::Resolve(inner) => ExtractError::Resolve(inner),
            other => ExtractError::Format(other),
        }
    }
}

/// Per-message extraction failures. The message is dropped and processing continues.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Format(FormatError),
    #[error("unable to resolve a timestamp from '{field}'")]
    Timestamp { field: String },
}

/// Failures turning raw bytes into a message tree.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("empty CSV row")]
    CsvEmpty,
    #[error("line does not match raw_regex")]
    RawNoMatch,
}

/// Configuration failures. These are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Agent not correctly configured ({setting}). Check config file.")]
    Missing { setting: &'static str },
    #[error("Agent not correctly configured ({setting}): {reason}")]
    Invalid {
        setting: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(setting: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            setting,
            reason: reason.into(),
        }
    }
}

/// Failures raised by a [`crate::delivery::Transport`] before a status code is known.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unable to build http client: {0}")]
    Build(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Every attempt failed; the pipeline stops.
    #[error("failed to deliver batch after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("collector rejected a batch of {records} records")]
    Rejected { records: usize },
    #[error("unable to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl DeliveryError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeliveryError::RetriesExhausted { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
