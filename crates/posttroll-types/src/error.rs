//! Error types owned by the data-model crate.

/// Errors raised while constructing, encoding, or decoding a [`crate::Message`].
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// A required field (subject, type, sender, ...) was empty.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The wire header did not match the expected grammar.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// The timestamp could not be parsed in either tz-aware or naive form.
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// The payload could not be decoded for the declared `type`/binary flag.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// `data` was a JSON mapping but failed to serialize/deserialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64-framed binary payload failed to decode.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Errors raised by [`crate::Config`] loading, parsing, and scoping.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An unrecognized configuration key was present in a TOML file or env var.
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    /// A recognized key held a value that cannot be parsed into its expected type.
    #[error("impossible value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },

    /// The TOML configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The TOML configuration file could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
