use std::path::PathBuf;
use std::sync::LazyLock;

use miette::Diagnostic;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static DUPLICATE_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)name already exists")
        .expect("duplicate message pattern is valid")
});

#[derive(Debug, Error, Diagnostic)]
pub enum MigrateError {
    #[error("missing config file config.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("configuration file is missing the following required keys: {}", .0.join(", "))]
    MissingConfigKeys(Vec<String>),

    #[error("catalog `{0}` is not configured")]
    MissingCatalog(String),

    #[error("failed to read city roster: {0}")]
    Roster(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {message}")]
    Validation { message: String, fields: Value },

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("catalog API error ({kind}): {message}")]
    CatalogApi { kind: String, message: String },

    #[error("malformed catalog response: {0}")]
    MalformedResponse(String),
}

impl MigrateError {
    /// Builds an error from a CKAN `error` object, dispatching on `__type`.
    pub fn from_api_error(error: &Value) -> Self {
        let kind = error
            .get("__type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Error")
            .to_string();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());

        match kind.as_str() {
            "Not Found Error" => MigrateError::NotFound(message),
            "Validation Error" => {
                let mut fields = error.clone();
                if let Some(map) = fields.as_object_mut() {
                    map.remove("__type");
                }
                MigrateError::Validation {
                    message: flatten_messages(&fields).join("; "),
                    fields,
                }
            }
            "Authorization Error" => MigrateError::Authorization(message),
            _ => MigrateError::CatalogApi { kind, message },
        }
    }

    /// True when validation rejected a create because the name is taken.
    pub fn is_duplicate(&self) -> bool {
        match self {
            MigrateError::Validation { fields, .. } => flatten_messages(fields)
                .iter()
                .any(|message| DUPLICATE_MESSAGE.is_match(message)),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MigrateError::NotFound(_))
    }

    /// Short label used when logging a per-item failure.
    pub fn category(&self) -> &'static str {
        match self {
            MigrateError::CatalogHttp(_) | MigrateError::CatalogStatus { .. } => "network error",
            MigrateError::NotFound(_) => "not found",
            MigrateError::Validation { .. } => "validation error",
            MigrateError::Authorization(_) => "authorization error",
            MigrateError::CatalogApi { .. } => "API error",
            MigrateError::MalformedResponse(_) => "malformed response",
            MigrateError::Filesystem(_) | MigrateError::Roster(_) => "file error",
            _ => "configuration error",
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MigrateError::MissingConfig
                | MigrateError::ConfigRead(_)
                | MigrateError::ConfigParse(_)
                | MigrateError::MissingConfigKeys(_)
                | MigrateError::MissingCatalog(_)
        )
    }

    pub fn is_catalog(&self) -> bool {
        matches!(
            self,
            MigrateError::CatalogHttp(_)
                | MigrateError::CatalogStatus { .. }
                | MigrateError::NotFound(_)
                | MigrateError::Validation { .. }
                | MigrateError::Authorization(_)
                | MigrateError::CatalogApi { .. }
                | MigrateError::MalformedResponse(_)
        )
    }
}

fn flatten_messages(value: &Value) -> Vec<String> {
    match value {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items.iter().flat_map(flatten_messages).collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(key, value)| {
                flatten_messages(value)
                    .into_iter()
                    .map(move |message| format!("{key}: {message}"))
            })
            .collect(),
        _ => Vec::new(),
    }
}
