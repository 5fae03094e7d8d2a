use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod file_format;
pub mod float_ext;
pub mod log_setup;

pub use file_format::{FileExtensionError, FileFormat};

pub const EPSILON: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum SerdeFormatError {
    #[error("YAML serialization failed")]
    Yaml(#[from] serde_yml::Error),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Extension(#[from] FileExtensionError),
    #[error("Failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type SerdeFormatResult<T> = Result<T, SerdeFormatError>;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}

pub fn serialize<T: Serialize>(value: &T, format: FileFormat) -> SerdeFormatResult<String> {
    Ok(match format {
        FileFormat::Yaml => serde_yml::to_string(value)?,
        FileFormat::Json => serde_json::to_string_pretty(value)?,
    })
}

pub fn deserialize<T: DeserializeOwned>(
    serialized: &str,
    format: FileFormat,
) -> SerdeFormatResult<T> {
    match format {
        FileFormat::Yaml => Ok(serde_yml::from_str(serialized)?),
        FileFormat::Json => Ok(serde_json::from_str(serialized)?),
    }
}

/// Reads a file and deserializes it, choosing the format from its extension.
pub fn load_file<T: DeserializeOwned>(path: &str) -> SerdeFormatResult<T> {
    let format = FileFormat::from_file_name(path)?;
    let serialized = std::fs::read_to_string(path).map_err(|source| SerdeFormatError::Read {
        path: path.to_string(),
        source,
    })?;
    deserialize(&serialized, format)
}
