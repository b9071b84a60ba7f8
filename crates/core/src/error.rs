use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to launch inventory query `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("inventory query `{command}` exited with status {status}: {stderr}")]
    QueryFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to parse inventory output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read inventory snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("benchmark I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("benchmark plan is empty (file size {file_size}, block size {block_size})")]
    EmptyPlan { file_size: u64, block_size: u64 },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("benchmark completed in zero elapsed time")]
    ZeroElapsed,
}

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("failed to run `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}")]
    NonZeroExit { command: String, status: i32 },

    #[error("unparseable configuration value for {item}: {raw}")]
    BadValue { item: String, raw: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse JSON config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
