use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no binding for key {key}")]
    Unbound { key: String },
    #[error("key {key} was removed at depth {depth}")]
    Removed { key: String, depth: usize },
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
