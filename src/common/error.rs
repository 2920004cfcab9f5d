use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config Error: {0}")]
    Config(String),
    #[error("TLS Error: {0}")]
    Tls(String),
    #[error("ACME Error: {0}")]
    Acme(String),
}

pub type Result<T> = std::result::Result<T, GateError>;
