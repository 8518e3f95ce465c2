use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("store payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration could not be extracted: {0}")]
    Extract(#[from] figment::Error),

    #[error("invalid admin ip `{0}`")]
    AdminIp(String),

    #[error("invalid trusted proxy ip `{0}`")]
    ProxyIp(String),
}
