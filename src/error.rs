use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("consensus module is stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("storage is missing key {0:?}")]
    MissingKey(&'static str),
}

pub type Result<T> = std::result::Result<T, RaftError>;
