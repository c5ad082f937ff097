use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
