use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame is missing its end marker")]
    MissingEndMarker,

    #[error("Declared frame size {size} is smaller than the signal field")]
    InvalidSize { size: u32 },

    #[error("Declared frame size {size} exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
