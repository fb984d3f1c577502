use thiserror::Error;

use crate::Fid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SbaError {
    #[error("out of heap memory allocating {words} words for escaping objects")]
    OutOfMemory { words: usize },
    #[error("value is not a stack reference")]
    NotStackResident,
    #[error("frame {fid} is not live (current frame is {current})")]
    InvalidFrame { fid: Fid, current: Fid },
    #[error("cannot escape from frame {from} to younger frame {to}")]
    EscapeToYoungerFrame { from: Fid, to: Fid },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SbaError>;
