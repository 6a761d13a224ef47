use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
    #[error("malformed name table line {line}: {reason}")]
    NameTable { line: usize, reason: String },
    #[error("no stages left to run")]
    NoStages,

    #[error("invalid instruction pattern `{pattern}` near `{token}`")]
    InvalidPattern { pattern: String, token: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("variable group in {method} spans slots {first} and {second}")]
    MergedSlots {
        method: String,
        first: u16,
        second: u16,
    },
    #[error("tried to relocate non-static member {member}")]
    NonStaticRelocation { member: String },
    #[error("label is not part of the instruction list")]
    MissingLabel,

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("cannot start worker threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("malformed class `{class}`: {reason}")]
    ClassFormat { class: String, reason: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn class_format(class: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ClassFormat {
            class: class.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
