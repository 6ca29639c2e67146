// Copyright © 2023 David Caldwell <david@porkrind.org>

//! Errors that callers may want to tell apart. They travel inside `anyhow::Error`; use
//! `err.downcast_ref::<DiskError>()` to get at them.

use thiserror::Error;

use crate::block::ImageFormat;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiskError {
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Disk full")]
    DiskFull,

    #[error("File is too fragmented")]
    TooFragmented,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File exists: {0}")]
    FileExists(String),

    #[error("Directory full")]
    DirectoryFull,

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Invalid file descriptor record in sector {0}")]
    InvalidFdr(usize),

    #[error("Disk is not formatted (no volume information block)")]
    NotFormatted,

    #[error("Disk is write protected")]
    WriteProtected,

    #[error("Image can't be represented as {0:?}: {1}")]
    CannotRepresent(ImageFormat, &'static str),
}
