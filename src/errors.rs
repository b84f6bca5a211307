use thiserror::Error;

/// A remote memory read that returned fewer bytes than requested, or none at
/// all. Fatal to the operation that issued it, never to the session.
#[derive(Debug, Clone, Error)]
#[error("remote read of {length} bytes at {address:#x} failed (os error {os_error})")]
pub struct RemoteReadError {
    pub address: u64,
    pub length: usize,
    pub os_error: u32,
}

/// Errors that end a debug session before it produced anything useful.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("target process is not running")]
    ProcessNotRunning,
    #[error("cannot attach debugger to process (os error {0})")]
    AttachFailed(u32),
    #[error("cannot open target process with all access (os error {0})")]
    OpenProcessFailed(u32),
    #[error("cannot launch target process (os error {0})")]
    LaunchFailed(u32),
    #[error(transparent)]
    RemoteRead(#[from] RemoteReadError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading a binary log back.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("unexpected frame signature {found:?}, expected {expected:?}")]
    UnexpectedSignature {
        expected: [u8; 4],
        found: [u8; 4],
    },
    #[error("unexpected event frame type {0}")]
    UnknownEventId(u32),
    #[error("unexpected end of binary log, expected more data")]
    UnexpectedEof,
    #[error("binary log checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error(
        "binary log was written by version {file_major}.{file_minor}, \
         version {supported_major}.{supported_minor} is required"
    )]
    UnsupportedVersion {
        file_major: u8,
        file_minor: u8,
        supported_major: u8,
        supported_minor: u8,
    },
    #[error("invalid event filter entry: {0}")]
    InvalidFilterEvent(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            PlayerError::UnexpectedEof
        } else {
            PlayerError::Io(err)
        }
    }
}
