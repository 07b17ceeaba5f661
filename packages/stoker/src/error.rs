use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort the supervisor or a worker before it can serve.
#[derive(Debug, Error)]
pub enum StokerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{call}: {errno}")]
    Sys {
        call: &'static str,
        errno: nix::Error,
    },

    #[error("shared region allocation failed: {0}")]
    SharedRegion(nix::Error),

    #[error("could not spawn worker child: {0}")]
    Spawn(nix::Error),

    #[error("worker slot {0} out of range")]
    BadSlot(u16),

    #[error("privilege drop failed: {0}")]
    PrivDrop(#[from] PrivDropError),
}

impl StokerError {
    pub(crate) fn sys(call: &'static str, errno: nix::Error) -> Self {
        StokerError::Sys { call, errno }
    }
}

/// Failures while dropping a worker to its unprivileged identity. Every
/// required step is fatal for the worker.
#[derive(Debug, Error)]
pub enum PrivDropError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("no runas user configured and skip_runas not set")]
    RunasMissing,

    #[error("cannot look up user {user}: {errno}")]
    UserLookup { user: String, errno: nix::Error },

    #[error("runas user {0} does not exist")]
    UnknownUser(String),

    #[error("cannot chroot to {path}: {errno}")]
    Chroot { path: PathBuf, errno: nix::Error },

    #[error("cannot chdir to {path}: {errno}")]
    Chdir { path: PathBuf, errno: nix::Error },

    #[error("cannot drop privileges: {0}")]
    Drop(nix::Error),
}

/// Reasons a key manager message is refused before touching domain state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeymgrError {
    #[error("short keymgr message ({0} bytes)")]
    Short(usize),

    #[error("invalid keymgr payload (declared {declared}, got {actual})")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("domain not NUL-terminated")]
    DomainNotTerminated,

    #[error("domain name is not valid UTF-8")]
    DomainNotUtf8,

    #[error("domain name longer than the wire maximum")]
    DomainTooLong,

    #[error("bad PEM payload: {0}")]
    BadPem(String),

    #[error("no certificate in PEM chain")]
    NoCertificate,

    #[error("bad DER certificate payload")]
    BadDer,

    #[error("certificate parse failed: {0}")]
    CertParse(String),
}

pub type Result<T, E = StokerError> = std::result::Result<T, E>;
