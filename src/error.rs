use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::provider::TunnelProvider;

/// トンネル操作のエラー
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid local port {0}")]
    InvalidPort(u16),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// プロセスは起動したがURLが得られなかった
    #[error("{provider} did not report a public URL: {reason}")]
    Resolution {
        provider: TunnelProvider,
        reason: ResolutionFailure,
    },

    #[error("no tunnel is running on port {0}")]
    NotFound(u16),
}

/// サブプロセスを起動できなかった
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire cloudflared: {0}")]
    Install(#[from] InstallError),
}

/// cloudflared バイナリの取得エラー
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// URL解決に失敗した理由
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionFailure {
    #[error("output stream closed before a URL appeared")]
    StreamClosed,

    #[error("no URL within the first {0} lines")]
    LineLimit(usize),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<InstallError> for TunnelError {
    fn from(e: InstallError) -> Self {
        TunnelError::Launch(LaunchError::Install(e))
    }
}
