use std::fmt;
use std::io;

use crate::process::TunnelProcess;
use crate::provider::TunnelProvider;

/// 確立されたトンネル
///
/// ローカルポート、公開URL、トンネルを維持しているサブプロセスを束ねる。
/// サブプロセスはこのハンドルが専有する。
pub struct TunnelHandle {
    local_port: u16,
    provider: TunnelProvider,
    url: String,
    process: Box<dyn TunnelProcess>,
}

impl TunnelHandle {
    pub fn new(
        local_port: u16,
        provider: TunnelProvider,
        url: String,
        process: Box<dyn TunnelProcess>,
    ) -> Self {
        Self {
            local_port,
            provider,
            url,
            process,
        }
    }

    /// 公開URLを取得
    pub fn url(&self) -> &str {
        &self.url
    }

    /// ローカルポートを取得
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn provider(&self) -> TunnelProvider {
        self.provider
    }

    /// サブプロセスのPID（終了済みなら None）
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// トンネルをシャットダウン
    pub async fn shutdown(mut self) -> io::Result<()> {
        self.process.terminate().await
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("local_port", &self.local_port)
            .field("provider", &self.provider)
            .field("url", &self.url)
            .field("pid", &self.pid())
            .finish()
    }
}
