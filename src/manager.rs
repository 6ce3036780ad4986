use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::binary::CloudflaredInstaller;
use crate::error::{LaunchError, TunnelError};
use crate::process::{Capture, LaunchCommand, Spawned, Spawner};
use crate::provider::{Transport, TunnelProvider};
use crate::registry::TunnelRegistry;
use crate::scan::scan_for_url;
use crate::tunnel::TunnelHandle;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// トンネル起動時の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub ssh_program: PathBuf,
    /// ssh -i に渡す秘密鍵
    pub identity_file: Option<PathBuf>,
    /// URLを待つ上限。None なら待ち続ける
    pub scan_timeout: Option<Duration>,
    pub binary_line_limit: Option<usize>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            identity_file: None,
            scan_timeout: Some(DEFAULT_SCAN_TIMEOUT),
            binary_line_limit: None,
        }
    }
}

impl ManagerSettings {
    fn line_limit(&self, provider: TunnelProvider) -> Option<usize> {
        match provider.transport() {
            Transport::Binary => self.binary_line_limit.or(provider.line_limit()),
            Transport::Ssh { .. } => provider.line_limit(),
        }
    }
}

/// ローカルポートごとにトンネルを1つ管理する
///
/// 同じポートへの `open` は既存のトンネルを返す。ポートだけがキーなので、
/// 別のプロバイダーで開き直しても最初のトンネルが返る。
pub struct TunnelManager {
    spawner: Arc<dyn Spawner>,
    installer: Arc<CloudflaredInstaller>,
    settings: ManagerSettings,
    registry: Mutex<TunnelRegistry>,
}

impl TunnelManager {
    pub fn new(
        spawner: Arc<dyn Spawner>,
        installer: Arc<CloudflaredInstaller>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            spawner,
            installer,
            settings,
            registry: Mutex::new(TunnelRegistry::new()),
        }
    }

    /// `port` の公開URLを取得する。まだトンネルが無ければ起動する
    pub async fn open(&self, provider: TunnelProvider, port: u16) -> Result<String, TunnelError> {
        if port == 0 {
            return Err(TunnelError::InvalidPort(port));
        }

        // 確認から登録まで保持し、1ポート1トンネルを保証する
        let mut registry = self.registry.lock().await;
        if let Some(handle) = registry.get(port) {
            if handle.provider() != provider {
                warn!(
                    "Port {} already has a {} tunnel, returning it instead of opening {}",
                    port,
                    handle.provider(),
                    provider
                );
            } else {
                debug!("Reusing {} tunnel for port {}", provider, port);
            }
            return Ok(handle.url().to_string());
        }

        let command = self.launch_command(provider, port).await?;
        info!("Starting {} tunnel for port {}", provider, port);
        let Spawned {
            mut output,
            mut process,
        } = self
            .spawner
            .spawn(&command)
            .await
            .map_err(|source| LaunchError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let scanned = scan_for_url(
            &mut output,
            &provider.matcher(),
            self.settings.line_limit(provider),
            self.settings.scan_timeout,
        )
        .await;

        match scanned {
            Ok(url) => {
                info!("{} tunnel active for port {}: {}", provider, port, url);
                let handle = TunnelHandle::new(port, provider, url.clone(), process);
                if registry.insert(handle).is_err() {
                    // ロックを保持しているので起こらない
                    warn!("Port {} was registered concurrently", port);
                }
                Ok(url)
            }
            Err(reason) => {
                warn!("{} tunnel for port {} failed: {}", provider, port, reason);
                if let Err(e) = process.terminate().await {
                    debug!("Failed to terminate {} process: {}", provider, e);
                }
                Err(TunnelError::Resolution { provider, reason })
            }
        }
    }

    /// `port` のトンネルを終了して登録を外す
    pub async fn close(&self, port: u16) -> Result<(), TunnelError> {
        let handle = self
            .registry
            .lock()
            .await
            .remove(port)
            .ok_or(TunnelError::NotFound(port))?;

        info!("Stopping {} tunnel for port {}", handle.provider(), port);
        if let Err(e) = handle.shutdown().await {
            warn!("Failed to terminate tunnel for port {}: {}", port, e);
        }
        Ok(())
    }

    /// 全トンネルを終了する
    pub async fn shutdown(&self) {
        let handles = self.registry.lock().await.drain();
        for handle in handles {
            let port = handle.local_port();
            info!("Stopping {} tunnel for port {}", handle.provider(), port);
            if let Err(e) = handle.shutdown().await {
                warn!("Failed to terminate tunnel for port {}: {}", port, e);
            }
        }
    }

    /// 登録済みトンネルのURL
    pub async fn url(&self, port: u16) -> Option<String> {
        self.registry
            .lock()
            .await
            .get(port)
            .map(|h| h.url().to_string())
    }

    pub async fn ports(&self) -> Vec<u16> {
        self.registry.lock().await.ports()
    }

    async fn launch_command(
        &self,
        provider: TunnelProvider,
        port: u16,
    ) -> Result<LaunchCommand, TunnelError> {
        let command = match provider.transport() {
            Transport::Ssh { host } => {
                let mut cmd = LaunchCommand::new(&self.settings.ssh_program, Capture::Combined)
                    .arg("-o")
                    .arg("StrictHostKeyChecking=no");
                if let Some(identity) = &self.settings.identity_file {
                    cmd = cmd.arg("-i").arg(identity.to_string_lossy());
                }
                cmd.arg("-R")
                    .arg(format!("80:127.0.0.1:{}", port))
                    .arg(host)
            }
            Transport::Binary => {
                let binary = self.installer.ensure().await?;
                LaunchCommand::new(binary, Capture::StderrOnly)
                    .arg("tunnel")
                    .arg("--url")
                    .arg(format!("http://127.0.0.1:{}", port))
            }
        };
        Ok(command)
    }
}
