use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::binary::CloudflaredInstaller;
use crate::manager::{ManagerSettings, TunnelManager};
use crate::process::Spawner;
use crate::provider::TunnelProvider;

/// プロバイダー1つ分の処理が終わるたびに書く行
pub const READY_MARKER: &str = "ready";

/// 公開URLを追記していくテキストファイル
///
/// 外部への通知用で、このクレートからは読み返さない。
#[derive(Debug, Clone)]
pub struct LinksFile {
    path: PathBuf,
}

impl LinksFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 1行追記する。ファイルが無ければ作る
    pub async fn append(&self, line: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    pub async fn mark_ready(&self) -> Result<()> {
        self.append(READY_MARKER).await
    }
}

/// プロバイダー1つの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLink {
    pub provider: TunnelProvider,
    /// 公開URL。失敗時は None
    pub url: Option<String>,
    /// リンクファイルに書いた行
    pub line: String,
}

/// 選ばれたプロバイダーでトンネルを開き、結果をリンクファイルへ書く
///
/// プロバイダーごとに TunnelManager を持つので、同じポートでも各プロバイダーが実際に起動する。
pub struct LinkPublisher {
    spawner: Arc<dyn Spawner>,
    installer: Arc<CloudflaredInstaller>,
    settings: ManagerSettings,
    links: LinksFile,
    managers: BTreeMap<TunnelProvider, TunnelManager>,
}

impl LinkPublisher {
    pub fn new(
        spawner: Arc<dyn Spawner>,
        installer: Arc<CloudflaredInstaller>,
        settings: ManagerSettings,
        links: LinksFile,
    ) -> Self {
        Self {
            spawner,
            installer,
            settings,
            links,
            managers: BTreeMap::new(),
        }
    }

    pub fn links(&self) -> &LinksFile {
        &self.links
    }

    /// 順番に全プロバイダーを試す。失敗しても次へ進む
    ///
    /// エラーになるのはリンクファイルへの書き込みに失敗したときだけ。
    pub async fn publish(
        &mut self,
        providers: &[TunnelProvider],
        port: u16,
    ) -> Result<Vec<PublishedLink>> {
        let mut published = Vec::with_capacity(providers.len());
        for &provider in providers {
            let manager = self.manager(provider);
            let url = match manager.open(provider, port).await {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Could not open {} tunnel: {}", provider, e);
                    None
                }
            };
            let line = url.clone().unwrap_or_else(|| provider.failure_message());

            self.links.append(&line).await?;
            self.links.mark_ready().await?;
            info!("{}: {}", provider, line);

            published.push(PublishedLink {
                provider,
                url,
                line,
            });
        }
        Ok(published)
    }

    /// 全トンネルを終了する
    pub async fn shutdown(&self) {
        for manager in self.managers.values() {
            manager.shutdown().await;
        }
    }

    fn manager(&mut self, provider: TunnelProvider) -> &TunnelManager {
        let spawner = &self.spawner;
        let installer = &self.installer;
        let settings = &self.settings;
        self.managers.entry(provider).or_insert_with(|| {
            TunnelManager::new(spawner.clone(), installer.clone(), settings.clone())
        })
    }
}
