// cloudflared バイナリの取得
// ローカルにあればそれを使い、なければ GitHub の最新リリースから取得する。
// リリース情報が取れない場合は既知のバージョンにフォールバックする。

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::InstallError;

pub const LATEST_RELEASE_API: &str =
    "https://api.github.com/repos/cloudflare/cloudflared/releases/latest";

/// リリース情報が取得できないときに使うダウンロードURL
pub const FALLBACK_DOWNLOAD_URL: &str =
    "https://github.com/cloudflare/cloudflared/releases/download/2024.2.1/cloudflared-linux-amd64";

const USER_AGENT: &str = concat!("tunnel-links/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: Option<String>,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

impl Release {
    /// 名前に `asset_name` を含む最初のアセットのURL
    pub fn download_url(&self, asset_name: &str) -> Option<&str> {
        self.assets
            .iter()
            .find(|a| a.name.contains(asset_name))
            .map(|a| a.browser_download_url.as_str())
    }
}

/// リリース情報とアセットの取得
#[async_trait]
pub trait ReleaseClient: Send + Sync {
    async fn latest_release(&self) -> Result<Release, InstallError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, InstallError>;
}

/// GitHub Releases API クライアント
pub struct GithubReleases {
    client: reqwest::Client,
    api_url: String,
}

impl GithubReleases {
    pub fn new() -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| http_error(LATEST_RELEASE_API, e))?;
        Ok(Self {
            client,
            api_url: LATEST_RELEASE_API.to_string(),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, InstallError> {
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error(url, e))
    }
}

#[async_trait]
impl ReleaseClient for GithubReleases {
    async fn latest_release(&self) -> Result<Release, InstallError> {
        let body = self
            .get(&self.api_url)
            .await?
            .text()
            .await
            .map_err(|e| http_error(&self.api_url, e))?;
        serde_json::from_str(&body).map_err(|e| InstallError::Http {
            url: self.api_url.clone(),
            message: format!("invalid release metadata: {}", e),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, InstallError> {
        let bytes = self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|e| http_error(url, e))?;
        Ok(bytes.to_vec())
    }
}

fn http_error(url: &str, e: reqwest::Error) -> InstallError {
    InstallError::Http {
        url: url.to_string(),
        message: e.to_string(),
    }
}

/// 実行中のプラットフォームに対応するアセット名
pub fn platform_asset_name() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "aarch64") => "cloudflared-linux-arm64",
        ("linux", "arm") => "cloudflared-linux-arm",
        ("linux", "x86") => "cloudflared-linux-386",
        _ => "cloudflared-linux-amd64",
    }
}

/// 決まったパスに cloudflared を用意する
pub struct CloudflaredInstaller {
    path: PathBuf,
    asset_name: String,
    client: Box<dyn ReleaseClient>,
}

impl CloudflaredInstaller {
    pub fn new(path: impl Into<PathBuf>, client: Box<dyn ReleaseClient>) -> Self {
        Self {
            path: path.into(),
            asset_name: platform_asset_name().to_string(),
            client,
        }
    }

    pub fn with_asset_name(mut self, asset_name: impl Into<String>) -> Self {
        self.asset_name = asset_name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// バイナリのパスを返す。無ければダウンロードする
    ///
    /// 既存ファイルの検証（チェックサム、バージョン）はしない。
    pub async fn ensure(&self) -> Result<PathBuf, InstallError> {
        if tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            debug!("Using cached cloudflared at {}", self.path.display());
            ensure_executable(&self.path).await?;
            return Ok(self.path.clone());
        }

        let url = self.resolve_download_url().await;
        info!("Downloading cloudflared from {}", url);
        let bytes = self.client.download(&url).await?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // 途中で失敗しても壊れたバイナリが残らないよう、一時ファイル経由で置き換える
        let tmp = self.path.with_extension("download");
        tokio::fs::write(&tmp, &bytes).await?;
        set_executable(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(
            "Installed cloudflared ({} bytes) at {}",
            bytes.len(),
            self.path.display()
        );
        Ok(self.path.clone())
    }

    async fn resolve_download_url(&self) -> String {
        match self.client.latest_release().await {
            Ok(release) => match release.download_url(&self.asset_name) {
                Some(url) => {
                    debug!(
                        "Latest cloudflared release {}",
                        release.tag_name.as_deref().unwrap_or("(untagged)")
                    );
                    url.to_string()
                }
                None => {
                    warn!(
                        "No {} asset in the latest cloudflared release, falling back to {}",
                        self.asset_name, FALLBACK_DOWNLOAD_URL
                    );
                    FALLBACK_DOWNLOAD_URL.to_string()
                }
            },
            Err(e) => {
                warn!(
                    "Failed to look up the latest cloudflared release: {}, falling back to {}",
                    e, FALLBACK_DOWNLOAD_URL
                );
                FALLBACK_DOWNLOAD_URL.to_string()
            }
        }
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

/// 実行ビットが揃っていなければ付ける
///
/// 既に実行可能なファイルには触らない。
#[cfg(unix)]
async fn ensure_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = tokio::fs::metadata(path).await?.permissions().mode();
    if mode & 0o111 == 0o111 {
        return Ok(());
    }
    debug!("Marking {} executable", path.display());
    set_executable(path).await
}

#[cfg(not(unix))]
async fn ensure_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// 呼び出しを記録するリリースクライアント
    #[derive(Clone, Default)]
    pub struct FakeReleases {
        pub release: Option<Release>,
        pub fail_download: bool,
        pub metadata_calls: Arc<Mutex<usize>>,
        pub downloads: Arc<Mutex<Vec<String>>>,
    }

    impl FakeReleases {
        pub fn with_assets(assets: &[(&str, &str)]) -> Self {
            Self {
                release: Some(Release {
                    tag_name: Some("2025.1.0".into()),
                    assets: assets
                        .iter()
                        .map(|(name, url)| Asset {
                            name: name.to_string(),
                            browser_download_url: url.to_string(),
                        })
                        .collect(),
                }),
                ..Default::default()
            }
        }

        pub fn metadata_calls(&self) -> usize {
            *self.metadata_calls.lock().unwrap()
        }

        pub fn downloads(&self) -> Vec<String> {
            self.downloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReleaseClient for FakeReleases {
        async fn latest_release(&self) -> Result<Release, InstallError> {
            *self.metadata_calls.lock().unwrap() += 1;
            self.release.clone().ok_or_else(|| InstallError::Http {
                url: LATEST_RELEASE_API.into(),
                message: "403 rate limited".into(),
            })
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, InstallError> {
            self.downloads.lock().unwrap().push(url.to_string());
            if self.fail_download {
                return Err(InstallError::Http {
                    url: url.into(),
                    message: "connection reset".into(),
                });
            }
            Ok(b"#!/bin/sh\nexit 0\n".to_vec())
        }
    }
}
