use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::ManagerSettings;
use crate::provider::CLOUDFLARED_LINE_LIMIT;

pub const DEFAULT_PORT: u16 = 7860;
pub const DEFAULT_LINKS_FILE: &str = "/content/links.txt";

/// 設定ファイル（TOML）。すべての項目に既定値がある
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// 公開するローカルポート
    pub port: u16,
    pub links_file: PathBuf,
    pub cloudflared_path: PathBuf,
    pub ssh: SshConfig,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub program: PathBuf,
    /// 未指定なら ~/.ssh
    pub key_dir: Option<PathBuf>,
    pub key_name: String,
    pub generate_key: bool,
    pub regenerate_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// 0 ならタイムアウトなし
    pub timeout_secs: u64,
    pub line_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            links_file: PathBuf::from(DEFAULT_LINKS_FILE),
            cloudflared_path: default_cloudflared_path(),
            ssh: SshConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            key_dir: None,
            key_name: "id_rsa".to_string(),
            generate_key: true,
            regenerate_key: false,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            line_limit: CLOUDFLARED_LINE_LIMIT,
        }
    }
}

fn default_cloudflared_path() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("tunnel-links"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudflared")
}

impl Config {
    pub fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse the config")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let s = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read the config {}", path.display()))?;
        Self::from_str(&s).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("`port` must be greater than 0");
        }
        if self.scan.line_limit == 0 {
            anyhow::bail!("`scan.line_limit` must be greater than 0");
        }
        if self.ssh.key_name.is_empty() {
            anyhow::bail!("`ssh.key_name` must not be empty");
        }
        Ok(())
    }

    /// 鍵を置くディレクトリ
    pub fn ssh_key_dir(&self) -> PathBuf {
        self.ssh.key_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssh")
        })
    }

    pub fn scan_timeout(&self) -> Option<Duration> {
        (self.scan.timeout_secs > 0).then(|| Duration::from_secs(self.scan.timeout_secs))
    }

    pub fn manager_settings(&self, identity_file: Option<PathBuf>) -> ManagerSettings {
        ManagerSettings {
            ssh_program: self.ssh.program.clone(),
            identity_file,
            scan_timeout: self.scan_timeout(),
            binary_line_limit: Some(self.scan.line_limit),
        }
    }
}
