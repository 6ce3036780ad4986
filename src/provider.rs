use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

lazy_static! {
    static ref LHR_LIFE: Regex =
        Regex::new(r"https?://[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.lhr\.life").unwrap();
    static ref REMOTE_MOE: Regex =
        Regex::new(r"https?://[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.remote\.moe").unwrap();
    static ref SERVEO_NET: Regex =
        Regex::new(r"https?://[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.serveo\.net").unwrap();
    static ref TRYCLOUDFLARE: Regex =
        Regex::new(r"https?://[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.trycloudflare\.com").unwrap();
}

/// cloudflared が最初に出力する行のうち、URLを探す行数
pub const CLOUDFLARED_LINE_LIMIT: usize = 20;

/// トンネルプロバイダー（4種類のみ）
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TunnelProvider {
    /// ssh -R で localhost.run に接続
    #[serde(rename = "localhost.run")]
    LocalhostRun,

    /// ssh -R で remote.moe に接続
    #[serde(rename = "remote.moe")]
    RemoteMoe,

    /// ssh -R で serveo.net に接続
    #[serde(rename = "serveo.net")]
    ServeoNet,

    /// cloudflared のクイックトンネル
    #[serde(rename = "trycloudflare.com")]
    Cloudflared,
}

/// プロバイダーへの接続方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// リレーホストへの ssh リモートフォワード
    Ssh { host: &'static str },
    /// ダウンロードしたバイナリを起動
    Binary,
}

impl TunnelProvider {
    /// "全部" を指定したときの起動順
    pub const ALL: [TunnelProvider; 4] = [
        TunnelProvider::LocalhostRun,
        TunnelProvider::RemoteMoe,
        TunnelProvider::ServeoNet,
        TunnelProvider::Cloudflared,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TunnelProvider::LocalhostRun => "localhost.run",
            TunnelProvider::RemoteMoe => "remote.moe",
            TunnelProvider::ServeoNet => "serveo.net",
            TunnelProvider::Cloudflared => "trycloudflare.com",
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            TunnelProvider::LocalhostRun => Transport::Ssh {
                host: "localhost.run",
            },
            TunnelProvider::RemoteMoe => Transport::Ssh { host: "remote.moe" },
            TunnelProvider::ServeoNet => Transport::Ssh { host: "serveo.net" },
            TunnelProvider::Cloudflared => Transport::Binary,
        }
    }

    /// 公開URLのドメインサフィックス
    pub fn url_suffix(&self) -> &'static str {
        match self {
            TunnelProvider::LocalhostRun => ".lhr.life",
            TunnelProvider::RemoteMoe => ".remote.moe",
            TunnelProvider::ServeoNet => ".serveo.net",
            TunnelProvider::Cloudflared => ".trycloudflare.com",
        }
    }

    pub fn matcher(&self) -> UrlMatcher {
        let pattern: &'static Regex = match self {
            TunnelProvider::LocalhostRun => &*LHR_LIFE,
            TunnelProvider::RemoteMoe => &*REMOTE_MOE,
            TunnelProvider::ServeoNet => &*SERVEO_NET,
            TunnelProvider::Cloudflared => &*TRYCLOUDFLARE,
        };
        UrlMatcher {
            pattern,
            suffix: self.url_suffix(),
        }
    }

    /// 出力を何行まで読むか。None はストリーム終端まで
    pub fn line_limit(&self) -> Option<usize> {
        match self.transport() {
            Transport::Ssh { .. } => None,
            Transport::Binary => Some(CLOUDFLARED_LINE_LIMIT),
        }
    }

    /// URLの代わりにリンクファイルへ書く文字列
    pub fn failure_message(&self) -> String {
        format!("failed to open tunnel via {}", self.name())
    }
}

impl fmt::Display for TunnelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TunnelProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TunnelProvider::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown tunnel provider '{}'. Supported: localhost.run, remote.moe, serveo.net, trycloudflare.com",
                    s
                )
            })
    }
}

/// 1行から公開URLを取り出す
#[derive(Debug, Clone, Copy)]
pub struct UrlMatcher {
    pattern: &'static Regex,
    suffix: &'static str,
}

impl UrlMatcher {
    pub fn extract(&self, line: &str) -> Option<String> {
        for m in self.pattern.find_iter(line) {
            // "https://x.lhr.life.example.com" のようにホスト名が続く場合は除外
            if continues_host(&line[m.end()..]) {
                continue;
            }
            let Ok(url) = Url::parse(m.as_str()) else {
                continue;
            };
            if url.host_str().is_some_and(|h| h.ends_with(self.suffix)) {
                return Some(m.as_str().to_string());
            }
        }
        None
    }
}

fn continues_host(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '-' => true,
        Some('.') => chars.next().is_some_and(|c| c.is_ascii_alphanumeric()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_cloudflared_url() {
        let m = TunnelProvider::Cloudflared.matcher();
        assert_eq!(
            m.extract("your url is https://abcd-1234.trycloudflare.com/foo")
                .as_deref(),
            Some("https://abcd-1234.trycloudflare.com")
        );

        let line = "2024-01-15T10:00:00Z INF |  https://random-slug.trycloudflare.com   |";
        assert_eq!(
            m.extract(line).as_deref(),
            Some("https://random-slug.trycloudflare.com")
        );
    }

    #[test]
    fn test_extract_ignores_metrics_and_bare_domain() {
        let m = TunnelProvider::Cloudflared.matcher();
        assert!(m
            .extract("INF Starting metrics server on 127.0.0.1:20241/metrics")
            .is_none());
        assert!(m
            .extract("INF Requesting new quick Tunnel on trycloudflare.com...")
            .is_none());
        assert!(m.extract("https://trycloudflare.com").is_none());
        assert!(m.extract("").is_none());
    }

    #[test]
    fn test_extract_rejects_longer_host() {
        let m = TunnelProvider::LocalhostRun.matcher();
        assert!(m.extract("https://abc.lhr.life.example.com").is_none());
        assert_eq!(
            m.extract("see https://abc.lhr.life.").as_deref(),
            Some("https://abc.lhr.life")
        );
    }

    #[test]
    fn test_extract_ssh_relays() {
        let line = "abc123.lhr.life tunneled with tls termination, https://abc123.lhr.life";
        assert_eq!(
            TunnelProvider::LocalhostRun.matcher().extract(line).as_deref(),
            Some("https://abc123.lhr.life")
        );

        let line = "http (80)     http://fkx3se4zp4ex6uh2o5.remote.moe/";
        assert_eq!(
            TunnelProvider::RemoteMoe.matcher().extract(line).as_deref(),
            Some("http://fkx3se4zp4ex6uh2o5.remote.moe")
        );

        let line = "Forwarding HTTP traffic from https://d4a9e3.serveo.net";
        assert_eq!(
            TunnelProvider::ServeoNet.matcher().extract(line).as_deref(),
            Some("https://d4a9e3.serveo.net")
        );
    }

    #[test]
    fn test_matchers_do_not_cross_providers() {
        let line = "Forwarding HTTP traffic from https://d4a9e3.serveo.net";
        assert!(TunnelProvider::LocalhostRun.matcher().extract(line).is_none());
        assert!(TunnelProvider::RemoteMoe.matcher().extract(line).is_none());
        assert!(TunnelProvider::Cloudflared.matcher().extract(line).is_none());
    }

    #[test]
    fn test_line_limits() {
        assert_eq!(TunnelProvider::Cloudflared.line_limit(), Some(20));
        assert_eq!(TunnelProvider::RemoteMoe.line_limit(), None);
    }

    #[test]
    fn test_name_roundtrip() {
        for provider in TunnelProvider::ALL {
            assert_eq!(provider.name().parse::<TunnelProvider>().unwrap(), provider);
        }
        let err = "teleport".parse::<TunnelProvider>().unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn test_serde_uses_provider_name() {
        let json = serde_json::to_string(&TunnelProvider::RemoteMoe).unwrap();
        assert_eq!(json, "\"remote.moe\"");
        let parsed: TunnelProvider = serde_json::from_str("\"serveo.net\"").unwrap();
        assert_eq!(parsed, TunnelProvider::ServeoNet);
    }
}
