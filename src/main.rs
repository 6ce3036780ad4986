use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tunnel_links::{
    prepare_identity, CloudflaredInstaller, Config, GithubReleases, LinkPublisher, LinksFile,
    SystemSpawner, Transport, TunnelProvider,
};

#[derive(Parser)]
#[clap(name = "tunnel-links")]
#[clap(about = "Expose a local web server through public tunnel relays", long_about = None)]
struct Cli {
    /// remote.moe（ssh）
    #[clap(long)]
    remotemoe: bool,

    /// localhost.run（ssh）
    #[clap(long, alias = "lhr_life")]
    lhr_life: bool,

    /// serveo.net（ssh）
    #[clap(long)]
    serveo: bool,

    /// trycloudflare.com（cloudflared）
    #[clap(long)]
    flara: bool,

    /// すべてのプロバイダー。個別のフラグと併用すると、個別分を先に起動してから全プロバイダーを順に開く
    /// （同じプロバイダーは既存のトンネルを再利用する）
    #[clap(long, alias = "all_links")]
    all_links: bool,

    /// 公開するローカルポート（既定: 7860）
    #[clap(short, long)]
    port: Option<u16>,

    /// URLを追記するファイル
    #[clap(long, parse(from_os_str))]
    links_file: Option<PathBuf>,

    /// 設定ファイル（TOML）
    #[clap(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
}

impl Cli {
    /// 起動するプロバイダー
    ///
    /// 個別フラグ（remotemoe, lhr_life, serveo, flara の順）のあとに --all-links の分が続く。
    fn providers(&self) -> Vec<TunnelProvider> {
        let mut providers: Vec<TunnelProvider> = [
            (self.remotemoe, TunnelProvider::RemoteMoe),
            (self.lhr_life, TunnelProvider::LocalhostRun),
            (self.serveo, TunnelProvider::ServeoNet),
            (self.flara, TunnelProvider::Cloudflared),
        ]
        .into_iter()
        .filter_map(|(selected, provider)| selected.then_some(provider))
        .collect();
        if self.all_links {
            providers.extend(TunnelProvider::ALL);
        }
        providers
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(links_file) = &cli.links_file {
        config.links_file = links_file.clone();
    }
    if config.port == 0 {
        anyhow::bail!("--port must be greater than 0");
    }

    let providers = cli.providers();
    if providers.is_empty() {
        anyhow::bail!(
            "No tunnel provider selected. Use --remotemoe, --lhr-life, --serveo, --flara or --all-links"
        );
    }

    // ssh リレーを使うときだけ鍵を用意する
    let uses_ssh = providers
        .iter()
        .any(|p| matches!(p.transport(), Transport::Ssh { .. }));
    let identity_file = if uses_ssh && config.ssh.generate_key {
        prepare_identity(
            &config.ssh_key_dir(),
            &config.ssh.key_name,
            config.ssh.regenerate_key,
        )
        .await
    } else {
        None
    };

    let installer = CloudflaredInstaller::new(
        config.cloudflared_path.clone(),
        Box::new(GithubReleases::new()?),
    );
    let mut publisher = LinkPublisher::new(
        Arc::new(SystemSpawner),
        Arc::new(installer),
        config.manager_settings(identity_file),
        LinksFile::new(config.links_file.clone()),
    );

    // Ctrl+Cハンドラー
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    let published = publisher.publish(&providers, config.port).await?;
    for link in &published {
        println!("{}: {}", link.provider, link.line);
    }
    if published.iter().all(|l| l.url.is_none()) {
        warn!("No tunnel could be opened");
        publisher.shutdown().await;
        return Ok(());
    }
    println!("Links written to {}", publisher.links().path().display());
    println!("Press Ctrl+C to stop...");

    // シャットダウン待機
    let _ = shutdown_rx.recv().await;

    info!("Shutting down...");
    publisher.shutdown().await;

    Ok(())
}
