// ローカルのWebサーバーを外部のトンネルサービス経由で公開する
// ssh リレー（localhost.run / remote.moe / serveo.net）と cloudflared に対応

mod binary;
mod config;
mod error;
mod keygen;
mod links;
mod manager;
mod process;
mod provider;
mod registry;
mod scan;
mod tunnel;

// パブリックAPI
pub use binary::{
    platform_asset_name, Asset, CloudflaredInstaller, GithubReleases, Release, ReleaseClient,
    FALLBACK_DOWNLOAD_URL, LATEST_RELEASE_API,
};
pub use config::{Config, ScanConfig, SshConfig, DEFAULT_LINKS_FILE, DEFAULT_PORT};
pub use error::{InstallError, LaunchError, ResolutionFailure, TunnelError};
pub use keygen::{ensure_key_pair, prepare_identity};
pub use links::{LinkPublisher, LinksFile, PublishedLink, READY_MARKER};
pub use manager::{ManagerSettings, TunnelManager, DEFAULT_SCAN_TIMEOUT};
pub use process::{Capture, LaunchCommand, Spawned, Spawner, SystemSpawner, TunnelProcess};
pub use provider::{Transport, TunnelProvider, UrlMatcher, CLOUDFLARED_LINE_LIMIT};
pub use registry::TunnelRegistry;
pub use scan::scan_for_url;
pub use tunnel::TunnelHandle;
