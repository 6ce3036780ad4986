use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ResolutionFailure;
use crate::provider::UrlMatcher;

/// この文字列で始まる行は呼び出し側に見せる
const WARNING_PREFIX: &str = "Warning";

/// 出力行を走査して公開URLを探す
///
/// URLが見つかる、ストリームが閉じる、`line_limit` 行を読む、`timeout` が経過する、
/// のいずれかで終わる。
pub async fn scan_for_url(
    output: &mut mpsc::Receiver<String>,
    matcher: &UrlMatcher,
    line_limit: Option<usize>,
    timeout: Option<Duration>,
) -> Result<String, ResolutionFailure> {
    let scan = async {
        let mut seen = 0usize;
        while let Some(line) = output.recv().await {
            seen += 1;
            debug!(target: "tunnel_links::output", "{}", line);
            if line.starts_with(WARNING_PREFIX) {
                warn!("{}", line.trim_end());
            }
            if let Some(url) = matcher.extract(&line) {
                return Ok(url);
            }
            if line_limit.is_some_and(|limit| seen >= limit) {
                return Err(ResolutionFailure::LineLimit(seen));
            }
        }
        Err(ResolutionFailure::StreamClosed)
    };

    match timeout {
        Some(duration) => tokio::time::timeout(duration, scan)
            .await
            .unwrap_or(Err(ResolutionFailure::TimedOut(duration))),
        None => scan.await,
    }
}
