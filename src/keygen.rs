use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// ssh-keygen の引数
fn keygen_args(private_key: &Path) -> Vec<String> {
    vec![
        "-t".into(),
        "rsa".into(),
        "-b".into(),
        "4096".into(),
        "-N".into(),
        String::new(),
        "-f".into(),
        private_key.to_string_lossy().into_owned(),
        "-q".into(),
    ]
}

/// SSHリレー用の鍵ペアを用意して秘密鍵のパスを返す
///
/// `regenerate` が false なら既存の鍵をそのまま使う。
pub async fn ensure_key_pair(dir: &Path, name: &str, regenerate: bool) -> Result<PathBuf> {
    let private_key = dir.join(name);
    let public_key = dir.join(format!("{}.pub", name));

    if !regenerate && tokio::fs::metadata(&private_key).await.is_ok() {
        debug!("Using existing SSH key {}", private_key.display());
        return Ok(private_key);
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    for path in [&private_key, &public_key] {
        if tokio::fs::metadata(path).await.is_ok() {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }

    info!("Generating SSH key {}", private_key.display());
    let status = Command::new("ssh-keygen")
        .args(keygen_args(&private_key))
        .stdin(Stdio::null())
        .status()
        .await
        .context("Failed to run ssh-keygen")?;
    if !status.success() {
        anyhow::bail!("ssh-keygen exited with {}", status);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&private_key, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict {}", private_key.display()))?;
    }

    Ok(private_key)
}

/// ssh に渡す鍵を用意する。失敗しても止めない
///
/// 鍵が無くても ssh リレーはそれぞれ失敗行を書くだけで、他のプロバイダーは続行する。
pub async fn prepare_identity(dir: &Path, name: &str, regenerate: bool) -> Option<PathBuf> {
    match ensure_key_pair(dir, name, regenerate).await {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Failed to prepare the SSH key, continuing without -i: {:#}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_args() {
        let args = keygen_args(Path::new("/tmp/keys/id_rsa"));
        assert_eq!(
            args,
            vec!["-t", "rsa", "-b", "4096", "-N", "", "-f", "/tmp/keys/id_rsa", "-q"]
        );
    }

    #[tokio::test]
    async fn test_existing_key_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(&key, b"existing").unwrap();

        let path = ensure_key_pair(dir.path(), "id_rsa", false).await.unwrap();
        assert_eq!(path, key);
        assert_eq!(std::fs::read(&key).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn test_prepare_identity_survives_failure() {
        let dir = tempfile::tempdir().unwrap();
        // 通常ファイルの下にはディレクトリを作れない
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let identity = prepare_identity(&blocker.join("keys"), "id_rsa", false).await;
        assert!(identity.is_none());
        assert!(ensure_key_pair(&blocker.join("keys"), "id_rsa", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_prepare_identity_returns_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("relay"), b"existing").unwrap();

        let identity = prepare_identity(dir.path(), "relay", false).await;
        assert_eq!(identity, Some(dir.path().join("relay")));
    }
}
