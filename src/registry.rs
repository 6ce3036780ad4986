use std::collections::HashMap;

use crate::tunnel::TunnelHandle;

/// ローカルポート → トンネルの対応表
///
/// 1つのポートに登録できるトンネルは1つだけ。排他制御は所有者（TunnelManager）が行う。
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: HashMap<u16, TunnelHandle>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, port: u16) -> Option<&TunnelHandle> {
        self.tunnels.get(&port)
    }

    /// トンネルを登録。既に登録済みのポートならハンドルをそのまま返す
    pub fn insert(&mut self, handle: TunnelHandle) -> Result<(), TunnelHandle> {
        let port = handle.local_port();
        if self.tunnels.contains_key(&port) {
            return Err(handle);
        }
        self.tunnels.insert(port, handle);
        Ok(())
    }

    pub fn remove(&mut self, port: u16) -> Option<TunnelHandle> {
        self.tunnels.remove(&port)
    }

    /// 全トンネルを取り出す（ポート順）
    pub fn drain(&mut self) -> Vec<TunnelHandle> {
        let mut handles: Vec<_> = self.tunnels.drain().map(|(_, h)| h).collect();
        handles.sort_by_key(|h| h.local_port());
        handles
    }

    /// 登録済みポート（昇順）
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.tunnels.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
