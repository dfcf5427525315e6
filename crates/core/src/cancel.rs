//! # キャンセルトークン
//!
//! ロード要求ごとに1つ発行され、要求の置き換え・破棄時にキャンセルされる。
//! パイプラインは各中断点で `cancelled()` と競合させて待機する。

use std::sync::Arc;

use tokio::sync::watch;

/// キャンセル信号。クローンは同じ信号を共有する。
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// キャンセルする。2回目以降は何もしない。
    pub fn cancel(&self) {
        self.tx.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// キャンセルされるまで待機する。
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // 送信側は自身が保持しているため、チャネルが閉じることはない
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
