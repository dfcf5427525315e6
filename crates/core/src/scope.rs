//! # 要求スコープ
//!
//! 1つのロード要求が獲得した資源（キャンセルトークン、内部生成メモリ）をまとめ、
//! 要求の置き換え・破棄の両方の経路で `close()` により一度だけ解放する。

use usewasm_wasm_host::{Memory, ProvisionedMemory};

use crate::cancel::CancellationToken;

/// ロード要求のスコープ。
#[derive(Debug)]
pub struct Scope {
    token: CancellationToken,
    memory: Option<ProvisionedMemory>,
    closed: bool,
}

impl Scope {
    pub fn new(memory: Option<ProvisionedMemory>) -> Self {
        Self {
            token: CancellationToken::new(),
            memory,
            closed: false,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// このスコープで使うメモリ（呼び出し元のものを含む）。
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref().map(ProvisionedMemory::memory)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// キャンセルを発行し、内部生成メモリを解放する。何度呼んでもよい。
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.token.cancel();
        if let Some(memory) = &self.memory {
            memory.release();
        }
        tracing::debug!("ロードスコープを閉じました");
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}
