//! # ロード状態
//!
//! 購読者に公開されるスナップショット。エラーは含まない（`LoadHandle` で伝播する）。

use usewasm_types::LoadSummary;
use usewasm_wasm_host::{CompiledModule, Exports, Instance, Memory, RuntimeError};

/// エクスポート表から公開用の型への変換。
///
/// 変換の失敗はインスタンス化の失敗として扱われる。
pub trait FromExports: Sized + Clone + Default + Send + Sync + 'static {
    fn from_exports(exports: &Exports) -> Result<Self, RuntimeError>;
}

impl FromExports for Exports {
    fn from_exports(exports: &Exports) -> Result<Self, RuntimeError> {
        Ok(exports.clone())
    }
}

/// ロード状態。
///
/// `is_loading == false` のとき、`exports`・`module`・`instance` は同一のロード結果に由来する。
#[derive(Debug, Clone)]
pub struct LoadState<T = Exports> {
    pub is_loading: bool,
    /// 公開されたエクスポート。ロード完了前は空
    pub exports: T,
    pub module: Option<CompiledModule>,
    pub instance: Option<Instance>,
    /// 報告対象のメモリ（インスタンス自身の `memory` エクスポートが優先）
    pub memory: Option<Memory>,
}

impl<T: Default> LoadState<T> {
    /// 初回ロード開始時の状態。
    pub fn initial() -> Self {
        Self {
            is_loading: true,
            exports: T::default(),
            module: None,
            instance: None,
            memory: None,
        }
    }
}

impl<T: Default> Default for LoadState<T> {
    fn default() -> Self {
        Self::initial()
    }
}

impl<T> LoadState<T> {
    pub fn is_ready(&self) -> bool {
        !self.is_loading && self.instance.is_some()
    }
}

impl LoadState<Exports> {
    /// シリアライズ用の概要。
    pub fn summary(&self) -> LoadSummary {
        LoadSummary {
            is_loading: self.is_loading,
            exports: self.exports.summaries(),
            memory_pages: self.memory.as_ref().map(Memory::size_pages),
        }
    }
}
