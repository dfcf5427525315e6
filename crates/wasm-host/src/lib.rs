//! # usewasm WASMホスト
//!
//! wasmtimeを直接使用して、取得済みWASMモジュールのコンパイル・リンク・
//! インスタンス化を行う。
//!
//! ## 構成
//! - `memory` / `provision`: 線形メモリの生成・再利用・解放
//! - `imports`: インポート環境（`js.mem` 予約キー + `env` 名前空間）の構築
//! - `runtime`: `ModuleRuntime` トレイトとwasmtime実装（バッファ / ストリーミング）
//! - `instance`: コンパイル済みモジュール・インスタンス・エクスポート表
//!
//! ## 安全性
//! - Fuel制限: 命令実行数の上限（無限ループ防止、任意）
//! - ストア単位のロック: 全ハンドルは自身のストアを共有参照で保持する

pub mod imports;
pub mod instance;
pub mod memory;
pub mod provision;
pub mod runtime;
pub mod value;

pub use imports::{
    build_imports, EnvFactory, HostBinding, HostBindings, HostCaller, HostFunc, ImportMap,
    HOST_NAMESPACE, MEMORY_KEY, RESERVED_NAMESPACE,
};
pub use instance::{CompiledModule, Export, Exports, Function, GlobalExport, Instance};
pub use memory::Memory;
pub use provision::{acquire_memory, ProvisionedMemory};
pub use runtime::{
    is_wasm_content_type, Instantiated, ModuleRuntime, ModuleSource, RuntimeConfig,
    WasmtimeRuntime, WASM_MIME_TYPE,
};
pub use value::{Signature, Value, ValueType};

/// WASMホストのエラー型
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// WASMモジュールのコンパイルエラー（不正なバイナリ）
    #[error("WASMコンパイルエラー: {0}")]
    Compile(String),
    /// リンク・インスタンス化エラー（未解決インポート、startでのトラップ等）
    #[error("WASMインスタンス化エラー: {0}")]
    Instantiate(String),
    /// ストリーミングインスタンス化時のMIMEタイプ不一致
    #[error("レスポンスのMIMEタイプが不正です: {0:?} (application/wasm が必要)")]
    MimeType(Option<String>),
    /// モジュールソース（レスポンスボディ）の読み取りエラー
    #[error("モジュールソースの読み取りに失敗: {0}")]
    Source(String),
    /// メモリの生成・操作エラー
    #[error("メモリ操作エラー: {0}")]
    Memory(String),
    /// エクスポート関数の実行エラー（トラップ、Fuel枯渇を含む）
    #[error("WASM実行エラー: {0}")]
    Execution(String),
    /// 指定されたエクスポートが存在しない
    #[error("エクスポートが見つかりません: {0}")]
    MissingExport(String),
    /// 引数・戻り値の型が一致しない
    #[error("型が一致しません: {0}")]
    TypeMismatch(String),
    /// ホスト関数エラー
    #[error("ホスト関数エラー: {0}")]
    HostFunction(String),
    /// エンジン・ストア設定エラー
    #[error("ランタイム設定エラー: {0}")]
    Config(String),
}
