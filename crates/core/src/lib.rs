//! # usewasm Core
//!
//! WASMモジュールのロードパイプラインを実装する。
//!
//! ## 処理フロー
//! 1. ロード要求を検証し、前の要求を置き換える
//! 2. メモリを取得し、インポート環境を構築する
//! 3. モジュールを取得する（`Content-Type: application/wasm` を強制）
//! 4. ストリーミングまたはバッファでインスタンス化する
//! 5. エクスポートを `LoadState` として公開する
//!
//! ## キャンセル
//! 要求ごとの `Scope` がキャンセルトークンと内部生成メモリを保持し、
//! 置き換え・破棄の時点で一度だけ閉じられる。

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod instantiator;
pub mod request;
pub mod scope;
pub mod state;

#[cfg(test)]
mod test_helpers;

pub use cancel::CancellationToken;
pub use config::{ConfigError, LoaderConfig};
pub use coordinator::{LoadCoordinator, LoadHandle, LoadOutcome};
pub use error::LoadError;
pub use fetcher::{
    FetchError, FetchRequest, FetchResponse, HttpClient, MemoryBody, NetworkClient, ResponseBody,
};
pub use request::{LoadOptions, LoadRequest};
pub use scope::Scope;
pub use state::{FromExports, LoadState};
