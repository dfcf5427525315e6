//! # ロードエラー型
//!
//! ロード要求の呼び出し元に伝播するエラー。自動リトライは行わない。
//! キャンセルはエラーではなく、`LoadOutcome::Cancelled` として扱う。

use usewasm_wasm_host::RuntimeError;

use crate::fetcher::FetchError;

/// ロードエラー型。
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// 事前条件違反（空のパス、不正なメモリ制限）。I/Oの前に検出される。
    #[error("不正なロード要求: {0}")]
    Precondition(String),
    /// 取得失敗（非2xxレスポンス、またはネットワークエラー）
    #[error("WASMファイルの取得に失敗: {status_text}")]
    Fetch {
        /// HTTPステータス（ネットワークエラーの場合はNone）
        status: Option<u16>,
        /// ステータステキスト、またはエラー内容
        status_text: String,
    },
    /// インスタンス化失敗（不正なバイナリ、未解決インポート、MIMEタイプ不一致）
    #[error("WASMのインスタンス化に失敗: {0}")]
    Instantiation(#[from] RuntimeError),
}

impl From<FetchError> for LoadError {
    fn from(e: FetchError) -> Self {
        LoadError::Fetch {
            status: None,
            status_text: e.to_string(),
        }
    }
}

impl LoadError {
    /// HTTPステータス（取得失敗の場合のみ）。
    pub fn status(&self) -> Option<u16> {
        match self {
            LoadError::Fetch { status, .. } => *status,
            _ => None,
        }
    }
}
