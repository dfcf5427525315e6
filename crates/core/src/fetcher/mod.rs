//! # WASMバイナリ取得
//!
//! ネットワーク経由でのモジュール取得を抽象化する。
//!
//! ## クライアント実装
//! - `HttpClient`: reqwestによるHTTP取得（本番用）
//! - 任意の `NetworkClient` 実装（テスト用モック等）
//!
//! 送信時は呼び出し元のヘッダーを保持したまま `Content-Type: application/wasm` を強制する。

pub mod http;

pub use http::HttpClient;

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use reqwest::Url;
use usewasm_types::{Credentials, FetchOptions};
use usewasm_wasm_host::{ModuleSource, RuntimeError, WASM_MIME_TYPE};

use crate::cancel::CancellationToken;
use crate::error::LoadError;

/// 取得処理のエラー型（ステータス以外の失敗）。
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// 接続失敗・タイムアウト等
    #[error("ネットワークエラー: {0}")]
    Network(String),
    /// レスポンスボディの読み取り失敗
    #[error("レスポンスボディの読み取りに失敗: {0}")]
    Body(String),
    /// リクエストの構築に失敗（不正なメソッド等）
    #[error("不正なリクエスト: {0}")]
    InvalidRequest(String),
}

/// 送信するリクエスト。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    /// `Content-Type: application/wasm` を含むマージ済みヘッダー
    pub headers: Vec<(String, String)>,
    pub credentials: Option<Credentials>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// 呼び出し元の設定から送信リクエストを組み立てる。
    ///
    /// 呼び出し元の `Content-Type` は破棄され、`application/wasm` に置き換わる。
    pub fn new(url: impl Into<String>, options: &FetchOptions) -> Self {
        let mut headers: Vec<(String, String)> = options
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("content-type"))
            .cloned()
            .collect();
        headers.push(("Content-Type".to_string(), WASM_MIME_TYPE.to_string()));

        Self {
            url: url.into(),
            method: options.method.clone(),
            headers,
            credentials: options.credentials.clone(),
            timeout: options.timeout_ms.map(Duration::from_millis),
        }
    }

    /// ヘッダー値を取得する（大文字小文字を区別しない）。
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// チャンク単位で読み取るレスポンスボディ。
#[async_trait::async_trait]
pub trait ResponseBody: Send {
    /// 次のチャンク。終端ではNone。
    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError>;
}

/// メモリ上のチャンク列によるボディ。
#[derive(Debug, Default)]
pub struct MemoryBody {
    chunks: VecDeque<Vec<u8>>,
}

impl MemoryBody {
    /// `bytes` を `chunk_size` ごとに分割したボディ。
    pub fn new(bytes: &[u8], chunk_size: usize) -> Self {
        Self {
            chunks: bytes
                .chunks(chunk_size.max(1))
                .map(<[u8]>::to_vec)
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl ResponseBody for MemoryBody {
    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(self.chunks.pop_front())
    }
}

/// 受信したレスポンス。ボディは未読のまま保持する。
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    body: Box<dyn ResponseBody>,
}

impl FetchResponse {
    pub fn new(
        status: u16,
        status_text: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Box<dyn ResponseBody>,
    ) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
            body,
        }
    }

    /// 2xxかどうか。
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// 次のボディチャンク。
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        self.body.chunk().await
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ModuleSource for FetchResponse {
    fn content_type(&self) -> Option<&str> {
        FetchResponse::content_type(self)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RuntimeError> {
        self.chunk()
            .await
            .map_err(|e| RuntimeError::Source(e.to_string()))
    }
}

/// ネットワーククライアントのトレイト。
///
/// ロード処理はこのトレイトにのみ依存し、HTTPクライアントを差し替えられる。
#[async_trait::async_trait]
pub trait NetworkClient: Send + Sync {
    /// リクエストを送信し、ヘッダー受信時点のレスポンスを返す。
    ///
    /// 返却前にFutureが破棄された場合、転送は中断されなければならない。
    async fn send(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// パスを取得先URLに解決する。ベースURLがなければそのまま使う。
pub fn resolve_url(base: Option<&Url>, path: &str) -> Result<String, LoadError> {
    match base {
        Some(base) => base
            .join(path)
            .map(|url| url.to_string())
            .map_err(|e| LoadError::Precondition(format!("URLを解決できません ({path}): {e}"))),
        None => Ok(path.to_string()),
    }
}

/// モジュールを取得する。
///
/// - 非2xx: `LoadError::Fetch`（ステータステキスト付き）
/// - キャンセル: 送信中のリクエストを破棄して `Ok(None)`
pub async fn fetch(
    client: &dyn NetworkClient,
    url: &str,
    options: &FetchOptions,
    token: &CancellationToken,
) -> Result<Option<FetchResponse>, LoadError> {
    if token.is_cancelled() {
        return Ok(None);
    }

    let request = FetchRequest::new(url, options);
    tracing::debug!(url, method = %request.method, "WASMファイルを取得します");

    let response = tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!(url, "取得をキャンセルしました");
            return Ok(None);
        }
        result = client.send(request) => result?,
    };

    if !response.is_success() {
        tracing::warn!(url, status = response.status, "WASMファイルの取得に失敗");
        return Err(LoadError::Fetch {
            status: Some(response.status),
            status_text: response.status_text.clone(),
        });
    }
    Ok(Some(response))
}
