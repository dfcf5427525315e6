//! # HTTPクライアント
//!
//! reqwestによる `NetworkClient` 実装。レスポンスボディはチャンク単位で読み出す。

use std::time::Duration;

use usewasm_types::Credentials;

use super::{FetchError, FetchRequest, FetchResponse, NetworkClient, ResponseBody};

/// reqwestベースのHTTPクライアント。
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// 全リクエスト共通のタイムアウトを指定して生成する。
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("HTTPクライアントの初期化に失敗: {e}")))?;
        Ok(Self { client })
    }

    /// 構築済みのreqwestクライアントを使う。
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl NetworkClient for HttpClient {
    async fn send(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.credentials {
            Some(Credentials::Bearer { token }) => builder.bearer_auth(token),
            Some(Credentials::Basic { username, password }) => {
                builder.basic_auth(username, password.as_ref())
            }
            None => builder,
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(format!("{e} ({})", request.url)))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(FetchResponse::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
            headers,
            Box::new(ReqwestBody(response)),
        ))
    }
}

struct ReqwestBody(reqwest::Response);

#[async_trait::async_trait]
impl ResponseBody for ReqwestBody {
    async fn chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        self.0
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|e| FetchError::Body(e.to_string()))
    }
}
