//! テスト用のモックネットワーク・フィクスチャ・HTTPサーバー。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::fetcher::{FetchError, FetchRequest, FetchResponse, MemoryBody, NetworkClient};

// ---------------------------------------------------------------------------
// フィクスチャ
// ---------------------------------------------------------------------------

pub const ADD_WAT: &str = r#"
    (module
      (func (export "add") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.add))
"#;

/// `js.mem` と `env.report` をインポートし、メモリへ書き込んでから報告する。
pub const IMPORTS_WAT: &str = r#"
    (module
      (import "js" "mem" (memory 1))
      (import "env" "report" (func $report (param i32)))
      (func (export "store_and_report") (param i32)
        i32.const 0
        local.get 0
        i32.store
        local.get 0
        call $report)
      (func (export "peek") (result i32)
        i32.const 0
        i32.load))
"#;

/// 自身のメモリをエクスポートする。
pub const OWN_MEMORY_WAT: &str = r#"
    (module
      (memory (export "memory") 3 6)
      (func (export "pages") (result i32)
        memory.size))
"#;

pub fn add_module() -> Vec<u8> {
    wat::parse_str(ADD_WAT).unwrap()
}

pub fn imports_module() -> Vec<u8> {
    wat::parse_str(IMPORTS_WAT).unwrap()
}

pub fn own_memory_module() -> Vec<u8> {
    wat::parse_str(OWN_MEMORY_WAT).unwrap()
}

pub fn wasm_headers() -> Vec<(String, String)> {
    vec![("content-type".to_string(), "application/wasm".to_string())]
}

// ---------------------------------------------------------------------------
// モックネットワーク
// ---------------------------------------------------------------------------

/// モックの応答定義。
#[derive(Clone)]
pub struct MockRoute {
    status: u16,
    status_text: String,
    content_type: Option<String>,
    body: Vec<u8>,
    error: Option<String>,
    gate: Option<Arc<Notify>>,
}

impl MockRoute {
    /// 200 + `application/wasm`。
    pub fn wasm(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            content_type: Some("application/wasm".to_string()),
            body,
            error: None,
            gate: None,
        }
    }

    pub fn status(status: u16, status_text: &str) -> Self {
        Self {
            status,
            status_text: status_text.to_string(),
            content_type: None,
            body: Vec::new(),
            error: None,
            gate: None,
        }
    }

    pub fn network_error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::status(0, "")
        }
    }

    pub fn content_type(mut self, content_type: Option<&str>) -> Self {
        self.content_type = content_type.map(str::to_string);
        self
    }

    /// `gate()` が通知されるまで応答を保留する。
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn gate(&self) -> Arc<Notify> {
        Arc::clone(self.gate.as_ref().expect("gated() で生成したルートのみ"))
    }
}

#[derive(Default)]
struct MockInner {
    routes: Mutex<HashMap<String, MockRoute>>,
    requests: Mutex<Vec<FetchRequest>>,
    request_seen: Notify,
    aborted: AtomicUsize,
}

/// URL単位で応答を定義できる `NetworkClient`。未定義のURLは404を返す。
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<MockInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, route: MockRoute) {
        self.inner
            .routes
            .lock()
            .unwrap()
            .insert(url.to_string(), route);
    }

    /// 受信したリクエスト（送信順）。
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    /// 応答前に破棄されたリクエスト数。
    pub fn aborted(&self) -> usize {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// `n` 件のリクエストを受信するまで待つ。
    pub async fn wait_for_requests(&self, n: usize) {
        loop {
            let notified = self.inner.request_seen.notified();
            if self.inner.requests.lock().unwrap().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

/// 応答前にFutureが破棄された場合に数える。
struct AbortGuard {
    inner: Arc<MockInner>,
    armed: bool,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl NetworkClient for MockNetwork {
    async fn send(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let route = self.inner.routes.lock().unwrap().get(&request.url).cloned();
        self.inner.requests.lock().unwrap().push(request);
        self.inner.request_seen.notify_waiters();

        let Some(route) = route else {
            return Ok(FetchResponse::new(
                404,
                "Not Found",
                Vec::new(),
                Box::new(MemoryBody::default()),
            ));
        };

        let mut guard = AbortGuard {
            inner: Arc::clone(&self.inner),
            armed: true,
        };
        if let Some(gate) = &route.gate {
            gate.notified().await;
        }
        guard.armed = false;

        if let Some(message) = route.error {
            return Err(FetchError::Network(message));
        }
        let headers = route
            .content_type
            .map(|ct| vec![("content-type".to_string(), ct)])
            .unwrap_or_default();
        Ok(FetchResponse::new(
            route.status,
            route.status_text,
            headers,
            Box::new(MemoryBody::new(&route.body, 16)),
        ))
    }
}

// ---------------------------------------------------------------------------
// HTTPサーバー
// ---------------------------------------------------------------------------

/// テスト用HTTPサーバー。受信したリクエストヘッダーを記録する。
pub struct MockServer {
    port: u16,
    requests: Arc<Mutex<Vec<Vec<(String, String)>>>>,
}

impl MockServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    /// 受信したリクエストのヘッダー（名前は小文字）。
    pub fn requests(&self) -> Vec<Vec<(String, String)>> {
        self.requests.lock().unwrap().clone()
    }
}

/// `path` で `body` を返すHTTPサーバーを起動する。
pub async fn start_mock_server(path: &str, body: Vec<u8>, content_type: &'static str) -> MockServer {
    use axum::http::{header, HeaderMap};
    use axum::routing::get;

    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);
    let app = axum::Router::new().route(
        path,
        get(move |headers: HeaderMap| {
            let body = body.clone();
            let recorded = Arc::clone(&recorded);
            async move {
                let seen: Vec<(String, String)> = headers
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str()
                            .ok()
                            .map(|v| (k.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                recorded.lock().unwrap().push(seen);
                ([(header::CONTENT_TYPE, content_type)], body)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    MockServer { port, requests }
}
