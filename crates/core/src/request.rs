//! # ロード要求

use std::fmt;
use std::sync::Arc;

use usewasm_types::{FetchOptions, MemoryLimits, RestartPolicy};
use usewasm_wasm_host::{EnvFactory, HostBindings, Memory};

/// ロードオプション。
#[derive(Clone)]
pub struct LoadOptions {
    /// ストリーミングインスタンス化を使うか
    pub streaming: bool,
    /// 取得リクエストの設定
    pub fetch: FetchOptions,
    /// 呼び出し元が所有するメモリ。指定時は新規生成しない
    pub memory: Option<Memory>,
    /// `env` 名前空間の束縛を生成するファクトリ
    pub env: Option<EnvFactory>,
    /// 内部生成メモリの制限。未指定時は設定の既定値
    pub limits: Option<MemoryLimits>,
    /// falseの場合、メモリもインポートも渡さない最小構成でインスタンス化する
    pub link_imports: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            streaming: false,
            fetch: FetchOptions::default(),
            memory: None,
            env: None,
            limits: None,
            link_imports: true,
        }
    }
}

impl LoadOptions {
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_fetch(mut self, fetch: FetchOptions) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_env<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Memory) -> HostBindings + Send + Sync + 'static,
    {
        self.env = Some(Arc::new(factory));
        self
    }

    pub fn with_limits(mut self, limits: MemoryLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// インポートなしの最小構成にする。
    pub fn without_imports(mut self) -> Self {
        self.link_imports = false;
        self
    }
}

/// メモリとファクトリはハンドルの同一性で比較する。
impl PartialEq for LoadOptions {
    fn eq(&self, other: &Self) -> bool {
        let same_memory = match (&self.memory, &other.memory) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        let same_env = match (&self.env, &other.env) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.streaming == other.streaming
            && self.fetch == other.fetch
            && self.limits == other.limits
            && self.link_imports == other.link_imports
            && same_memory
            && same_env
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("streaming", &self.streaming)
            .field("fetch", &self.fetch)
            .field("memory", &self.memory)
            .field("env", &self.env.as_ref().map(|_| "<factory>"))
            .field("limits", &self.limits)
            .field("link_imports", &self.link_imports)
            .finish()
    }
}

/// ロード要求。`path` は空であってはならない。
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub path: String,
    pub options: LoadOptions,
}

impl LoadRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            options: LoadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// 再起動ポリシーの下で同じ要求とみなせるか。
    pub fn same_identity(&self, other: &LoadRequest, policy: RestartPolicy) -> bool {
        match policy {
            RestartPolicy::Path => self.path == other.path,
            RestartPolicy::PathAndOptions => self == other,
        }
    }
}

impl From<&str> for LoadRequest {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for LoadRequest {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}
