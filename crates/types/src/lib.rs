//! # usewasm 共有型定義
//!
//! ロードパイプラインの各クレートが共有する設定値・スナップショットを
//! serde対応のRust構造体として提供する。
//!
//! ## 単位
//! - メモリサイズ: WebAssemblyページ（64KiB）
//! - タイムアウト: ミリ秒

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// メモリ制限
// ---------------------------------------------------------------------------

/// WebAssemblyの1ページのサイズ（バイト）。
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// 内部生成メモリのデフォルト初期ページ数。
pub const DEFAULT_INITIAL_PAGES: u32 = 256;

/// 内部生成メモリのデフォルト最大ページ数。
pub const DEFAULT_MAXIMUM_PAGES: u32 = 512;

/// 線形メモリのページ数制限。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    /// 初期ページ数
    pub initial: u32,
    /// 最大ページ数
    pub maximum: u32,
}

impl MemoryLimits {
    pub fn new(initial: u32, maximum: u32) -> Self {
        Self { initial, maximum }
    }

    /// `initial <= maximum` を検証する。
    pub fn validate(&self) -> Result<(), String> {
        if self.initial > self.maximum {
            return Err(format!(
                "初期ページ数が最大ページ数を超えています: initial={} maximum={}",
                self.initial, self.maximum
            ));
        }
        Ok(())
    }

    /// 初期サイズ（バイト）。
    pub fn initial_bytes(&self) -> u64 {
        u64::from(self.initial) * WASM_PAGE_SIZE
    }
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_PAGES,
            maximum: DEFAULT_MAXIMUM_PAGES,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTPリクエスト設定
// ---------------------------------------------------------------------------

/// リクエストに付与する認証情報。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// `Authorization: Basic ...`
    Basic {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

/// モジュール取得時のHTTPリクエスト設定。
///
/// `Content-Type` は送信時に常に `application/wasm` で上書きされる。
/// それ以外のヘッダーは指定順のまま送信される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// HTTPメソッド
    #[serde(default = "default_method")]
    pub method: String,
    /// 追加ヘッダー（名前, 値）
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// 認証情報
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// リクエスト単位のタイムアウト（ミリ秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: Vec::new(),
            credentials: None,
            timeout_ms: None,
        }
    }
}

impl FetchOptions {
    /// ヘッダーを1つ追加する。
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// ---------------------------------------------------------------------------
// 再起動ポリシー
// ---------------------------------------------------------------------------

/// ロードを再起動するかどうかを決める識別キーの範囲。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// パスが変わった時のみ再起動する
    #[default]
    Path,
    /// パスまたはオプションが変わった時に再起動する
    PathAndOptions,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "path" => Ok(Self::Path),
            "path-and-options" | "options" => Ok(Self::PathAndOptions),
            other => Err(format!("不明な再起動ポリシー: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ロード状態のスナップショット
// ---------------------------------------------------------------------------

/// エクスポートの種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    Function,
    Memory,
    Global,
    Table,
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportKind::Function => "function",
            ExportKind::Memory => "memory",
            ExportKind::Global => "global",
            ExportKind::Table => "table",
        };
        f.write_str(s)
    }
}

/// エクスポート1件の概要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    /// エクスポート名
    pub name: String,
    /// 種別
    pub kind: ExportKind,
    /// 関数シグネチャ（関数の場合のみ、例: "(i32, i32) -> i32"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// ロード状態のシリアライズ可能な概要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// ロード中かどうか
    pub is_loading: bool,
    /// エクスポート一覧（名前順）
    pub exports: Vec<ExportSummary>,
    /// 報告対象メモリの現在のページ数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_pages: Option<u64>,
}
