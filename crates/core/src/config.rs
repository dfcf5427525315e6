//! # ローダー設定
//!
//! 環境変数からロードコーディネーターの設定を読み込む。
//!
//! | 変数 | 既定値 |
//! |------|--------|
//! | `USEWASM_BASE_URL` | なし（パスをそのまま使う） |
//! | `USEWASM_TIMEOUT_SECS` | 120 |
//! | `USEWASM_INITIAL_PAGES` | 256 |
//! | `USEWASM_MAXIMUM_PAGES` | 512 |
//! | `USEWASM_RESTART_POLICY` | `path` |
//! | `USEWASM_FUEL_LIMIT` | なし（無制限） |

use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use usewasm_types::{MemoryLimits, RestartPolicy};

/// HTTPリクエスト全体のデフォルトタイムアウト（秒）。
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// 設定読み込みのエラー型。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("環境変数 {name} の値が不正です ({value}): {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// ロードコーディネーターの設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// 相対パスの解決に使うベースURL
    pub base_url: Option<Url>,
    /// HTTPクライアント全体のタイムアウト
    pub request_timeout: Duration,
    /// 呼び出し元がメモリも制限も渡さなかった場合の制限
    pub default_limits: MemoryLimits,
    pub restart_policy: RestartPolicy,
    /// ゲスト実行の燃料上限
    pub fuel_limit: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            default_limits: MemoryLimits::default(),
            restart_policy: RestartPolicy::default(),
            fuel_limit: None,
        }
    }
}

impl LoaderConfig {
    /// プロセスの環境変数から読み込む。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// 任意の変数ソースから読み込む。未設定・空文字の変数は既定値になる。
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = var("USEWASM_BASE_URL") {
            config.base_url = Some(Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidValue {
                name: "USEWASM_BASE_URL",
                value: raw.clone(),
                reason: e.to_string(),
            })?);
        }
        if let Some(raw) = var("USEWASM_TIMEOUT_SECS") {
            config.request_timeout =
                Duration::from_secs(parse_number("USEWASM_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = var("USEWASM_INITIAL_PAGES") {
            config.default_limits.initial = parse_number("USEWASM_INITIAL_PAGES", &raw)?;
        }
        if let Some(raw) = var("USEWASM_MAXIMUM_PAGES") {
            config.default_limits.maximum = parse_number("USEWASM_MAXIMUM_PAGES", &raw)?;
        }
        config
            .default_limits
            .validate()
            .map_err(|reason| ConfigError::InvalidValue {
                name: "USEWASM_INITIAL_PAGES",
                value: config.default_limits.initial.to_string(),
                reason,
            })?;

        if let Some(raw) = var("USEWASM_RESTART_POLICY") {
            config.restart_policy =
                raw.trim()
                    .parse()
                    .map_err(|reason| ConfigError::InvalidValue {
                        name: "USEWASM_RESTART_POLICY",
                        value: raw.clone(),
                        reason,
                    })?;
        }
        if let Some(raw) = var("USEWASM_FUEL_LIMIT") {
            config.fuel_limit = Some(parse_number("USEWASM_FUEL_LIMIT", &raw)?);
        }

        Ok(config)
    }
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}
