//! # インポート環境
//!
//! モジュールのインポートに渡すホスト側シンボルの対応表を構築する。
//!
//! ## 名前空間
//! - `js.mem`: 予約キー。プロビジョニングしたメモリが常に束縛される
//! - `env.*`: ホスト関数・グローバル・追加メモリ（`EnvFactory` の結果）

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use wasmtime::{Caller, Extern};

use crate::memory::{HostState, Memory};
use crate::value::{Signature, Value, ValueType};
use crate::RuntimeError;

/// メモリを束縛する予約名前空間。
pub const RESERVED_NAMESPACE: &str = "js";

/// 予約名前空間内のメモリキー。
pub const MEMORY_KEY: &str = "mem";

/// ホスト関数・グローバルの名前空間。
pub const HOST_NAMESPACE: &str = "env";

/// ホスト関数の本体。
pub type HostCallback =
    dyn Fn(&HostCaller<'_>, &[Value]) -> Result<Vec<Value>, RuntimeError> + Send + Sync;

/// `env` 名前空間の束縛一覧（名前順）。
pub type HostBindings = BTreeMap<String, HostBinding>;

/// メモリを受け取り、追加の `env` 束縛を返すファクトリ。
pub type EnvFactory = Arc<dyn Fn(&Memory) -> HostBindings + Send + Sync>;

/// 型付きホスト関数。
#[derive(Clone)]
pub struct HostFunc {
    signature: Signature,
    callback: Arc<HostCallback>,
}

impl HostFunc {
    pub fn new<F>(
        params: impl Into<Vec<ValueType>>,
        results: impl Into<Vec<ValueType>>,
        callback: F,
    ) -> Self
    where
        F: Fn(&HostCaller<'_>, &[Value]) -> Result<Vec<Value>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            signature: Signature::new(params, results),
            callback: Arc::new(callback),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn callback(&self) -> Arc<HostCallback> {
        Arc::clone(&self.callback)
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("signature", &self.signature.to_string())
            .finish_non_exhaustive()
    }
}

/// ホスト関数の実行コンテキスト。
///
/// 呼び出し中はストアがロックされている。ゲストメモリにはここから、または
/// `EnvFactory` に渡された `Memory` ハンドルからアクセスできる。
pub struct HostCaller<'a> {
    caller: RefCell<Caller<'a, HostState>>,
}

impl<'a> HostCaller<'a> {
    pub(crate) fn new(caller: Caller<'a, HostState>) -> Self {
        Self {
            caller: RefCell::new(caller),
        }
    }

    pub(crate) fn context(&self) -> &RefCell<Caller<'a, HostState>> {
        &self.caller
    }

    /// `js.mem` としてリンクされたメモリ、なければゲストの `memory` エクスポート。
    fn memory(caller: &mut Caller<'_, HostState>) -> Result<wasmtime::Memory, RuntimeError> {
        if let Some(memory) = caller.data().linked_memory {
            return Ok(memory);
        }
        match caller.get_export("memory") {
            Some(Extern::Memory(memory)) => Ok(memory),
            _ => Err(RuntimeError::MissingExport("memory".to_string())),
        }
    }

    /// ゲストメモリから読み取る。
    pub fn read_memory(&self, offset: usize, len: usize) -> Result<Vec<u8>, RuntimeError> {
        let mut caller = self.caller.borrow_mut();
        let memory = Self::memory(&mut caller)?;
        let mut buf = vec![0u8; len];
        memory
            .read(&*caller, offset, &mut buf)
            .map_err(|e| RuntimeError::Memory(format!("範囲外の読み取り (offset={offset}, len={len}): {e}")))?;
        Ok(buf)
    }

    /// ゲストメモリへ書き込む。
    pub fn write_memory(&self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        let mut caller = self.caller.borrow_mut();
        let memory = Self::memory(&mut caller)?;
        memory.write(&mut *caller, offset, data).map_err(|e| {
            RuntimeError::Memory(format!(
                "範囲外の書き込み (offset={offset}, len={}): {e}",
                data.len()
            ))
        })
    }

    /// ゲストメモリの現在のページ数。
    pub fn memory_pages(&self) -> Result<u64, RuntimeError> {
        let mut caller = self.caller.borrow_mut();
        let memory = Self::memory(&mut caller)?;
        Ok(memory.size(&*caller))
    }
}

/// `env` 名前空間に置く束縛。
#[derive(Debug, Clone)]
pub enum HostBinding {
    Func(HostFunc),
    Global { value: Value, mutable: bool },
    Memory(Memory),
}

/// モジュールに渡すインポート対応表。
#[derive(Debug, Clone, Default)]
pub struct ImportMap {
    memory: Option<Memory>,
    host: HostBindings,
}

impl ImportMap {
    /// インポートなし（最小構成）。
    pub fn empty() -> Self {
        Self::default()
    }

    /// `js.mem` に束縛されたメモリ。
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    /// `env` 名前空間の束縛。
    pub fn host(&self) -> &HostBindings {
        &self.host
    }

    /// 束縛の総数。
    pub fn len(&self) -> usize {
        usize::from(self.memory.is_some()) + self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (名前空間, 名前) の一覧。予約キーが先頭、以降は名前順。
    pub fn keys(&self) -> Vec<(&str, &str)> {
        let reserved = self
            .memory
            .as_ref()
            .map(|_| (RESERVED_NAMESPACE, MEMORY_KEY));
        reserved
            .into_iter()
            .chain(self.host.keys().map(|k| (HOST_NAMESPACE, k.as_str())))
            .collect()
    }
}

/// メモリと任意のファクトリからインポート対応表を構築する。
///
/// ファクトリの結果は `env` 名前空間にのみ入るため、`js.mem` を上書き・改名できない。
pub fn build_imports(memory: &Memory, env: Option<&EnvFactory>) -> ImportMap {
    let host = env.map(|factory| factory(memory)).unwrap_or_default();
    tracing::debug!(host_bindings = host.len(), "インポート環境を構築しました");
    ImportMap {
        memory: Some(memory.clone()),
        host,
    }
}
