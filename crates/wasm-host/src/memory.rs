//! # 線形メモリハンドル
//!
//! wasmtimeのメモリはストアに属するため、ハンドルは所属ストアを共有参照で保持する。
//! 同じストアに対するインスタンス化・関数呼び出しは全てこのロックを経由する。
//!
//! ホスト関数の実行中はストアのロックが呼び出し側に握られている。その間に
//! 同じスレッドから同じストアのハンドルを使うと、ロックではなく実行中の
//! 呼び出しコンテキスト（`Caller`）を経由して操作する。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wasmtime::{AsContextMut, Caller, Store, StoreContextMut};

use crate::RuntimeError;

/// ストアに保持するホスト側状態。
#[derive(Default)]
pub struct HostState {
    /// `js.mem` としてリンクされたメモリ（ホスト関数からのアクセス用）
    pub(crate) linked_memory: Option<wasmtime::Memory>,
}

pub(crate) type SharedStore = Arc<Mutex<Store<HostState>>>;

/// ストアをロックする。パニックでポイズンされていても中身を使い続ける。
pub(crate) fn lock(store: &SharedStore) -> MutexGuard<'_, Store<HostState>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// ストアの識別子（共有参照のアドレス）。
pub(crate) fn store_id(store: &SharedStore) -> usize {
    Arc::as_ptr(store) as usize
}

/// このスレッドで実行中のホスト関数。
#[derive(Clone, Copy)]
struct ActiveCall {
    store: usize,
    caller: *const (),
}

thread_local! {
    static ACTIVE_CALL: Cell<Option<ActiveCall>> = const { Cell::new(None) };
}

/// ホスト関数の実行区間。破棄時に外側の区間へ戻す。
pub(crate) struct HostCallScope<'s> {
    previous: Option<ActiveCall>,
    _caller: std::marker::PhantomData<&'s ()>,
}

impl<'s> HostCallScope<'s> {
    /// `caller` を `store` の実行中コンテキストとして登録する。
    pub(crate) fn enter(store: usize, caller: &'s RefCell<Caller<'_, HostState>>) -> Self {
        let active = ActiveCall {
            store,
            caller: (caller as *const RefCell<Caller<'_, HostState>>).cast(),
        };
        let previous = ACTIVE_CALL.with(|cell| cell.replace(Some(active)));
        Self {
            previous,
            _caller: std::marker::PhantomData,
        }
    }
}

impl Drop for HostCallScope<'_> {
    fn drop(&mut self) {
        ACTIVE_CALL.with(|cell| cell.set(self.previous));
    }
}

/// 拡張可能な線形メモリへの共有ハンドル。
///
/// クローンは同じメモリを指す。ホスト関数の中から呼んでもよい
/// （`EnvFactory` に渡されたハンドルをクロージャに閉じ込める使い方を想定）。
#[derive(Clone)]
pub struct Memory {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    store: SharedStore,
    raw: wasmtime::Memory,
    maximum: Option<u64>,
    released: AtomicBool,
}

impl Memory {
    pub(crate) fn from_parts(store: SharedStore, raw: wasmtime::Memory, maximum: Option<u64>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                store,
                raw,
                maximum,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn raw(&self) -> wasmtime::Memory {
        self.inner.raw
    }

    pub(crate) fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    /// ストアのコンテキストで `f` を実行する。
    ///
    /// 同じストアのホスト関数を実行中なら、その呼び出しコンテキストを使う。
    fn with_context<R>(&self, f: impl FnOnce(StoreContextMut<'_, HostState>) -> R) -> R {
        let id = store_id(&self.inner.store);
        if let Some(active) = ACTIVE_CALL.with(Cell::get).filter(|a| a.store == id) {
            // SAFETY: 登録は `HostCallScope` の生存中に限られ、その間 `RefCell` は移動も破棄もされない
            let caller = unsafe { &*active.caller.cast::<RefCell<Caller<'_, HostState>>>() };
            if let Ok(mut caller) = caller.try_borrow_mut() {
                return f(caller.as_context_mut());
            }
        }
        let mut store = lock(&self.inner.store);
        f(store.as_context_mut())
    }

    /// 現在のページ数。
    pub fn size_pages(&self) -> u64 {
        self.with_context(|ctx| self.inner.raw.size(&ctx))
    }

    /// 現在のサイズ（バイト）。
    pub fn data_size(&self) -> usize {
        self.with_context(|ctx| self.inner.raw.data_size(&ctx))
    }

    /// 最大ページ数（無制限の場合はNone）。
    pub fn maximum_pages(&self) -> Option<u64> {
        self.inner.maximum
    }

    /// `delta` ページ拡張し、拡張前のページ数を返す。
    pub fn grow(&self, delta: u64) -> Result<u64, RuntimeError> {
        self.with_context(|mut ctx| self.inner.raw.grow(&mut ctx, delta))
            .map_err(|e| RuntimeError::Memory(format!("メモリの拡張に失敗 (+{delta}ページ): {e}")))
    }

    /// `offset` から `len` バイトを読み取る。
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, RuntimeError> {
        let mut buf = vec![0u8; len];
        self.with_context(|ctx| self.inner.raw.read(&ctx, offset, &mut buf))
            .map_err(|e| RuntimeError::Memory(format!("範囲外の読み取り (offset={offset}, len={len}): {e}")))?;
        Ok(buf)
    }

    /// `offset` に `data` を書き込む。
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        self.with_context(|mut ctx| self.inner.raw.write(&mut ctx, offset, data))
            .map_err(|e| {
                RuntimeError::Memory(format!(
                    "範囲外の書き込み (offset={offset}, len={}): {e}",
                    data.len()
                ))
            })
    }

    /// 同じハンドル（同一生成元）かどうか。
    pub fn ptr_eq(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 所有者によって解放済みかどうか。
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// 所有者側の解放処理。2回目以降はfalseを返し何もしない。
    ///
    /// 0ページ拡張で所有者側のアカウンティングを発火させ、解放済みとして記録する。
    /// ストア本体は最後のハンドルが破棄された時点で解放される。
    pub(crate) fn release_owned(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.grow(0) {
            tracing::warn!("解放時のメモリ操作に失敗: {e}");
        }
        true
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("maximum_pages", &self.inner.maximum)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
