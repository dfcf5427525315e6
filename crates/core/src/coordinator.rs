//! # ロードコーディネーター
//!
//! ロード要求を受け付け、取得からインスタンス化までのパイプラインを
//! 要求ごとのタスクとして実行し、結果を `LoadState` として公開する。
//!
//! ## 状態遷移
//! `Loading → Ready` / `Loading → Failed`（Failedでは状態は `is_loading == true` のまま）
//!
//! ## 後勝ち
//! 要求の置き換え・破棄は世代番号を進める。公開は `send_if_modified` の中で
//! 世代番号を比較してから行うため、置き換えられた要求の結果は公開されない。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use usewasm_wasm_host::{
    acquire_memory, build_imports, Exports, ImportMap, Memory, ModuleRuntime,
};

use crate::cancel::CancellationToken;
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::fetcher::{self, NetworkClient};
use crate::instantiator;
use crate::request::{LoadOptions, LoadRequest};
use crate::scope::Scope;
use crate::state::{FromExports, LoadState};


/// ロード要求の最終結果（エラー以外）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// 結果を公開した
    Ready,
    /// 置き換え・破棄により中断した
    Cancelled,
}

/// 受け付けたロード要求のハンドル。
#[derive(Debug)]
pub struct LoadHandle {
    task: JoinHandle<Result<LoadOutcome, LoadError>>,
}

impl LoadHandle {
    /// 要求の完了を待つ。
    pub async fn join(self) -> Result<LoadOutcome, LoadError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(LoadOutcome::Cancelled),
        }
    }
}

struct ActiveLoad {
    request: LoadRequest,
    scope: Scope,
}

/// ロードコーディネーター。
///
/// 同時に有効な要求は1つだけ。破棄時（`Drop`）に有効な要求を中断する。
pub struct LoadCoordinator<T: FromExports = Exports> {
    network: Arc<dyn NetworkClient>,
    runtime: Arc<dyn ModuleRuntime>,
    config: LoaderConfig,
    state: Arc<watch::Sender<LoadState<T>>>,
    generation: Arc<AtomicU64>,
    active: Option<ActiveLoad>,
}

impl<T: FromExports> LoadCoordinator<T> {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        runtime: Arc<dyn ModuleRuntime>,
        config: LoaderConfig,
    ) -> Self {
        let (tx, _rx) = watch::channel(LoadState::initial());
        Self {
            network,
            runtime,
            config,
            state: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
            active: None,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// 状態の更新を購読する。
    pub fn subscribe(&self) -> watch::Receiver<LoadState<T>> {
        self.state.subscribe()
    }

    /// 現在の状態のスナップショット。
    pub fn state(&self) -> LoadState<T> {
        self.state.borrow().clone()
    }

    /// 現在有効な要求。
    pub fn current_request(&self) -> Option<&LoadRequest> {
        self.active.as_ref().map(|a| &a.request)
    }

    /// ロード要求を受け付ける。
    ///
    /// - 空のパス・不正なメモリ制限: `LoadError::Precondition`（状態は変わらない）
    /// - 識別キーが現在の要求と同じ: 何もせず `Ok(None)`
    /// - それ以外: 現在の要求を置き換え、新しいパイプラインを開始する
    pub fn load(&mut self, request: impl Into<LoadRequest>) -> Result<Option<LoadHandle>, LoadError> {
        let request = request.into();
        validate(&request)?;

        if let Some(active) = &self.active {
            if active
                .request
                .same_identity(&request, self.config.restart_policy)
            {
                tracing::debug!(path = %request.path, "識別キーが変わらないため再ロードしません");
                return Ok(None);
            }
        }
        self.start(request).map(Some)
    }

    /// 現在の要求を識別キーに関係なく再実行する。要求がなければ `Ok(None)`。
    pub fn reload(&mut self) -> Result<Option<LoadHandle>, LoadError> {
        let Some(request) = self.current_request().cloned() else {
            return Ok(None);
        };
        self.start(request).map(Some)
    }

    /// 有効な要求を中断し、内部生成メモリを解放する。何度呼んでもよい。
    pub fn teardown(&mut self) {
        let generation = &self.generation;
        self.state.send_if_modified(|_| {
            generation.fetch_add(1, Ordering::SeqCst);
            false
        });
        if let Some(mut active) = self.active.take() {
            active.scope.close();
            tracing::info!(path = %active.request.path, "ロードを破棄しました");
        }
    }

    fn start(&mut self, request: LoadRequest) -> Result<LoadHandle, LoadError> {
        let url = fetcher::resolve_url(self.config.base_url.as_ref(), &request.path)?;

        let provisioned = if request.options.link_imports {
            let limits = request.options.limits.unwrap_or(self.config.default_limits);
            Some(acquire_memory(
                self.runtime.as_ref(),
                request.options.memory.as_ref(),
                limits,
            )?)
        } else {
            None
        };
        let scope = Scope::new(provisioned);

        // 置き換え: 世代を進めてロード中を公開し、旧スコープを閉じる
        let mut generation = 0;
        self.state.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            state.is_loading = true;
        });
        if let Some(mut previous) = self.active.take() {
            previous.scope.close();
            tracing::debug!(path = %previous.request.path, "前の要求を置き換えました");
        }

        tracing::info!(%url, streaming = request.options.streaming, "ロードを開始します");
        let pipeline = Pipeline {
            network: Arc::clone(&self.network),
            runtime: Arc::clone(&self.runtime),
            state: Arc::clone(&self.state),
            generation: Arc::clone(&self.generation),
            expected_generation: generation,
            token: scope.token().clone(),
            memory: scope.memory().cloned(),
            url,
            options: request.options.clone(),
        };
        let task = tokio::spawn(pipeline.run());

        self.active = Some(ActiveLoad { request, scope });
        Ok(LoadHandle { task })
    }
}

impl<T: FromExports> Drop for LoadCoordinator<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn validate(request: &LoadRequest) -> Result<(), LoadError> {
    if request.path.is_empty() {
        return Err(LoadError::Precondition("パスが空です".to_string()));
    }
    if let Some(limits) = request.options.limits {
        limits.validate().map_err(LoadError::Precondition)?;
    }
    Ok(())
}

/// 1つの要求のパイプライン。専用タスクで実行される。
struct Pipeline<T: FromExports> {
    network: Arc<dyn NetworkClient>,
    runtime: Arc<dyn ModuleRuntime>,
    state: Arc<watch::Sender<LoadState<T>>>,
    generation: Arc<AtomicU64>,
    expected_generation: u64,
    token: CancellationToken,
    memory: Option<Memory>,
    url: String,
    options: LoadOptions,
}

impl<T: FromExports> Pipeline<T> {
    async fn run(self) -> Result<LoadOutcome, LoadError> {
        let result = self.execute().await;
        match result {
            Err(e) if self.superseded() => {
                tracing::debug!(url = %self.url, "置き換え済みの要求のエラーを破棄しました: {e}");
                Ok(LoadOutcome::Cancelled)
            }
            Err(e) => {
                tracing::warn!(url = %self.url, "ロードに失敗: {e}");
                Err(e)
            }
            ok => ok,
        }
    }

    fn superseded(&self) -> bool {
        self.token.is_cancelled()
            || self.generation.load(Ordering::SeqCst) != self.expected_generation
    }

    async fn execute(&self) -> Result<LoadOutcome, LoadError> {
        let imports = match &self.memory {
            Some(memory) => build_imports(memory, self.options.env.as_ref()),
            None => ImportMap::empty(),
        };

        let Some(response) = fetcher::fetch(
            self.network.as_ref(),
            &self.url,
            &self.options.fetch,
            &self.token,
        )
        .await?
        else {
            return Ok(LoadOutcome::Cancelled);
        };

        let Some(instantiated) = instantiator::instantiate(
            &self.runtime,
            response,
            &imports,
            self.options.streaming,
            &self.token,
        )
        .await?
        else {
            return Ok(LoadOutcome::Cancelled);
        };

        let exports = instantiated.instance.exports()?;
        let typed = T::from_exports(&exports)?;
        // インスタンス自身のメモリがあればそちらを報告する
        let memory = exports.memory().cloned().or_else(|| self.memory.clone());

        let next = LoadState {
            is_loading: false,
            exports: typed,
            module: Some(instantiated.module),
            instance: Some(instantiated.instance),
            memory,
        };
        if self.publish(next) {
            tracing::info!(url = %self.url, exports = exports.len(), "ロードが完了しました");
            Ok(LoadOutcome::Ready)
        } else {
            tracing::debug!(url = %self.url, "置き換え済みのため結果を破棄しました");
            Ok(LoadOutcome::Cancelled)
        }
    }

    /// 世代番号が一致する場合のみ公開する。
    fn publish(&self, next: LoadState<T>) -> bool {
        self.state.send_if_modified(|state| {
            if self.superseded() {
                return false;
            }
            *state = next;
            true
        })
    }
}
