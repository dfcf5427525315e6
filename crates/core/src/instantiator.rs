//! # インスタンス化
//!
//! 取得済みレスポンスをランタイムに渡し、モジュールとインスタンスを得る。
//!
//! - ストリーミング: レスポンスをそのまま `instantiate_streaming` に渡す
//! - バッファ: ボディを全て読み込んでから `instantiate` を呼ぶ。コンパイルは
//!   ブロッキングスレッドで行い、その間もキャンセルを受け付ける
//!
//! どちらもキャンセルされた時点で `Ok(None)` を返す。

use std::sync::Arc;

use usewasm_wasm_host::{ImportMap, Instantiated, ModuleRuntime, RuntimeError};

use crate::cancel::CancellationToken;
use crate::error::LoadError;
use crate::fetcher::FetchResponse;

/// レスポンスからモジュールをインスタンス化する。
pub async fn instantiate(
    runtime: &Arc<dyn ModuleRuntime>,
    mut response: FetchResponse,
    imports: &ImportMap,
    streaming: bool,
    token: &CancellationToken,
) -> Result<Option<Instantiated>, LoadError> {
    if streaming {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            result = runtime.instantiate_streaming(&mut response, imports) => result,
        };
        return Ok(Some(result?));
    }

    let Some(bytes) = read_body(&mut response, token).await? else {
        return Ok(None);
    };
    tracing::debug!(bytes = bytes.len(), "レスポンスボディを読み込みました");

    let runtime = Arc::clone(runtime);
    let imports = imports.clone();
    let compile = tokio::task::spawn_blocking(move || runtime.instantiate(&bytes, &imports));
    let joined = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(None),
        joined = compile => joined,
    };
    match joined {
        Ok(result) => Ok(Some(result?)),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(LoadError::Instantiation(RuntimeError::Instantiate(format!(
            "コンパイルタスクが終了しました: {e}"
        )))),
    }
}

/// ボディを全て読み込む。チャンク間でキャンセルを確認する。
async fn read_body(
    response: &mut FetchResponse,
    token: &CancellationToken,
) -> Result<Option<Vec<u8>>, LoadError> {
    let mut bytes = Vec::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            chunk = response.chunk() => chunk?,
        };
        match chunk {
            Some(chunk) => bytes.extend_from_slice(&chunk),
            None => return Ok(Some(bytes)),
        }
    }
}
