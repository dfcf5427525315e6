//! # モジュールランタイム
//!
//! コンパイル・リンク・インスタンス化を抽象化する `ModuleRuntime` トレイトと、
//! wasmtimeによる実装 `WasmtimeRuntime`。
//!
//! ## インスタンス化戦略
//! - バッファ: バイト列を受け取り同期的にコンパイル・リンクする
//! - ストリーミング: 受信中のレスポンスから直接読み込む。MIMEタイプが
//!   `application/wasm` でなければ失敗する（バッファへのフォールバックはしない）

use std::sync::{Arc, Mutex};

use usewasm_types::MemoryLimits;
use wasmtime::{
    Caller, Engine, Global, GlobalType, Linker, MemoryType, Module, Mutability, Store, Val,
};

use crate::imports::{
    HostBinding, HostCaller, HostFunc, ImportMap, HOST_NAMESPACE, MEMORY_KEY, RESERVED_NAMESPACE,
};
use crate::instance::{CompiledModule, Instance};
use crate::memory::{lock, store_id, HostCallScope, HostState, Memory, SharedStore};
use crate::value::Value;
use crate::RuntimeError;

/// WASMバイナリのMIMEタイプ。
pub const WASM_MIME_TYPE: &str = "application/wasm";

/// `\0asm` マジックナンバー + バージョン1。
const WASM_HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

/// Content-Typeが `application/wasm` か判定する（パラメータは無視）。
pub fn is_wasm_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case(WASM_MIME_TYPE))
        .unwrap_or(false)
}

/// 受信中のモジュールバイナリ。
#[async_trait::async_trait]
pub trait ModuleSource: Send {
    /// レスポンスのContent-Type。
    fn content_type(&self) -> Option<&str>;

    /// 次のチャンクを読み取る。終端ではNoneを返す。
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RuntimeError>;
}

/// インスタンス化の結果。
#[derive(Debug, Clone)]
pub struct Instantiated {
    pub module: CompiledModule,
    pub instance: Instance,
}

/// モジュールランタイムのトレイト。
///
/// ネイティブのWASMランタイムを差し替えられるよう、ロード処理はこのトレイトにのみ依存する。
#[async_trait::async_trait]
pub trait ModuleRuntime: Send + Sync {
    /// 指定のページ数制限で拡張可能なメモリを生成する。
    fn create_memory(&self, limits: MemoryLimits) -> Result<Memory, RuntimeError>;

    /// バッファ済みのバイナリをコンパイルし、インポートとリンクする。
    fn instantiate(&self, bytes: &[u8], imports: &ImportMap) -> Result<Instantiated, RuntimeError>;

    /// 受信中のソースから直接コンパイルし、インポートとリンクする。
    async fn instantiate_streaming(
        &self,
        source: &mut dyn ModuleSource,
        imports: &ImportMap,
    ) -> Result<Instantiated, RuntimeError>;
}

/// ランタイム設定。
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// ストアごとのFuel上限（命令実行数の上限、Noneで無制限）
    pub fuel_limit: Option<u64>,
}

/// wasmtimeによる `ModuleRuntime` 実装。
///
/// Engineは全ロードで共有する。ストアはメモリ単位で分かれ、内部生成メモリには
/// 新しいストア、呼び出し元のメモリにはそのメモリのストアを使う。
#[derive(Clone)]
pub struct WasmtimeRuntime {
    engine: Engine,
    config: RuntimeConfig,
}

impl WasmtimeRuntime {
    /// 新しいWasmtimeRuntimeを作成する。
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let mut wasm_config = wasmtime::Config::new();
        if config.fuel_limit.is_some() {
            wasm_config.consume_fuel(true);
        }
        let engine =
            Engine::new(&wasm_config).map_err(|e| RuntimeError::Config(format!("{e:#}")))?;
        Ok(Self { engine, config })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn new_store(&self) -> Result<SharedStore, RuntimeError> {
        let mut store = Store::new(&self.engine, HostState::default());
        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| RuntimeError::Config(format!("Fuelの設定に失敗: {e:#}")))?;
        }
        Ok(Arc::new(Mutex::new(store)))
    }

    /// バイナリをコンパイルする。
    pub fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, RuntimeError> {
        let module = Module::from_binary(&self.engine, bytes)
            .map_err(|e| RuntimeError::Compile(format!("{e:#}")))?;
        Ok(CompiledModule::new(module))
    }

    /// コンパイル済みモジュールをインポートとリンクし、インスタンス化する。
    pub fn link(
        &self,
        module: &CompiledModule,
        imports: &ImportMap,
    ) -> Result<Instance, RuntimeError> {
        let store = match imports.memory() {
            Some(memory) => Arc::clone(memory.store()),
            None => self.new_store()?,
        };
        let mut guard = lock(&store);
        if !Engine::same(guard.engine(), &self.engine) {
            return Err(RuntimeError::Instantiate(
                "別のEngineで生成されたメモリはリンクできません".to_string(),
            ));
        }

        let link_err = |e: wasmtime::Error| RuntimeError::Instantiate(format!("{e:#}"));
        let mut linker: Linker<HostState> = Linker::new(&self.engine);

        if let Some(memory) = imports.memory() {
            linker
                .define(&*guard, RESERVED_NAMESPACE, MEMORY_KEY, memory.raw())
                .map_err(link_err)?;
            guard.data_mut().linked_memory = Some(memory.raw());
        }

        for (name, binding) in imports.host() {
            match binding {
                HostBinding::Func(func) => {
                    let ty = func.signature().to_func_type(&self.engine);
                    linker
                        .func_new(HOST_NAMESPACE, name, ty, host_trampoline(func, store_id(&store)))
                        .map_err(link_err)?;
                }
                HostBinding::Global { value, mutable } => {
                    let mutability = if *mutable {
                        Mutability::Var
                    } else {
                        Mutability::Const
                    };
                    let ty = GlobalType::new(value.ty().to_val_type(), mutability);
                    let global = Global::new(&mut *guard, ty, value.to_val()).map_err(link_err)?;
                    linker
                        .define(&*guard, HOST_NAMESPACE, name, global)
                        .map_err(link_err)?;
                }
                HostBinding::Memory(memory) => {
                    if !Arc::ptr_eq(memory.store(), &store) {
                        return Err(RuntimeError::Instantiate(format!(
                            "env.{name}: 別ストアのメモリはリンクできません"
                        )));
                    }
                    linker
                        .define(&*guard, HOST_NAMESPACE, name, memory.raw())
                        .map_err(link_err)?;
                }
            }
        }

        let raw = linker
            .instantiate(&mut *guard, module.raw())
            .map_err(link_err)?;
        drop(guard);

        tracing::debug!(imports = imports.len(), "モジュールをインスタンス化しました");
        Ok(Instance::new(store, raw, module.clone(), imports.memory().cloned()))
    }
}

/// `HostFunc` をwasmtimeの動的関数に変換する。
///
/// 実行中は呼び出しコンテキストを `store` のものとして登録し、
/// 同じストアの `Memory` ハンドルがロックを取らずに使えるようにする。
fn host_trampoline(
    func: &HostFunc,
    store: usize,
) -> impl Fn(Caller<'_, HostState>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync + 'static
{
    let callback = func.callback();
    let result_types = func.signature().results.clone();
    move |caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
        let args = params
            .iter()
            .map(Value::from_val)
            .collect::<Result<Vec<_>, _>>()
            .map_err(wasmtime::Error::new)?;
        let host_caller = HostCaller::new(caller);
        let values = {
            let _scope = HostCallScope::enter(store, host_caller.context());
            callback(&host_caller, &args)
        }
        .map_err(wasmtime::Error::new)?;

        let actual: Vec<_> = values.iter().map(Value::ty).collect();
        if actual != result_types {
            return Err(wasmtime::Error::new(RuntimeError::HostFunction(format!(
                "戻り値の型が一致しません: 期待 {result_types:?}, 実際 {actual:?}"
            ))));
        }
        for (slot, value) in results.iter_mut().zip(values) {
            *slot = value.to_val();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ModuleRuntime for WasmtimeRuntime {
    fn create_memory(&self, limits: MemoryLimits) -> Result<Memory, RuntimeError> {
        let store = self.new_store()?;
        let raw = {
            let mut guard = lock(&store);
            wasmtime::Memory::new(&mut *guard, MemoryType::new(limits.initial, Some(limits.maximum)))
                .map_err(|e| RuntimeError::Memory(format!("メモリの生成に失敗: {e:#}")))?
        };
        Ok(Memory::from_parts(store, raw, Some(u64::from(limits.maximum))))
    }

    fn instantiate(&self, bytes: &[u8], imports: &ImportMap) -> Result<Instantiated, RuntimeError> {
        let module = self.compile(bytes)?;
        let instance = self.link(&module, imports)?;
        Ok(Instantiated { module, instance })
    }

    async fn instantiate_streaming(
        &self,
        source: &mut dyn ModuleSource,
        imports: &ImportMap,
    ) -> Result<Instantiated, RuntimeError> {
        match source.content_type() {
            Some(ct) if is_wasm_content_type(ct) => {}
            other => return Err(RuntimeError::MimeType(other.map(str::to_string))),
        }

        let mut bytes = Vec::new();
        let mut header_checked = false;
        while let Some(chunk) = source.next_chunk().await? {
            bytes.extend_from_slice(&chunk);
            // ヘッダーが揃った時点で不正なバイナリを打ち切る
            if !header_checked && bytes.len() >= WASM_HEADER.len() {
                if bytes[..WASM_HEADER.len()] != WASM_HEADER {
                    return Err(RuntimeError::Compile(
                        "WASMヘッダー（マジックナンバー/バージョン）が不正です".to_string(),
                    ));
                }
                header_checked = true;
            }
        }
        tracing::debug!(bytes = bytes.len(), "ストリーミング受信が完了しました");

        self.instantiate(&bytes, imports)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::imports::{build_imports, EnvFactory, HostBindings};
    use crate::value::ValueType;

    const ADD_WAT: &str = r#"
        (module
          (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))
    "#;

    const IMPORTS_WAT: &str = r#"
        (module
          (import "js" "mem" (memory 1))
          (import "env" "double" (func $double (param i32) (result i32)))
          (import "env" "base" (global $base i32))
          (func (export "store_doubled") (param i32)
            i32.const 0
            local.get 0
            call $double
            global.get $base
            i32.add
            i32.store))
    "#;

    struct ChunkSource {
        content_type: Option<String>,
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkSource {
        fn new(content_type: Option<&str>, bytes: &[u8], chunk: usize) -> Self {
            Self {
                content_type: content_type.map(str::to_string),
                chunks: bytes.chunks(chunk).map(<[u8]>::to_vec).collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModuleSource for ChunkSource {
        fn content_type(&self) -> Option<&str> {
            self.content_type.as_deref()
        }

        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RuntimeError> {
            Ok(self.chunks.pop_front())
        }
    }

    fn runtime() -> WasmtimeRuntime {
        WasmtimeRuntime::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_content_type_essence() {
        assert!(is_wasm_content_type("application/wasm"));
        assert!(is_wasm_content_type("Application/WASM; charset=binary"));
        assert!(!is_wasm_content_type("application/octet-stream"));
        assert!(!is_wasm_content_type(""));
    }

    #[test]
    fn test_buffered_instantiate_without_imports() {
        let bytes = wat::parse_str(ADD_WAT).unwrap();
        let done = runtime().instantiate(&bytes, &ImportMap::empty()).unwrap();
        let out = done.instance.call("add", &[Value::I32(2), Value::I32(40)]).unwrap();
        assert_eq!(out, vec![Value::I32(42)]);
    }

    #[test]
    fn test_malformed_binary_is_compile_error() {
        let err = runtime()
            .instantiate(b"definitely not wasm", &ImportMap::empty())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Compile(_)));
    }

    #[test]
    fn test_unresolved_import_is_instantiate_error() {
        let bytes = wat::parse_str(IMPORTS_WAT).unwrap();
        let err = runtime().instantiate(&bytes, &ImportMap::empty()).unwrap_err();
        assert!(matches!(err, RuntimeError::Instantiate(_)), "{err:?}");
    }

    #[test]
    fn test_host_function_and_global_are_linked() {
        let rt = runtime();
        let memory = rt.create_memory(MemoryLimits::new(1, 2)).unwrap();
        let factory: EnvFactory = Arc::new(|_| {
            let mut env = HostBindings::new();
            env.insert(
                "double".to_string(),
                HostBinding::Func(HostFunc::new(
                    [ValueType::I32],
                    [ValueType::I32],
                    |_, args| Ok(vec![Value::I32(args[0].as_i32().unwrap_or(0) * 2)]),
                )),
            );
            env.insert(
                "base".to_string(),
                HostBinding::Global {
                    value: Value::I32(100),
                    mutable: false,
                },
            );
            env
        });
        let imports = build_imports(&memory, Some(&factory));
        let bytes = wat::parse_str(IMPORTS_WAT).unwrap();
        let done = rt.instantiate(&bytes, &imports).unwrap();

        done.instance.call("store_doubled", &[Value::I32(21)]).unwrap();
        let stored = memory.read(0, 4).unwrap();
        assert_eq!(i32::from_le_bytes(stored.try_into().unwrap()), 142);
    }

    #[test]
    fn test_host_caller_writes_linked_memory() {
        let wat_src = r#"
            (module
              (import "js" "mem" (memory 1))
              (import "env" "fill" (func $fill (param i32)))
              (func (export "run") (param i32) local.get 0 call $fill))
        "#;
        let rt = runtime();
        let memory = rt.create_memory(MemoryLimits::new(1, 1)).unwrap();
        let factory: EnvFactory = Arc::new(|_| {
            let mut env = HostBindings::new();
            env.insert(
                "fill".to_string(),
                HostBinding::Func(HostFunc::new([ValueType::I32], Vec::new(), |caller, args| {
                    let offset = args[0].as_i32().unwrap_or(0) as usize;
                    caller.write_memory(offset, b"wasm")?;
                    Ok(Vec::new())
                })),
            );
            env
        });
        let imports = build_imports(&memory, Some(&factory));
        let done = rt.instantiate(&wat::parse_str(wat_src).unwrap(), &imports).unwrap();
        done.instance.call("run", &[Value::I32(8)]).unwrap();
        assert_eq!(memory.read(8, 4).unwrap(), b"wasm");
    }

    #[test]
    fn test_host_function_uses_memory_captured_by_factory() {
        let wat_src = r#"
            (module
              (import "js" "mem" (memory 1 3))
              (import "env" "pages" (func $pages (result i32)))
              (func (export "run") (result i32) call $pages))
        "#;
        let rt = runtime();
        let memory = rt.create_memory(MemoryLimits::new(1, 3)).unwrap();
        let factory: EnvFactory = Arc::new(|mem: &Memory| {
            let mem = mem.clone();
            let mut env = HostBindings::new();
            env.insert(
                "pages".to_string(),
                HostBinding::Func(HostFunc::new(Vec::new(), [ValueType::I32], move |_, _| {
                    mem.grow(1)?;
                    mem.write(0, b"grown")?;
                    Ok(vec![Value::I32(mem.size_pages() as i32)])
                })),
            );
            env
        });
        let imports = build_imports(&memory, Some(&factory));
        let done = rt.instantiate(&wat::parse_str(wat_src).unwrap(), &imports).unwrap();

        // 呼び出しが戻らない場合に備えて別スレッドで実行する
        let (tx, rx) = std::sync::mpsc::channel();
        let instance = done.instance.clone();
        std::thread::spawn(move || {
            let _ = tx.send(instance.call("run", &[]));
        });
        let out = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("host function did not return")
            .unwrap();
        assert_eq!(out, vec![Value::I32(2)]);

        // 呼び出し終了後は通常どおりロック経由で使える
        assert_eq!(memory.size_pages(), 2);
        assert_eq!(memory.read(0, 5).unwrap(), b"grown");
    }

    #[test]
    fn test_host_function_wrong_result_type_traps() {
        let wat_src = r#"
            (module
              (import "env" "bad" (func $bad (result i32)))
              (func (export "run") (result i32) call $bad))
        "#;
        let rt = runtime();
        let memory = rt.create_memory(MemoryLimits::new(1, 1)).unwrap();
        let factory: EnvFactory = Arc::new(|_| {
            let mut env = HostBindings::new();
            env.insert(
                "bad".to_string(),
                HostBinding::Func(HostFunc::new(Vec::new(), [ValueType::I32], |_, _| {
                    Ok(vec![Value::I64(1)])
                })),
            );
            env
        });
        let imports = build_imports(&memory, Some(&factory));
        let done = rt.instantiate(&wat::parse_str(wat_src).unwrap(), &imports).unwrap();
        let err = done.instance.call("run", &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Execution(_)));
    }

    #[test]
    fn test_memory_from_other_engine_is_rejected() {
        let memory = runtime().create_memory(MemoryLimits::new(1, 1)).unwrap();
        let imports = build_imports(&memory, None);
        let bytes = wat::parse_str(ADD_WAT).unwrap();
        let err = runtime().instantiate(&bytes, &imports).unwrap_err();
        assert!(matches!(err, RuntimeError::Instantiate(_)));
    }

    #[tokio::test]
    async fn test_streaming_rejects_wrong_mime_type() {
        let bytes = wat::parse_str(ADD_WAT).unwrap();
        let mut source = ChunkSource::new(Some("text/plain"), &bytes, 16);
        let err = runtime()
            .instantiate_streaming(&mut source, &ImportMap::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MimeType(Some(ref ct)) if ct == "text/plain"));
        // ボディは読まれていない
        assert!(!source.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_rejects_missing_mime_type() {
        let bytes = wat::parse_str(ADD_WAT).unwrap();
        let mut source = ChunkSource::new(None, &bytes, 16);
        let err = runtime()
            .instantiate_streaming(&mut source, &ImportMap::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MimeType(None)));
    }

    #[tokio::test]
    async fn test_streaming_stops_at_bad_header() {
        let mut garbage = b"NOTWASM!".to_vec();
        garbage.extend(std::iter::repeat(0u8).take(64));
        let mut source = ChunkSource::new(Some(WASM_MIME_TYPE), &garbage, 8);
        let err = runtime()
            .instantiate_streaming(&mut source, &ImportMap::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Compile(_)));
        assert_eq!(source.chunks.len(), 8);
    }

    #[tokio::test]
    async fn test_streaming_matches_buffered() {
        let rt = runtime();
        let bytes = wat::parse_str(ADD_WAT).unwrap();
        let buffered = rt.instantiate(&bytes, &ImportMap::empty()).unwrap();
        let mut source = ChunkSource::new(Some(WASM_MIME_TYPE), &bytes, 3);
        let streamed = rt
            .instantiate_streaming(&mut source, &ImportMap::empty())
            .await
            .unwrap();

        let a = buffered.instance.exports().unwrap();
        let b = streamed.instance.exports().unwrap();
        assert_eq!(a.names(), b.names());
        assert_eq!(
            a.call("add", &[Value::I32(5), Value::I32(6)]).unwrap(),
            b.call("add", &[Value::I32(5), Value::I32(6)]).unwrap()
        );
    }

    #[test]
    fn test_fuel_limit_stops_infinite_loop() {
        let wat_src = r#"(module (func (export "spin") (loop $l br $l)))"#;
        let rt = WasmtimeRuntime::new(RuntimeConfig {
            fuel_limit: Some(10_000),
        })
        .unwrap();
        let done = rt
            .instantiate(&wat::parse_str(wat_src).unwrap(), &ImportMap::empty())
            .unwrap();
        let err = done.instance.call("spin", &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Execution(_)));
    }
}
