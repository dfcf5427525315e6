//! # コンパイル済みモジュールとインスタンス

use std::collections::BTreeMap;
use std::fmt;

use usewasm_types::{ExportKind, ExportSummary};
use wasmtime::Extern;

use crate::memory::{lock, Memory, SharedStore};
use crate::value::{Signature, Value};
use crate::RuntimeError;

/// コンパイル済みモジュールのハンドル。
#[derive(Clone)]
pub struct CompiledModule {
    raw: wasmtime::Module,
}

impl CompiledModule {
    pub(crate) fn new(raw: wasmtime::Module) -> Self {
        Self { raw }
    }

    pub(crate) fn raw(&self) -> &wasmtime::Module {
        &self.raw
    }

    /// nameセクションのモジュール名。
    pub fn name(&self) -> Option<&str> {
        self.raw.name()
    }

    /// モジュールが要求するインポート（名前空間, 名前）。
    pub fn imports(&self) -> Vec<(String, String)> {
        self.raw
            .imports()
            .map(|i| (i.module().to_string(), i.name().to_string()))
            .collect()
    }

    /// モジュールが宣言するエクスポート名。
    pub fn export_names(&self) -> Vec<String> {
        self.raw.exports().map(|e| e.name().to_string()).collect()
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// インスタンスのハンドル。所属ストアを共有参照で保持する。
#[derive(Clone)]
pub struct Instance {
    store: SharedStore,
    raw: wasmtime::Instance,
    module: CompiledModule,
    /// `js.mem` としてリンクしたメモリ
    linked: Option<Memory>,
}

impl Instance {
    pub(crate) fn new(
        store: SharedStore,
        raw: wasmtime::Instance,
        module: CompiledModule,
        linked: Option<Memory>,
    ) -> Self {
        Self {
            store,
            raw,
            module,
            linked,
        }
    }

    /// 生成元のモジュール。
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// エクスポート表を取得する。
    pub fn exports(&self) -> Result<Exports, RuntimeError> {
        let mut guard = lock(&self.store);
        let externs: Vec<(String, Extern)> = self
            .raw
            .exports(&mut *guard)
            .map(|e| (e.name().to_string(), e.into_extern()))
            .collect();

        let mut entries = BTreeMap::new();
        for (name, ext) in externs {
            let export = match ext {
                Extern::Func(func) => match Signature::from_func_type(&func.ty(&*guard)) {
                    Ok(signature) => Export::Function(Function {
                        name: name.clone(),
                        store: self.store.clone(),
                        raw: func,
                        signature,
                    }),
                    Err(e) => {
                        tracing::debug!("ホストから呼び出せない関数エクスポート {name}: {e}");
                        Export::Other(ExportKind::Function)
                    }
                },
                Extern::Memory(memory) => match &self.linked {
                    // インポートしたメモリの再エクスポートは同じハンドルを返す
                    Some(linked) if linked.raw().data_ptr(&*guard) == memory.data_ptr(&*guard) => {
                        Export::Memory(linked.clone())
                    }
                    _ => {
                        let maximum = memory.ty(&*guard).maximum();
                        Export::Memory(Memory::from_parts(self.store.clone(), memory, maximum))
                    }
                },
                Extern::Global(global) => Export::Global(GlobalExport {
                    store: self.store.clone(),
                    raw: global,
                }),
                Extern::Table(_) => Export::Other(ExportKind::Table),
                Extern::SharedMemory(_) => Export::Other(ExportKind::Memory),
                _ => continue,
            };
            entries.insert(name, export);
        }
        Ok(Exports { entries })
    }

    /// エクスポート関数を名前で呼び出す。
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        self.exports()?.call(name, args)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// エクスポートされた関数。
#[derive(Clone)]
pub struct Function {
    name: String,
    store: SharedStore,
    raw: wasmtime::Func,
    signature: Signature,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// 関数を呼び出す。引数はシグネチャと一致しなければならない。
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        self.signature
            .check_params(args)
            .map_err(|e| RuntimeError::TypeMismatch(format!("{}: {e}", self.name)))?;
        let params: Vec<_> = args.iter().map(|v| v.to_val()).collect();
        let mut results: Vec<_> = self.signature.results.iter().map(|t| t.zero()).collect();
        {
            let mut guard = lock(&self.store);
            self.raw
                .call(&mut *guard, &params, &mut results)
                .map_err(|e| RuntimeError::Execution(format!("{}: {e:#}", self.name)))?;
        }
        results.iter().map(Value::from_val).collect()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({}: {})", self.name, self.signature)
    }
}

/// エクスポートされたグローバル。
#[derive(Clone)]
pub struct GlobalExport {
    store: SharedStore,
    raw: wasmtime::Global,
}

impl GlobalExport {
    /// 現在の値。
    pub fn get(&self) -> Result<Value, RuntimeError> {
        let mut guard = lock(&self.store);
        Value::from_val(&self.raw.get(&mut *guard))
    }
}

impl fmt::Debug for GlobalExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GlobalExport")
    }
}

/// エクスポート1件。
#[derive(Debug, Clone)]
pub enum Export {
    Function(Function),
    Memory(Memory),
    Global(GlobalExport),
    /// ホストから直接操作しないエクスポート（テーブル等）
    Other(ExportKind),
}

impl Export {
    pub fn kind(&self) -> ExportKind {
        match self {
            Export::Function(_) => ExportKind::Function,
            Export::Memory(_) => ExportKind::Memory,
            Export::Global(_) => ExportKind::Global,
            Export::Other(kind) => *kind,
        }
    }
}

/// インスタンスのエクスポート表（名前順）。ロード完了前は空。
#[derive(Debug, Clone, Default)]
pub struct Exports {
    entries: BTreeMap<String, Export>,
}

impl Exports {
    pub fn get(&self, name: &str) -> Option<&Export> {
        self.entries.get(name)
    }

    /// 関数エクスポートを取得する。
    pub fn function(&self, name: &str) -> Option<&Function> {
        match self.entries.get(name) {
            Some(Export::Function(f)) => Some(f),
            _ => None,
        }
    }

    /// インスタンス自身の `memory` エクスポート。
    pub fn memory(&self) -> Option<&Memory> {
        match self.entries.get("memory") {
            Some(Export::Memory(m)) => Some(m),
            _ => None,
        }
    }

    /// グローバルエクスポートを取得する。
    pub fn global(&self, name: &str) -> Option<&GlobalExport> {
        match self.entries.get(name) {
            Some(Export::Global(g)) => Some(g),
            _ => None,
        }
    }

    /// 関数エクスポートを名前で呼び出す。
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        self.function(name)
            .ok_or_else(|| RuntimeError::MissingExport(name.to_string()))?
            .call(args)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Export)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// シリアライズ用の概要。
    pub fn summaries(&self) -> Vec<ExportSummary> {
        self.iter()
            .map(|(name, export)| ExportSummary {
                name: name.to_string(),
                kind: export.kind(),
                signature: match export {
                    Export::Function(f) => Some(f.signature().to_string()),
                    _ => None,
                },
            })
            .collect()
    }
}
