//! # メモリプロビジョニング
//!
//! 呼び出し元が渡したメモリはそのまま再利用し（所有権は呼び出し元に残る）、
//! 渡されなかった場合のみ新規に生成する。解放は自分で生成したメモリに限る。

use usewasm_types::MemoryLimits;

use crate::memory::Memory;
use crate::runtime::ModuleRuntime;
use crate::RuntimeError;

/// プロビジョニング結果。生成元が所有しているかどうかを伴う。
#[derive(Debug)]
pub struct ProvisionedMemory {
    memory: Memory,
    owned: bool,
}

/// メモリを取得する。
///
/// - `existing` がある場合: そのまま返す（`owned == false`）
/// - ない場合: `limits` で新規生成する（`owned == true`）
pub fn acquire_memory(
    runtime: &dyn ModuleRuntime,
    existing: Option<&Memory>,
    limits: MemoryLimits,
) -> Result<ProvisionedMemory, RuntimeError> {
    if let Some(memory) = existing {
        tracing::debug!("呼び出し元のメモリを再利用します");
        return Ok(ProvisionedMemory {
            memory: memory.clone(),
            owned: false,
        });
    }

    limits.validate().map_err(RuntimeError::Memory)?;
    let memory = runtime.create_memory(limits)?;
    tracing::debug!(
        initial = limits.initial,
        maximum = limits.maximum,
        "メモリを生成しました"
    );
    Ok(ProvisionedMemory {
        memory,
        owned: true,
    })
}

impl ProvisionedMemory {
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// 内部生成したメモリかどうか。
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// 所有しているメモリを解放する。実際に解放した場合のみtrueを返す。
    ///
    /// 呼び出し元のメモリには何もしない。何度呼んでもよい。
    pub fn release(&self) -> bool {
        if !self.owned {
            return false;
        }
        let released = self.memory.release_owned();
        if released {
            tracing::debug!("内部生成メモリを解放しました");
        }
        released
    }
}
