//! # CLIのホスト関数
//!
//! `env` 名前空間に置くログ出力・中断用の関数。
//!
//! | 名前 | シグネチャ |
//! |------|-----------|
//! | `log_i32` | `(i32) -> ()` |
//! | `log_str` | `(ptr: i32, len: i32) -> ()` ゲストメモリのUTF-8文字列 |
//! | `abort` | `(msg: i32, file: i32, line: i32, column: i32) -> ()` 実行を中断する |

use usewasm_wasm_host::{
    HostBinding, HostBindings, HostFunc, Memory, RuntimeError, Value, ValueType,
};

/// ログ出力のホスト関数群を返す。
pub fn console_env(_memory: &Memory) -> HostBindings {
    let mut bindings = HostBindings::new();

    bindings.insert(
        "log_i32".to_string(),
        HostBinding::Func(HostFunc::new(vec![ValueType::I32], Vec::new(), |_, args| {
            let value = args[0].as_i32().unwrap_or_default();
            tracing::info!(value, "[guest] log_i32");
            Ok(Vec::new())
        })),
    );

    bindings.insert(
        "log_str".to_string(),
        HostBinding::Func(HostFunc::new(
            vec![ValueType::I32, ValueType::I32],
            Vec::new(),
            |caller, args| {
                let (ptr, len) = pointer_pair(args)?;
                let bytes = caller.read_memory(ptr, len)?;
                tracing::info!(message = %String::from_utf8_lossy(&bytes), "[guest] log_str");
                Ok(Vec::new())
            },
        )),
    );

    bindings.insert(
        "abort".to_string(),
        HostBinding::Func(HostFunc::new(
            vec![ValueType::I32; 4],
            Vec::new(),
            |_, args| {
                let line = args[2].as_i32().unwrap_or_default();
                let column = args[3].as_i32().unwrap_or_default();
                tracing::warn!(line, column, "[guest] abort");
                Err(RuntimeError::HostFunction(format!(
                    "ゲストが中断しました (line={line}, column={column})"
                )))
            },
        )),
    );

    bindings
}

fn pointer_pair(args: &[Value]) -> Result<(usize, usize), RuntimeError> {
    let as_offset = |v: &Value| {
        v.as_i32()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| RuntimeError::HostFunction(format!("不正なポインタ: {v}")))
    };
    Ok((as_offset(&args[0])?, as_offset(&args[1])?))
}
