//! # WASM値と関数シグネチャ
//!
//! ホストAPIに露出する値型。wasmtimeの `Val` / `ValType` との変換はクレート内に閉じる。

use std::fmt;

use wasmtime::{Engine, FuncType, Val, ValType};

use crate::RuntimeError;

/// ホストとゲスト間で受け渡す数値。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

/// 数値の型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl Value {
    /// 値の型を返す。
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    /// 文字列を指定の型としてパースする。
    pub fn parse(ty: ValueType, text: &str) -> Result<Self, RuntimeError> {
        let bad = |e: &dyn fmt::Display| {
            RuntimeError::TypeMismatch(format!("{text:?} を {ty} として解釈できません: {e}"))
        };
        match ty {
            ValueType::I32 => text.parse().map(Value::I32).map_err(|e| bad(&e)),
            ValueType::I64 => text.parse().map(Value::I64).map_err(|e| bad(&e)),
            ValueType::F32 => text.parse().map(Value::F32).map_err(|e| bad(&e)),
            ValueType::F64 => text.parse().map(Value::F64).map_err(|e| bad(&e)),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn to_val(self) -> Val {
        match self {
            Value::I32(v) => Val::I32(v),
            Value::I64(v) => Val::I64(v),
            Value::F32(v) => Val::F32(v.to_bits()),
            Value::F64(v) => Val::F64(v.to_bits()),
        }
    }

    pub(crate) fn from_val(val: &Val) -> Result<Self, RuntimeError> {
        match val {
            Val::I32(v) => Ok(Value::I32(*v)),
            Val::I64(v) => Ok(Value::I64(*v)),
            Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
            other => Err(RuntimeError::TypeMismatch(format!(
                "未対応の値型です: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

impl ValueType {
    pub(crate) fn to_val_type(self) -> ValType {
        match self {
            ValueType::I32 => ValType::I32,
            ValueType::I64 => ValType::I64,
            ValueType::F32 => ValType::F32,
            ValueType::F64 => ValType::F64,
        }
    }

    pub(crate) fn from_val_type(ty: &ValType) -> Result<Self, RuntimeError> {
        match ty {
            ValType::I32 => Ok(ValueType::I32),
            ValType::I64 => Ok(ValueType::I64),
            ValType::F32 => Ok(ValueType::F32),
            ValType::F64 => Ok(ValueType::F64),
            other => Err(RuntimeError::TypeMismatch(format!(
                "未対応の値型です: {other:?}"
            ))),
        }
    }

    /// 戻り値スロットの初期値。
    pub(crate) fn zero(self) -> Val {
        match self {
            ValueType::I32 => Val::I32(0),
            ValueType::I64 => Val::I64(0),
            ValueType::F32 => Val::F32(0),
            ValueType::F64 => Val::F64(0),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// 関数シグネチャ（引数型, 戻り値型）。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl Signature {
    pub fn new(params: impl Into<Vec<ValueType>>, results: impl Into<Vec<ValueType>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// 引数列がシグネチャに一致するか検証する。
    pub fn check_params(&self, args: &[Value]) -> Result<(), RuntimeError> {
        let actual: Vec<ValueType> = args.iter().map(Value::ty).collect();
        if actual != self.params {
            return Err(RuntimeError::TypeMismatch(format!(
                "引数の型が一致しません: 期待 {self}, 実際 {}",
                TypeList(&actual)
            )));
        }
        Ok(())
    }

    pub(crate) fn from_func_type(ty: &FuncType) -> Result<Self, RuntimeError> {
        let params = ty
            .params()
            .map(|p| ValueType::from_val_type(&p))
            .collect::<Result<Vec<_>, _>>()?;
        let results = ty
            .results()
            .map(|r| ValueType::from_val_type(&r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { params, results })
    }

    pub(crate) fn to_func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(
            engine,
            self.params.iter().map(|t| t.to_val_type()),
            self.results.iter().map(|t| t.to_val_type()),
        )
    }
}

struct TypeList<'a>(&'a [ValueType]);

impl fmt::Display for TypeList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, ty) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ty}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", TypeList(&self.params), TypeList(&self.results))
    }
}
