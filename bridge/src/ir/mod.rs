//! 内核的中间表示。
//!
//! 前端编译器把内核源码降低为这里的 [KernelIr]，后端再把它降低为设备原生模块。

#[cfg(any(use_cuda, test))]
pub(crate) mod cuda_c;
mod image;

pub use image::{ModuleImage, MODULE_FILE};

use crate::{compile_failed, utils::is_identifier, BackendError};
use digit_layout::{types as ty, DigitLayout};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, ops};

/// 一个内核：名字、有序的缓冲区参数和函数体。
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct KernelIr {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(with = "elem_serde")]
    pub ty: DigitLayout,
    pub access: Access,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    GlobalId,
    LocalId,
    GroupId,
    LocalSize,
    NumGroups,
    GlobalSize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Int(i64),
    Float(f64),
    Builtin {
        op: Builtin,
        dim: u8,
    },
    Load {
        param: usize,
        index: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Store {
        param: usize,
        index: Expr,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
    },
}

impl KernelIr {
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: DigitLayout, access: Access) -> Self {
        self.params.push(Param {
            name: name.into(),
            ty,
            access,
        });
        self
    }

    pub fn stmt(mut self, stmt: Stmt) -> Self {
        self.body.push(stmt);
        self
    }

    /// 稳定的序列化形式，也是内容指纹的输入。
    pub fn encode(&self) -> Result<Vec<u8>, BackendError> {
        serde_json::to_vec(self).map_err(|e| compile_failed(format!("encode `{}`: {e}", self.name)))
    }

    /// 检查内核能否被降低。
    pub fn validate(&self) -> Result<(), BackendError> {
        if !is_identifier(&self.name) {
            return Err(compile_failed(format!(
                "`{}` is not a valid kernel name",
                self.name
            )));
        }
        let mut names = HashSet::new();
        for p in &self.params {
            if !is_identifier(&p.name) {
                return Err(compile_failed(format!(
                    "{}: `{}` is not a valid parameter name",
                    self.name, p.name
                )));
            }
            if !names.insert(&*p.name) {
                return Err(compile_failed(format!(
                    "{}: parameter `{}` declared twice",
                    self.name, p.name
                )));
            }
            if elem_size(p.ty).is_none() {
                return Err(compile_failed(format!(
                    "{}: element type {:?} of `{}` not supported",
                    self.name, p.ty, p.name
                )));
            }
        }
        self.body.iter().try_for_each(|s| self.check_stmt(s))
    }

    fn check_stmt(&self, stmt: &Stmt) -> Result<(), BackendError> {
        match stmt {
            Stmt::Store {
                param,
                index,
                value,
            } => {
                let p = self.check_param(*param)?;
                if p.access == Access::ReadOnly {
                    return Err(compile_failed(format!(
                        "{}: store into read-only parameter `{}`",
                        self.name, p.name
                    )));
                }
                self.check_expr(index)?;
                self.check_expr(value)
            }
            Stmt::If { cond, then } => {
                self.check_expr(cond)?;
                then.iter().try_for_each(|s| self.check_stmt(s))
            }
        }
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), BackendError> {
        match expr {
            Expr::Int(_) | Expr::Float(_) => Ok(()),
            &Expr::Builtin { op, dim } => {
                if dim < 3 {
                    Ok(())
                } else {
                    Err(compile_failed(format!(
                        "{}: {op:?}({dim}) out of range",
                        self.name
                    )))
                }
            }
            Expr::Load { param, index } => {
                self.check_param(*param)?;
                self.check_expr(index)
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs)?;
                self.check_expr(rhs)
            }
        }
    }

    fn check_param(&self, idx: usize) -> Result<&Param, BackendError> {
        self.params.get(idx).ok_or_else(|| {
            compile_failed(format!(
                "{}: parameter #{idx} referenced, {} declared",
                self.name,
                self.params.len()
            ))
        })
    }
}

impl Expr {
    #[inline]
    pub const fn builtin(op: Builtin, dim: u8) -> Self {
        Self::Builtin { op, dim }
    }

    #[inline]
    pub const fn global_id(dim: u8) -> Self {
        Self::builtin(Builtin::GlobalId, dim)
    }

    #[inline]
    pub const fn local_id(dim: u8) -> Self {
        Self::builtin(Builtin::LocalId, dim)
    }

    #[inline]
    pub const fn group_id(dim: u8) -> Self {
        Self::builtin(Builtin::GroupId, dim)
    }

    #[inline]
    pub const fn local_size(dim: u8) -> Self {
        Self::builtin(Builtin::LocalSize, dim)
    }

    #[inline]
    pub const fn num_groups(dim: u8) -> Self {
        Self::builtin(Builtin::NumGroups, dim)
    }

    #[inline]
    pub fn load(param: usize, index: Expr) -> Self {
        Self::Load {
            param,
            index: Box::new(index),
        }
    }

    #[inline]
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

macro_rules! impl_op {
    ($trait:ident::$fn:ident => $op:ident) => {
        impl ops::$trait for Expr {
            type Output = Expr;
            #[inline]
            fn $fn(self, rhs: Expr) -> Expr {
                Expr::binary(BinOp::$op, self, rhs)
            }
        }
    };
}

impl_op!(Add::add => Add);
impl_op!(Sub::sub => Sub);
impl_op!(Mul::mul => Mul);
impl_op!(Div::div => Div);
impl_op!(Rem::rem => Rem);

impl Stmt {
    #[inline]
    pub fn store(param: usize, index: Expr, value: Expr) -> Self {
        Self::Store {
            param,
            index,
            value,
        }
    }

    #[inline]
    pub fn if_(cond: Expr, then: impl IntoIterator<Item = Stmt>) -> Self {
        Self::If {
            cond,
            then: then.into_iter().collect(),
        }
    }
}

/// 支持的元素类型的字节数。
pub fn elem_size(dt: DigitLayout) -> Option<usize> {
    match dt {
        ty::F16 => Some(2),
        ty::I32 | ty::U32 | ty::F32 => Some(4),
        ty::I64 | ty::U64 | ty::F64 => Some(8),
        _ => None,
    }
}

/// 元素类型在序列化形式中的名字。
pub fn elem_name(dt: DigitLayout) -> Option<&'static str> {
    Some(match dt {
        ty::I32 => "i32",
        ty::U32 => "u32",
        ty::I64 => "i64",
        ty::U64 => "u64",
        ty::F16 => "f16",
        ty::F32 => "f32",
        ty::F64 => "f64",
        _ => return None,
    })
}

pub fn elem_from_name(name: &str) -> Option<DigitLayout> {
    Some(match name {
        "i32" => ty::I32,
        "u32" => ty::U32,
        "i64" => ty::I64,
        "u64" => ty::U64,
        "f16" => ty::F16,
        "f32" => ty::F32,
        "f64" => ty::F64,
        _ => return None,
    })
}

mod elem_serde {
    use super::{elem_from_name, elem_name};
    use digit_layout::DigitLayout;
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DigitLayout, s: S) -> Result<S::Ok, S::Error> {
        let name = elem_name(*dt).ok_or_else(|| S::Error::custom(format!("{dt:?}")))?;
        s.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DigitLayout, D::Error> {
        let name = String::deserialize(d)?;
        elem_from_name(&name).ok_or_else(|| D::Error::custom(format!("unknown element `{name}`")))
    }
}

#[cfg(test)]
pub(crate) mod samples {
    //! 测试共用的内核。
    use super::{Access::*, Expr, KernelIr, Stmt};
    use digit_layout::types as ty;

    /// `c[0] = a[0] + b[0]`
    pub fn add_scalar() -> KernelIr {
        KernelIr::new("add")
            .param("a", ty::I32, ReadOnly)
            .param("b", ty::I32, ReadOnly)
            .param("c", ty::I32, ReadWrite)
            .stmt(Stmt::store(
                2,
                Expr::Int(0),
                Expr::load(0, Expr::Int(0)) + Expr::load(1, Expr::Int(0)),
            ))
    }

    /// `c[i] = a[i] + b[i]`，`i` 为全局索引。
    pub fn vec_add(dt: digit_layout::DigitLayout) -> KernelIr {
        let i = || Expr::global_id(0);
        KernelIr::new("vec_add")
            .param("a", dt, ReadOnly)
            .param("b", dt, ReadOnly)
            .param("c", dt, ReadWrite)
            .stmt(Stmt::store(
                2,
                i(),
                Expr::load(0, i()) + Expr::load(1, i()),
            ))
    }

    /// 每个工作项写入所在工作组的线性编号。
    pub fn group_index() -> KernelIr {
        let width = Expr::num_groups(0) * Expr::local_size(0);
        KernelIr::new("index")
            .param("out", ty::U32, ReadWrite)
            .stmt(Stmt::store(
                0,
                Expr::global_id(0) + Expr::global_id(1) * width,
                Expr::group_id(1) * Expr::num_groups(0) + Expr::group_id(0),
            ))
    }
}

#[cfg(test)]
mod test {
    use super::{samples, Access, Expr, KernelIr, Stmt};
    use crate::ErrorKind;
    use digit_layout::types as ty;

    #[test]
    fn test_validate() {
        samples::add_scalar().validate().unwrap();
        samples::vec_add(ty::F32).validate().unwrap();
        samples::group_index().validate().unwrap();

        let bad = [
            KernelIr::new("1add"),
            KernelIr::new("k")
                .param("a", ty::I32, Access::ReadOnly)
                .param("a", ty::I32, Access::ReadOnly),
            KernelIr::new("k").param("a", ty::U8, Access::ReadWrite),
            KernelIr::new("k")
                .param("a", ty::I32, Access::ReadOnly)
                .stmt(Stmt::store(0, Expr::Int(0), Expr::Int(1))),
            KernelIr::new("k")
                .param("a", ty::I32, Access::ReadWrite)
                .stmt(Stmt::store(1, Expr::Int(0), Expr::Int(1))),
            KernelIr::new("k")
                .param("a", ty::I32, Access::ReadWrite)
                .stmt(Stmt::store(0, Expr::global_id(3), Expr::Int(1))),
        ];
        for ir in bad {
            let e = ir.validate().unwrap_err();
            assert_eq!(e.kind, ErrorKind::CompileFailed, "{ir:?}");
        }
    }

    #[test]
    fn test_serde() {
        let ir = samples::group_index();
        let json = String::from_utf8(ir.encode().unwrap()).unwrap();
        assert!(json.contains(r#""ty":"u32""#));
        assert!(json.contains("num_groups"));
        let back: KernelIr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ir);

        let err = serde_json::from_str::<KernelIr>(&json.replace("u32", "u8"));
        assert!(err.is_err());
    }
}
