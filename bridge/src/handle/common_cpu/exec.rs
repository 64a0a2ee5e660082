//! 内核中间表示的解释器。

use crate::{
    execution_failed,
    ir::{elem_size, BinOp, Builtin, Expr, KernelIr, Stmt},
    BackendError, Dims3, LaunchGeometry,
};
use digit_layout::{types as ty, DigitLayout};
use half::f16;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering::Relaxed};

/// 一个参数在模拟显存中的视图。
pub(super) struct Buffer {
    pub addr: usize,
    pub len: usize,
    pub ty: DigitLayout,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    #[inline]
    fn as_i64(self) -> i64 {
        match self {
            Self::Int(v) => v,
            Self::Float(v) => v as _,
        }
    }

    #[inline]
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as _,
            Self::Float(v) => v,
        }
    }

    #[inline]
    fn is_true(self) -> bool {
        match self {
            Self::Int(v) => v != 0,
            Self::Float(v) => v != 0.,
        }
    }
}

/// 一个工作项看到的内建变量。
struct Item {
    group: [usize; 3],
    local: [usize; 3],
    block: Dims3,
    grid: Dims3,
}

fn split(i: usize, dims: Dims3) -> [usize; 3] {
    [i % dims.x, i / dims.x % dims.y, i / (dims.x * dims.y)]
}

pub(super) fn run(
    ir: &KernelIr,
    geometry: &LaunchGeometry,
    buffers: &[Buffer],
) -> Result<(), BackendError> {
    let &LaunchGeometry { block, grid } = geometry;
    (0..grid.product()).into_par_iter().try_for_each(|g| {
        let group = split(g, grid);
        for l in 0..block.product() {
            let item = Item {
                group,
                local: split(l, block),
                block,
                grid,
            };
            let exec = Exec {
                ir,
                item: &item,
                buffers,
            };
            for stmt in &ir.body {
                exec.stmt(stmt)?
            }
        }
        Ok(())
    })
}

struct Exec<'a> {
    ir: &'a KernelIr,
    item: &'a Item,
    buffers: &'a [Buffer],
}

impl Exec<'_> {
    fn stmt(&self, stmt: &Stmt) -> Result<(), BackendError> {
        match stmt {
            Stmt::Store {
                param,
                index,
                value,
            } => {
                let index = self.index(*param, index)?;
                let value = self.expr(value)?;
                self.store(*param, index, value)
            }
            Stmt::If { cond, then } => {
                if self.expr(cond)?.is_true() {
                    for stmt in then {
                        self.stmt(stmt)?
                    }
                }
                Ok(())
            }
        }
    }

    fn expr(&self, expr: &Expr) -> Result<Value, BackendError> {
        Ok(match expr {
            &Expr::Int(v) => Value::Int(v),
            &Expr::Float(v) => Value::Float(v),
            &Expr::Builtin { op, dim } => {
                let Item {
                    group,
                    local,
                    block,
                    grid,
                } = self.item;
                let d = dim as usize;
                let v = match op {
                    Builtin::GlobalId => group[d] * block.get(d) + local[d],
                    Builtin::LocalId => local[d],
                    Builtin::GroupId => group[d],
                    Builtin::LocalSize => block.get(d),
                    Builtin::NumGroups => grid.get(d),
                    Builtin::GlobalSize => block.get(d) * grid.get(d),
                };
                Value::Int(v as _)
            }
            Expr::Load { param, index } => {
                let index = self.index(*param, index)?;
                self.load(*param, index)?
            }
            Expr::Binary { op, lhs, rhs } => binary(*op, self.expr(lhs)?, self.expr(rhs)?)?,
        })
    }

    /// 求出 `param` 中元素的字节偏移，越界时执行失败。
    fn index(&self, param: usize, index: &Expr) -> Result<usize, BackendError> {
        let buf = &self.buffers[param];
        let name = &self.ir.params[param].name;
        let size = elem_size(buf.ty)
            .ok_or_else(|| execution_failed(format!("`{name}` has unsupported element")))?;
        if buf.addr % size != 0 {
            return Err(execution_failed(format!(
                "`{name}` at {:#x} not aligned to {size} bytes",
                buf.addr
            )));
        }
        let i = match self.expr(index)? {
            Value::Int(i) => i,
            Value::Float(f) => {
                return Err(execution_failed(format!("`{name}` indexed by float {f}")));
            }
        };
        usize::try_from(i)
            .ok()
            .and_then(|i| i.checked_mul(size))
            .filter(|off| off.checked_add(size).is_some_and(|end| end <= buf.len))
            .ok_or_else(|| {
                execution_failed(format!(
                    "`{name}[{i}]` out of {} element(s) in `{}` at group {:?} local {:?}",
                    buf.len / size,
                    self.ir.name,
                    self.item.group,
                    self.item.local,
                ))
            })
    }

    fn load(&self, param: usize, offset: usize) -> Result<Value, BackendError> {
        let buf = &self.buffers[param];
        let bits = unsafe { atomic_load(buf.addr + offset, buf.ty) }?;
        Ok(match buf.ty {
            ty::I32 => Value::Int(bits as u32 as i32 as _),
            ty::U32 => Value::Int(bits as u32 as _),
            ty::I64 | ty::U64 => Value::Int(bits as _),
            ty::F16 => Value::Float(f16::from_bits(bits as _).to_f64()),
            ty::F32 => Value::Float(f32::from_bits(bits as _) as _),
            ty::F64 => Value::Float(f64::from_bits(bits)),
            dt => return Err(execution_failed(format!("load {dt:?}"))),
        })
    }

    fn store(&self, param: usize, offset: usize, value: Value) -> Result<(), BackendError> {
        let buf = &self.buffers[param];
        let bits: u64 = match buf.ty {
            ty::I32 => value.as_i64() as i32 as u32 as _,
            ty::U32 => value.as_i64() as u32 as _,
            ty::I64 | ty::U64 => value.as_i64() as _,
            ty::F16 => f16::from_f64(value.as_f64()).to_bits() as _,
            ty::F32 => (value.as_f64() as f32).to_bits() as _,
            ty::F64 => value.as_f64().to_bits(),
            dt => return Err(execution_failed(format!("store {dt:?}"))),
        };
        unsafe { atomic_store(buf.addr + offset, buf.ty, bits) }
    }
}

// 不同工作组可能同时读写同一元素，按元素宽度做 relaxed 原子访问。
// `addr` 须按元素宽度对齐，由 `Exec::index` 检查。

unsafe fn atomic_load(addr: usize, dt: DigitLayout) -> Result<u64, BackendError> {
    Ok(match elem_size(dt) {
        Some(2) => AtomicU16::from_ptr(addr as _).load(Relaxed) as u64,
        Some(4) => AtomicU32::from_ptr(addr as _).load(Relaxed) as u64,
        Some(8) => AtomicU64::from_ptr(addr as _).load(Relaxed),
        _ => return Err(execution_failed(format!("load {dt:?}"))),
    })
}

unsafe fn atomic_store(addr: usize, dt: DigitLayout, bits: u64) -> Result<(), BackendError> {
    match elem_size(dt) {
        Some(2) => AtomicU16::from_ptr(addr as _).store(bits as _, Relaxed),
        Some(4) => AtomicU32::from_ptr(addr as _).store(bits as _, Relaxed),
        Some(8) => AtomicU64::from_ptr(addr as _).store(bits, Relaxed),
        _ => return Err(execution_failed(format!("store {dt:?}"))),
    }
    Ok(())
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, BackendError> {
    use {BinOp::*, Value::*};
    let flag = |b: bool| Int(b as _);
    Ok(match (lhs, rhs) {
        (Int(l), Int(r)) => match op {
            Add => Int(l.wrapping_add(r)),
            Sub => Int(l.wrapping_sub(r)),
            Mul => Int(l.wrapping_mul(r)),
            Div | Rem if r == 0 => return Err(execution_failed("integer division by zero")),
            Div => Int(l.wrapping_div(r)),
            Rem => Int(l.wrapping_rem(r)),
            Min => Int(l.min(r)),
            Max => Int(l.max(r)),
            Lt => flag(l < r),
            Le => flag(l <= r),
            Gt => flag(l > r),
            Ge => flag(l >= r),
            Eq => flag(l == r),
            Ne => flag(l != r),
        },
        (l, r) => {
            let (l, r) = (l.as_f64(), r.as_f64());
            match op {
                Add => Float(l + r),
                Sub => Float(l - r),
                Mul => Float(l * r),
                Div => Float(l / r),
                Rem => Float(l % r),
                Min => Float(l.min(r)),
                Max => Float(l.max(r)),
                Lt => flag(l < r),
                Le => flag(l <= r),
                Gt => flag(l > r),
                Ge => flag(l >= r),
                Eq => flag(l == r),
                Ne => flag(l != r),
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::{binary, run, split, Buffer, Value};
    use crate::{
        ir::{samples, Access, BinOp, Expr, KernelIr, Stmt},
        DeviceLimits, Dims3, ErrorKind, LaunchGeometry,
    };
    use digit_layout::types as ty;
    use half::f16;

    fn buffer<T>(data: &mut [T], dt: digit_layout::DigitLayout) -> Buffer {
        Buffer {
            addr: data.as_mut_ptr() as usize,
            len: std::mem::size_of_val(data),
            ty: dt,
        }
    }

    fn geometry(local: [usize; 3], groups: [usize; 3]) -> LaunchGeometry {
        LaunchGeometry::translate(local.into(), groups.into(), &DeviceLimits::default()).unwrap()
    }

    #[test]
    fn test_split() {
        let dims = Dims3::new(2, 3, 4);
        assert_eq!(split(0, dims), [0, 0, 0]);
        assert_eq!(split(1, dims), [1, 0, 0]);
        assert_eq!(split(2, dims), [0, 1, 0]);
        assert_eq!(split(23, dims), [1, 2, 3]);
    }

    #[test]
    fn test_binary() {
        use Value::*;
        assert_eq!(binary(BinOp::Add, Int(1), Int(2)).unwrap(), Int(3));
        assert_eq!(binary(BinOp::Div, Int(7), Int(2)).unwrap(), Int(3));
        assert_eq!(binary(BinOp::Div, Int(7), Float(2.)).unwrap(), Float(3.5));
        assert_eq!(binary(BinOp::Lt, Float(1.), Int(2)).unwrap(), Int(1));
        assert_eq!(binary(BinOp::Max, Int(-1), Int(2)).unwrap(), Int(2));
        let e = binary(BinOp::Rem, Int(1), Int(0)).unwrap_err();
        assert_eq!(e.kind, ErrorKind::ExecutionFailed);
    }

    #[test]
    fn test_vec_add_f16() {
        let n = 100;
        let mut a = (0..n).map(|i| f16::from_f32(i as f32)).collect::<Vec<_>>();
        let mut b = vec![f16::from_f32(0.5); n];
        let mut c = vec![f16::ZERO; n];
        let buffers = [
            buffer(&mut a, ty::F16),
            buffer(&mut b, ty::F16),
            buffer(&mut c, ty::F16),
        ];
        run(&samples::vec_add(ty::F16), &geometry([10, 1, 1], [10, 1, 1]), &buffers).unwrap();
        for (i, x) in c.iter().enumerate() {
            assert_eq!(x.to_f32(), i as f32 + 0.5);
        }
    }

    #[test]
    fn test_guarded() {
        // if (i < n) y[i] = x[i] * 2
        let i = || Expr::global_id(0);
        let ir = KernelIr::new("scale")
            .param("x", ty::F32, Access::ReadOnly)
            .param("y", ty::F64, Access::ReadWrite)
            .stmt(Stmt::if_(
                Expr::binary(BinOp::Lt, i(), Expr::Int(5)),
                [Stmt::store(1, i(), Expr::load(0, i()) * Expr::Float(2.))],
            ));
        ir.validate().unwrap();

        let mut x = [1f32, 2., 3., 4., 5.];
        let mut y = [0f64; 5];
        let buffers = [buffer(&mut x, ty::F32), buffer(&mut y, ty::F64)];
        run(&ir, &geometry([4, 1, 1], [2, 1, 1]), &buffers).unwrap();
        assert_eq!(y, [2., 4., 6., 8., 10.]);
    }

    #[test]
    fn test_huge_index() {
        let mut x = [0u64; 4];
        let buffers = [buffer(&mut x, ty::U64)];
        for i in [(1i64 << 61) - 1, i64::MAX, -1] {
            let ir = KernelIr::new("far")
                .param("x", ty::U64, Access::ReadWrite)
                .stmt(Stmt::store(0, Expr::Int(i), Expr::Int(1)));
            let e = run(&ir, &geometry([1, 1, 1], [1, 1, 1]), &buffers).unwrap_err();
            assert_eq!(e.kind, ErrorKind::ExecutionFailed, "{i}");
        }
        assert_eq!(x, [0; 4]);
    }

    #[test]
    fn test_same_element() {
        // 所有工作项都写 x[0]
        let ir = KernelIr::new("last")
            .param("x", ty::U32, Access::ReadWrite)
            .stmt(Stmt::store(0, Expr::Int(0), Expr::global_id(0)));
        let mut x = [u32::MAX; 1];
        let buffers = [buffer(&mut x, ty::U32)];
        run(&ir, &geometry([16, 1, 1], [64, 1, 1]), &buffers).unwrap();
        assert!(x[0] < 16 * 64);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut x = [0u32; 4];
        let buffers = [buffer(&mut x, ty::U32)];
        let e = run(&samples::group_index(), &geometry([2, 2, 1], [2, 2, 1]), &buffers).unwrap_err();
        assert_eq!(e.kind, ErrorKind::ExecutionFailed);
    }
}
