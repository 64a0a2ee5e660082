//! 把 [KernelIr] 渲染为 CUDA C 源码，交给 nvrtc 编译。

use super::{Access, BinOp, Builtin, Expr, KernelIr, Stmt};
use digit_layout::{types as ty, DigitLayout};

pub(crate) fn dt_name(dt: DigitLayout) -> Option<&'static str> {
    Some(match dt {
        ty::U32 => "unsigned int",
        ty::U64 => "unsigned long long",
        ty::I32 => "int",
        ty::I64 => "long long",
        ty::F16 => "half",
        ty::F32 => "float",
        ty::F64 => "double",
        _ => return None,
    })
}

/// 渲染前应先通过 [KernelIr::validate]。
pub(crate) fn render(ir: &KernelIr) -> String {
    let mut code = String::new();
    if ir.params.iter().any(|p| p.ty == ty::F16) {
        code.push_str("#include <cuda_fp16.h>\n\n");
    }

    let params = ir
        .params
        .iter()
        .map(|p| {
            let ty = dt_name(p.ty).unwrap_or("void");
            let name = &p.name;
            match p.access {
                Access::ReadOnly => format!("    {ty} const *__restrict__ {name}"),
                Access::ReadWrite => format!("    {ty} *__restrict__ {name}"),
            }
        })
        .collect::<Vec<_>>()
        .join(",\n");
    code.push_str(&format!(
        "extern \"C\" __global__ void {}(\n{params}\n){{\n",
        ir.name
    ));
    for stmt in &ir.body {
        render_stmt(ir, stmt, 1, &mut code);
    }
    code.push_str("}\n");
    code
}

fn render_stmt(ir: &KernelIr, stmt: &Stmt, depth: usize, code: &mut String) {
    let indent = "    ".repeat(depth);
    match stmt {
        Stmt::Store {
            param,
            index,
            value,
        } => {
            let p = &ir.params[*param];
            let ty = dt_name(p.ty).unwrap_or("void");
            code.push_str(&format!(
                "{indent}{}[{}] = ({ty})({});\n",
                p.name,
                render_expr(ir, index),
                render_expr(ir, value),
            ));
        }
        Stmt::If { cond, then } => {
            code.push_str(&format!("{indent}if ({}) {{\n", render_expr(ir, cond)));
            for stmt in then {
                render_stmt(ir, stmt, depth + 1, code);
            }
            code.push_str(&format!("{indent}}}\n"));
        }
    }
}

fn render_expr(ir: &KernelIr, expr: &Expr) -> String {
    match expr {
        Expr::Int(v) => format!("({v}ll)"),
        Expr::Float(v) => format!("({v:?})"),
        &Expr::Builtin { op, dim } => {
            let d = ["x", "y", "z"][dim as usize];
            match op {
                Builtin::GlobalId => {
                    format!("((long long)blockIdx.{d} * blockDim.{d} + threadIdx.{d})")
                }
                Builtin::LocalId => format!("((long long)threadIdx.{d})"),
                Builtin::GroupId => format!("((long long)blockIdx.{d})"),
                Builtin::LocalSize => format!("((long long)blockDim.{d})"),
                Builtin::NumGroups => format!("((long long)gridDim.{d})"),
                Builtin::GlobalSize => format!("((long long)gridDim.{d} * blockDim.{d})"),
            }
        }
        Expr::Load { param, index } => {
            format!("{}[{}]", ir.params[*param].name, render_expr(ir, index))
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = render_expr(ir, lhs);
            let r = render_expr(ir, rhs);
            let op = match op {
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
                BinOp::Rem => "%",
                BinOp::Lt => "<",
                BinOp::Le => "<=",
                BinOp::Gt => ">",
                BinOp::Ge => ">=",
                BinOp::Eq => "==",
                BinOp::Ne => "!=",
                BinOp::Min => return format!("({l} < {r} ? {l} : {r})"),
                BinOp::Max => return format!("({l} > {r} ? {l} : {r})"),
            };
            format!("({l} {op} {r})")
        }
    }
}

#[cfg(test)]
mod test {
    use super::render;
    use crate::ir::samples;
    use digit_layout::types as ty;

    #[test]
    fn test_render_add() {
        let code = render(&samples::add_scalar());
        assert_eq!(
            code,
            r#"extern "C" __global__ void add(
    int const *__restrict__ a,
    int const *__restrict__ b,
    int *__restrict__ c
){
    c[(0ll)] = (int)((a[(0ll)] + b[(0ll)]));
}
"#
        );
    }

    #[test]
    fn test_render_builtins() {
        let code = render(&samples::group_index());
        assert!(code.contains("unsigned int *__restrict__ out"));
        assert!(code.contains("((long long)blockIdx.y)"));
        assert!(code.contains("((long long)gridDim.x)"));
        assert!(code.contains("((long long)blockIdx.x * blockDim.x + threadIdx.x)"));
        assert!(!code.contains("cuda_fp16"));

        let code = render(&samples::vec_add(ty::F16));
        assert!(code.starts_with("#include <cuda_fp16.h>"));
        assert!(code.contains("half const *__restrict__ a"));
    }
}
