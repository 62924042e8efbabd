//! Structural module checks.

use crate::{FunctionData, InstKind, Module, Value};
use fvmc_backend::{
    eyre::{bail, ensure},
    Result,
};

pub(crate) fn verify(module: &Module) -> Result<()> {
    for func in &module.functions {
        if func.is_import() {
            ensure!(func.blocks.is_empty(), "import `{}` has a body", func.name);
            continue;
        }
        verify_function(module, func)?;
    }
    Ok(())
}

fn verify_function(module: &Module, func: &FunctionData) -> Result<()> {
    let name = &func.name;
    ensure!(!func.blocks.is_empty(), "function `{name}` has no blocks");
    ensure!(
        func.block_order.len() == func.blocks.len(),
        "function `{name}` has an inconsistent block layout"
    );

    let check_value = |v: Value| -> Result<()> {
        match v {
            Value::Param(i) => ensure!((i as usize) < func.params.len(), "bad param in `{name}`"),
            Value::Inst(id) => {
                ensure!(id.index() < func.insts.len(), "bad value in `{name}`");
                ensure!(func.inst(id).ty.is_some(), "use of void instruction in `{name}`");
            }
            Value::Const(id) => ensure!(id.index() < func.consts.len(), "bad const in `{name}`"),
            Value::Global(i) => {
                ensure!((i as usize) < module.globals.len(), "bad global in `{name}`")
            }
        }
        Ok(())
    };
    let check_block = |b: crate::BlockId| -> Result<()> {
        ensure!(b.index() < func.blocks.len(), "bad block target in `{name}`");
        Ok(())
    };

    for block in &func.blocks {
        ensure!(
            !block.insts.is_empty(),
            "function `{name}` block `{}` is empty",
            block.name
        );
        for (i, &inst_id) in block.insts.iter().enumerate() {
            ensure!(inst_id.index() < func.insts.len(), "bad instruction id in `{name}`");
            let data = func.inst(inst_id);
            let is_last = i + 1 == block.insts.len();
            if is_last {
                ensure!(
                    data.kind.is_terminator(),
                    "function `{name}` block `{}` does not end in a terminator",
                    block.name
                );
            } else {
                ensure!(
                    !data.kind.is_terminator(),
                    "terminator in the middle of `{name}` block `{}`",
                    block.name
                );
            }

            match &data.kind {
                InstKind::Nop | InstKind::Alloca { .. } | InstKind::Unreachable => {}
                InstKind::Binary { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => {
                    check_value(*lhs)?;
                    check_value(*rhs)?;
                }
                InstKind::Unary { arg, .. }
                | InstKind::Zext { arg }
                | InstKind::Trunc { arg } => check_value(*arg)?,
                InstKind::Select { cond, then_value, else_value } => {
                    check_value(*cond)?;
                    check_value(*then_value)?;
                    check_value(*else_value)?;
                }
                InstKind::Load { ptr } => check_value(*ptr)?,
                InstKind::Store { value, ptr } => {
                    check_value(*value)?;
                    check_value(*ptr)?;
                }
                InstKind::Gep { ptr, offset, .. } => {
                    check_value(*ptr)?;
                    check_value(*offset)?;
                }
                InstKind::Call { func: callee, args } => {
                    ensure!(callee.index() < module.functions.len(), "bad callee in `{name}`");
                    let callee = module.function(*callee);
                    ensure!(
                        args.len() == callee.params.len(),
                        "call to `{}` in `{name}` passes {} args, expected {}",
                        callee.name,
                        args.len(),
                        callee.params.len()
                    );
                    for &arg in args {
                        check_value(arg)?;
                    }
                }
                InstKind::Phi { incoming } => {
                    if incoming.is_empty() {
                        bail!("empty phi in `{name}` block `{}`", block.name);
                    }
                    for (v, b) in incoming {
                        check_value(*v)?;
                        check_block(*b)?;
                    }
                }
                InstKind::Br { dest } => check_block(*dest)?,
                InstKind::Brif { cond, then_block, else_block } => {
                    check_value(*cond)?;
                    check_block(*then_block)?;
                    check_block(*else_block)?;
                }
                InstKind::Switch { index, default, targets } => {
                    check_value(*index)?;
                    check_block(*default)?;
                    for (_, b) in targets {
                        check_block(*b)?;
                    }
                }
                InstKind::Ret { value } => {
                    ensure!(
                        value.is_some() == func.ret.is_some(),
                        "return arity mismatch in `{name}`"
                    );
                    if let Some(v) = value {
                        check_value(*v)?;
                    }
                }
            }
        }
    }
    Ok(())
}
