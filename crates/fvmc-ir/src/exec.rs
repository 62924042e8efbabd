//! A tree-walking executor for compiled modules.
//!
//! Pointers are plain addresses into a flat byte arena, so the executed code
//! and the host imports share one memory. Integers are stored little-endian.

use crate::{builder::mask, BinOp, FuncId, FunctionData, InstKind, Module, Type, UnOp, Value};
use fvmc_backend::{
    eyre::{bail, ensure, eyre},
    IntCC, Result, U256,
};
use rustc_hash::FxHashMap;

/// The address of the first arena byte. Nonzero so null pointers stay
/// invalid.
pub const ARENA_BASE: u64 = 0x1000;

/// Flat byte memory shared by the executed module and its host imports.
#[derive(Debug, Default)]
pub struct Mem {
    bytes: Vec<u8>,
}

impl Mem {
    /// Bump-allocates `size` bytes and returns their address.
    pub fn alloc(&mut self, size: u64, align: u64) -> u64 {
        let top = ARENA_BASE + self.bytes.len() as u64;
        let addr = top.next_multiple_of(align.max(1));
        self.bytes.resize((addr - ARENA_BASE + size) as usize, 0);
        addr
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let start = addr
            .checked_sub(ARENA_BASE)
            .ok_or_else(|| eyre!("read below arena: {addr:#x}"))? as usize;
        self.bytes
            .get(start..start + len)
            .ok_or_else(|| eyre!("read out of arena: {addr:#x}+{len}"))
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let start = addr
            .checked_sub(ARENA_BASE)
            .ok_or_else(|| eyre!("write below arena: {addr:#x}"))? as usize;
        let slot = self
            .bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| eyre!("write out of arena: {addr:#x}+{}", data.len()))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    /// Reads a little-endian integer of `len` bytes.
    pub fn read_int(&self, addr: u64, len: usize) -> Result<U256> {
        let mut bytes = [0u8; 32];
        bytes[..len].copy_from_slice(self.read(addr, len)?);
        Ok(U256::from_le_bytes(bytes))
    }

    /// Writes the low `len` bytes of `value`, little-endian.
    pub fn write_int(&mut self, addr: u64, len: usize, value: U256) -> Result<()> {
        let bytes = value.to_le_bytes::<32>();
        self.write(addr, &bytes[..len])
    }
}

/// Resolver for calls to imported functions.
pub trait Imports {
    fn call(&mut self, mem: &mut Mem, name: &str, args: &[U256]) -> Result<Option<U256>>;
}

/// Executes functions of one [`Module`].
pub struct Executor<'a> {
    module: &'a Module,
    pub mem: Mem,
    globals: FxHashMap<&'a str, u64>,
    fuel: u64,
}

impl<'a> Executor<'a> {
    pub fn new(module: &'a Module) -> Self {
        let mut mem = Mem::default();
        let mut globals = FxHashMap::default();
        for global in &module.globals {
            let addr = mem.alloc(global.ty.size(), 16);
            mem.write_int(addr, global.ty.size() as usize, U256::from(global.init))
                .expect("fresh global");
            globals.insert(global.name.as_str(), addr);
        }
        Self { module, mem, globals, fuel: 50_000_000 }
    }

    pub fn set_fuel(&mut self, fuel: u64) {
        self.fuel = fuel;
    }

    pub fn global_addr(&self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }

    /// Runs `name` with `args`, returning its return value.
    pub fn run(
        &mut self,
        imports: &mut dyn Imports,
        name: &str,
        args: &[U256],
    ) -> Result<Option<U256>> {
        let id = self
            .module
            .get_function(name)
            .ok_or_else(|| eyre!("no function named `{name}`"))?;
        self.run_function(imports, id, args)
    }

    fn run_function(
        &mut self,
        imports: &mut dyn Imports,
        func: FuncId,
        args: &[U256],
    ) -> Result<Option<U256>> {
        let module = self.module;
        let f = module.function(func);
        if f.is_import() {
            return imports.call(&mut self.mem, &f.name, args);
        }
        ensure!(args.len() == f.params.len(), "bad arity calling `{}`", f.name);

        let mut regs: Vec<Option<U256>> = vec![None; f.insts.len()];
        let mut block = crate::BlockId(0);
        let mut prev: Option<crate::BlockId> = None;
        'blocks: loop {
            for &inst_id in &f.blocks[block.index()].insts {
                self.fuel = self.fuel.checked_sub(1).ok_or_else(|| eyre!("out of fuel"))?;
                let data = f.inst(inst_id);
                let result = match &data.kind {
                    InstKind::Nop => None,
                    InstKind::Binary { op, lhs, rhs } => {
                        let w = value_type(f, *lhs).bits();
                        let a = self.eval(f, &regs, args, *lhs)?;
                        let b = self.eval(f, &regs, args, *rhs)?;
                        Some(bin_op(*op, a, b, w)?)
                    }
                    InstKind::Unary { op, arg } => {
                        let w = value_type(f, *arg).bits();
                        let a = self.eval(f, &regs, args, *arg)?;
                        Some(un_op(*op, a, w))
                    }
                    InstKind::Icmp { cc, lhs, rhs } => {
                        let w = value_type(f, *lhs).bits();
                        let a = self.eval(f, &regs, args, *lhs)?;
                        let b = self.eval(f, &regs, args, *rhs)?;
                        Some(U256::from(icmp(*cc, a, b, w) as u8))
                    }
                    InstKind::Select { cond, then_value, else_value } => {
                        let c = self.eval(f, &regs, args, *cond)?;
                        let v = if !c.is_zero() { *then_value } else { *else_value };
                        Some(self.eval(f, &regs, args, v)?)
                    }
                    InstKind::Zext { arg } => Some(self.eval(f, &regs, args, *arg)?),
                    InstKind::Trunc { arg } => {
                        let v = self.eval(f, &regs, args, *arg)?;
                        Some(v & mask(data.ty.unwrap().bits()))
                    }
                    InstKind::Load { ptr } => {
                        let addr = self.eval_addr(f, &regs, args, *ptr)?;
                        let size = data.ty.unwrap().size() as usize;
                        Some(self.mem.read_int(addr, size)? & mask(data.ty.unwrap().bits()))
                    }
                    InstKind::Store { value, ptr } => {
                        let size = value_type(f, *value).size() as usize;
                        let v = self.eval(f, &regs, args, *value)?;
                        let addr = self.eval_addr(f, &regs, args, *ptr)?;
                        self.mem.write_int(addr, size, v)?;
                        None
                    }
                    InstKind::Alloca { elem, len } => {
                        let addr = self.mem.alloc(elem.size() * len, 16);
                        Some(U256::from(addr))
                    }
                    InstKind::Gep { elem, ptr, offset } => {
                        let base = self.eval_addr(f, &regs, args, *ptr)?;
                        let off = low_i64(self.eval(f, &regs, args, *offset)?);
                        let addr = base.wrapping_add(off.wrapping_mul(elem.size() as i64) as u64);
                        Some(U256::from(addr))
                    }
                    InstKind::Call { func: callee, args: call_args } => {
                        let mut vals = Vec::with_capacity(call_args.len());
                        for &arg in call_args {
                            vals.push(self.eval(f, &regs, args, arg)?);
                        }
                        let ret = self.run_function(imports, *callee, &vals)?;
                        match (ret, data.ty) {
                            (Some(v), Some(ty)) => Some(v & mask(ty.bits())),
                            (None, None) => None,
                            _ => bail!("return arity mismatch calling `{}`", module.function(*callee).name),
                        }
                    }
                    InstKind::Phi { incoming } => {
                        let from = prev.ok_or_else(|| eyre!("phi in entry block"))?;
                        let (v, _) = incoming
                            .iter()
                            .find(|(_, b)| *b == from)
                            .ok_or_else(|| eyre!("phi has no incoming for predecessor"))?;
                        Some(self.eval(f, &regs, args, *v)?)
                    }
                    InstKind::Br { dest } => {
                        prev = Some(block);
                        block = *dest;
                        continue 'blocks;
                    }
                    InstKind::Brif { cond, then_block, else_block } => {
                        let c = self.eval(f, &regs, args, *cond)?;
                        prev = Some(block);
                        block = if !c.is_zero() { *then_block } else { *else_block };
                        continue 'blocks;
                    }
                    InstKind::Switch { index, default, targets } => {
                        let v = self.eval(f, &regs, args, *index)?;
                        prev = Some(block);
                        block = targets
                            .iter()
                            .find(|(case, _)| v == U256::from(*case))
                            .map_or(*default, |(_, b)| *b);
                        continue 'blocks;
                    }
                    InstKind::Ret { value } => {
                        return match value {
                            Some(v) => Ok(Some(self.eval(f, &regs, args, *v)?)),
                            None => Ok(None),
                        };
                    }
                    InstKind::Unreachable => {
                        bail!("reached `unreachable` in `{}`", f.name)
                    }
                };
                regs[inst_id.index()] = result;
            }
            bail!("block `{}` of `{}` fell through", f.blocks[block.index()].name, f.name);
        }
    }

    fn eval(
        &self,
        f: &FunctionData,
        regs: &[Option<U256>],
        args: &[U256],
        value: Value,
    ) -> Result<U256> {
        match value {
            Value::Param(i) => Ok(args[i as usize]),
            Value::Inst(id) => {
                regs[id.index()].ok_or_else(|| eyre!("use of unevaluated value in `{}`", f.name))
            }
            Value::Const(id) => match f.consts[id.index()].kind {
                crate::ConstKind::Int(v) => Ok(v),
                crate::ConstKind::Undef => bail!("use of undef value in `{}`", f.name),
            },
            Value::Global(i) => {
                let name = &self.module.globals[i as usize].name;
                Ok(U256::from(self.globals[name.as_str()]))
            }
        }
    }

    fn eval_addr(
        &self,
        f: &FunctionData,
        regs: &[Option<U256>],
        args: &[U256],
        value: Value,
    ) -> Result<u64> {
        let v = self.eval(f, regs, args, value)?;
        v.try_into().map_err(|_| eyre!("pointer out of range: {v}"))
    }
}

fn value_type(f: &FunctionData, value: Value) -> Type {
    match value {
        Value::Param(i) => f.params[i as usize],
        Value::Inst(id) => f.inst(id).ty.expect("value of void instruction"),
        Value::Const(id) => f.consts[id.index()].ty,
        Value::Global(_) => Type::Ptr,
    }
}

fn low_i64(v: U256) -> i64 {
    v.as_limbs()[0] as i64
}

fn to_i128(v: U256, bits: u32) -> i128 {
    debug_assert!(bits <= 128);
    let lo: u128 = (v & mask(128)).to();
    if bits == 128 {
        lo as i128
    } else if v.bit(bits as usize - 1) {
        (lo | (u128::MAX << bits)) as i128
    } else {
        lo as i128
    }
}

fn from_i128(v: i128, bits: u32) -> U256 {
    U256::from(v as u128) & mask(bits)
}

fn bin_op(op: BinOp, a: U256, b: U256, bits: u32) -> Result<U256> {
    let m = mask(bits);
    Ok(match op {
        BinOp::Add => a.wrapping_add(b) & m,
        BinOp::Sub => a.wrapping_sub(b) & m,
        BinOp::Mul => a.wrapping_mul(b) & m,
        BinOp::UDiv => {
            ensure!(!b.is_zero(), "division by zero");
            a / b
        }
        BinOp::URem => {
            ensure!(!b.is_zero(), "division by zero");
            a % b
        }
        BinOp::SDiv => {
            ensure!(!b.is_zero(), "division by zero");
            ensure!(bits <= 128, "sdiv wider than 128 bits");
            let (a, b) = (to_i128(a, bits), to_i128(b, bits));
            from_i128(a.checked_div(b).unwrap_or(a), bits)
        }
        BinOp::SRem => {
            ensure!(!b.is_zero(), "division by zero");
            ensure!(bits <= 128, "srem wider than 128 bits");
            let (a, b) = (to_i128(a, bits), to_i128(b, bits));
            from_i128(a.checked_rem(b).unwrap_or(0), bits)
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => {
            let s = shift_amount(b);
            if s >= bits as usize {
                U256::ZERO
            } else {
                (a << s) & m
            }
        }
        BinOp::LShr => {
            let s = shift_amount(b);
            if s >= bits as usize {
                U256::ZERO
            } else {
                a >> s
            }
        }
    })
}

fn shift_amount(v: U256) -> usize {
    if v > U256::from(256u16) {
        256
    } else {
        v.as_limbs()[0] as usize
    }
}

fn un_op(op: UnOp, a: U256, bits: u32) -> U256 {
    match op {
        UnOp::Not => a ^ mask(bits),
        UnOp::Bswap => {
            debug_assert_eq!(bits % 8, 0);
            let mut bytes = a.to_le_bytes::<32>();
            bytes[..bits as usize / 8].reverse();
            U256::from_le_bytes(bytes)
        }
        UnOp::Ctlz => U256::from(a.leading_zeros() as u64 - (256 - bits) as u64),
    }
}

fn icmp(cc: IntCC, a: U256, b: U256, bits: u32) -> bool {
    let flip = |v: U256| v ^ (U256::from(1u8) << (bits as usize - 1));
    match cc {
        IntCC::Equal => a == b,
        IntCC::NotEqual => a != b,
        IntCC::UnsignedLessThan => a < b,
        IntCC::UnsignedGreaterThanOrEqual => a >= b,
        IntCC::UnsignedGreaterThan => a > b,
        IntCC::UnsignedLessThanOrEqual => a <= b,
        IntCC::SignedLessThan => flip(a) < flip(b),
        IntCC::SignedGreaterThanOrEqual => flip(a) >= flip(b),
        IntCC::SignedGreaterThan => flip(a) > flip(b),
        IntCC::SignedLessThanOrEqual => flip(a) <= flip(b),
    }
}
