//! A small self-contained SSA IR.
//!
//! This is the reference backend for the FastVM compiler: an in-memory
//! module format, a builder implementing the `fvmc-backend` traits, a
//! verifier, and a tree-walking executor so compiled modules can actually be
//! run in tests without a native code generator.

#![cfg_attr(not(test), warn(unused_extern_crates))]

use fvmc_backend::{Attribute, FunctionAttributeLocation, IntCC, Linkage, U256};
use rustc_hash::FxHashMap;
use std::fmt;

mod builder;
pub use builder::{IrBackend, IrBuilder};

mod exec;
pub use exec::{Executor, Imports, Mem, ARENA_BASE};

mod verify;

/// An IR type: an integer of a fixed bit width, or an opaque pointer.
///
/// Pointers are 64-bit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Type {
    Int(u16),
    Ptr,
}

impl Type {
    /// The width of a value of this type, in bits.
    pub fn bits(self) -> u32 {
        match self {
            Self::Int(bits) => bits as u32,
            Self::Ptr => 64,
        }
    }

    /// The size of a value of this type in memory, in bytes.
    pub fn size(self) -> u64 {
        (self.bits() as u64).div_ceil(8)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(bits) => write!(f, "i{bits}"),
            Self::Ptr => f.write_str("ptr"),
        }
    }
}

macro_rules! id_type {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {$(
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    )*};
}

id_type! {
    /// A function in a [`Module`].
    FuncId,
    /// A basic block in a function.
    BlockId,
    /// An instruction in a function.
    InstId,
    /// An entry in a function's constant pool.
    ConstId,
}

/// An SSA value.
///
/// Constants are pooled rather than emitted as instructions so that values
/// patched into already-emitted calls (`set_call_arg`) never depend on their
/// definition point.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Value {
    /// The n-th function parameter.
    Param(u32),
    /// The result of an instruction.
    Inst(InstId),
    /// A pooled constant.
    Const(ConstId),
    /// The address of a module global.
    Global(u32),
}

#[derive(Clone, Debug)]
pub struct ConstData {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(Clone, Copy, Debug)]
pub enum ConstKind {
    Int(U256),
    /// A placeholder; evaluating one is an execution error.
    Undef,
}

#[derive(Clone, Debug)]
pub struct GlobalData {
    pub name: String,
    pub ty: Type,
    pub init: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
}

impl BinOp {
    fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::UDiv => "udiv",
            Self::SDiv => "sdiv",
            Self::URem => "urem",
            Self::SRem => "srem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::LShr => "lshr",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnOp {
    Not,
    Bswap,
    Ctlz,
}

impl UnOp {
    fn name(self) -> &'static str {
        match self {
            Self::Not => "not",
            Self::Bswap => "bswap",
            Self::Ctlz => "ctlz",
        }
    }
}

#[derive(Clone, Debug)]
pub enum InstKind {
    /// An erased instruction.
    Nop,
    Binary { op: BinOp, lhs: Value, rhs: Value },
    Unary { op: UnOp, arg: Value },
    Icmp { cc: IntCC, lhs: Value, rhs: Value },
    Select { cond: Value, then_value: Value, else_value: Value },
    /// Zero-extend to the instruction type.
    Zext { arg: Value },
    /// Truncate to the instruction type.
    Trunc { arg: Value },
    Load { ptr: Value },
    Store { value: Value, ptr: Value },
    Alloca { elem: Type, len: u64 },
    /// `&ptr[offset]` with `offset` in units of `elem`, sign-extended.
    Gep { elem: Type, ptr: Value, offset: Value },
    Call { func: FuncId, args: Vec<Value> },
    Phi { incoming: Vec<(Value, BlockId)> },
    Br { dest: BlockId },
    Brif { cond: Value, then_block: BlockId, else_block: BlockId },
    Switch { index: Value, default: BlockId, targets: Vec<(u64, BlockId)> },
    Ret { value: Option<Value> },
    Unreachable,
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Br { .. }
                | Self::Brif { .. }
                | Self::Switch { .. }
                | Self::Ret { .. }
                | Self::Unreachable
        )
    }
}

#[derive(Clone, Debug)]
pub struct InstData {
    pub kind: InstKind,
    /// The type of the produced value, if the instruction produces one.
    pub ty: Option<Type>,
    /// An optional name carried for dumps.
    pub name: String,
}

#[derive(Clone, Debug, Default)]
pub struct BlockData {
    pub name: String,
    pub insts: Vec<InstId>,
    pub cold: bool,
}

#[derive(Clone, Debug)]
pub struct FunctionData {
    pub name: String,
    pub params: Vec<Type>,
    pub param_names: Vec<String>,
    pub ret: Option<Type>,
    pub linkage: Linkage,
    /// Empty for imported functions.
    pub blocks: Vec<BlockData>,
    /// Block display/layout order; ids into `blocks` stay stable.
    pub block_order: Vec<BlockId>,
    pub insts: Vec<InstData>,
    pub consts: Vec<ConstData>,
    pub attrs: Vec<(Attribute, FunctionAttributeLocation)>,
}

impl FunctionData {
    pub fn is_import(&self) -> bool {
        matches!(self.linkage, Linkage::Import)
    }

    pub fn inst(&self, id: InstId) -> &InstData {
        &self.insts[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    /// The terminator of `block`, if it has one.
    pub fn terminator(&self, block: BlockId) -> Option<&InstData> {
        let last = *self.block(block).insts.last()?;
        let data = self.inst(last);
        data.kind.is_terminator().then_some(data)
    }
}

/// A compiled IR module.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<FunctionData>,
    pub globals: Vec<GlobalData>,
    func_names: FxHashMap<String, FuncId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn function(&self, id: FuncId) -> &FunctionData {
        &self.functions[id.index()]
    }

    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    pub fn get_global(&self, name: &str) -> Option<&GlobalData> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub(crate) fn add_function(
        &mut self,
        name: &str,
        params: &[Type],
        param_names: &[&str],
        ret: Option<Type>,
        linkage: Linkage,
    ) -> FuncId {
        debug_assert!(!self.func_names.contains_key(name), "duplicate function `{name}`");
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(FunctionData {
            name: name.to_string(),
            params: params.to_vec(),
            param_names: param_names.iter().map(|s| s.to_string()).collect(),
            ret,
            linkage,
            blocks: Vec::new(),
            block_order: Vec::new(),
            insts: Vec::new(),
            consts: Vec::new(),
            attrs: Vec::new(),
        });
        self.func_names.insert(name.to_string(), id);
        id
    }

    /// Verifies structural well-formedness of every defined function.
    pub fn verify(&self) -> fvmc_backend::Result<()> {
        verify::verify(self)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for g in &self.globals {
            writeln!(f, "global @{}: {} = {}", g.name, g.ty, g.init)?;
        }
        for func in &self.functions {
            writeln!(f)?;
            func.fmt_display(f, self)?;
        }
        Ok(())
    }
}

impl FunctionData {
    fn fmt_value(&self, f: &mut fmt::Formatter<'_>, module: &Module, v: Value) -> fmt::Result {
        match v {
            Value::Param(i) => write!(f, "%{}", self.param_names[i as usize]),
            Value::Inst(id) => write!(f, "%{}", id.0),
            Value::Const(id) => match &self.consts[id.index()].kind {
                ConstKind::Int(v) => write!(f, "{v}"),
                ConstKind::Undef => f.write_str("undef"),
            },
            Value::Global(i) => write!(f, "@{}", module.globals[i as usize].name),
        }
    }

    fn fmt_display(&self, f: &mut fmt::Formatter<'_>, module: &Module) -> fmt::Result {
        let kw = match self.linkage {
            Linkage::Import => "import",
            Linkage::Public => "fn",
            Linkage::Private => "private fn",
        };
        write!(f, "{kw} {}(", self.name)?;
        for (i, (ty, name)) in self.params.iter().zip(&self.param_names).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "%{name}: {ty}")?;
        }
        f.write_str(")")?;
        if let Some(ret) = self.ret {
            write!(f, " -> {ret}")?;
        }
        if self.is_import() {
            return writeln!(f, ";");
        }
        writeln!(f, " {{")?;
        for &block_id in &self.block_order {
            let block = self.block(block_id);
            writeln!(f, "{}:", block.name)?;
            for &inst_id in &block.insts {
                let data = self.inst(inst_id);
                if matches!(data.kind, InstKind::Nop) {
                    continue;
                }
                f.write_str("  ")?;
                if data.ty.is_some() {
                    write!(f, "%{} = ", inst_id.0)?;
                }
                self.fmt_inst(f, module, data)?;
                if !data.name.is_empty() {
                    write!(f, " ; {}", data.name)?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "}}")
    }

    fn fmt_inst(&self, f: &mut fmt::Formatter<'_>, m: &Module, data: &InstData) -> fmt::Result {
        let val = |f: &mut fmt::Formatter<'_>, v| self.fmt_value(f, m, v);
        match &data.kind {
            InstKind::Nop => f.write_str("nop"),
            InstKind::Binary { op, lhs, rhs } => {
                write!(f, "{} ", op.name())?;
                val(f, *lhs)?;
                f.write_str(", ")?;
                val(f, *rhs)
            }
            InstKind::Unary { op, arg } => {
                write!(f, "{} ", op.name())?;
                val(f, *arg)
            }
            InstKind::Icmp { cc, lhs, rhs } => {
                write!(f, "icmp {cc:?} ")?;
                val(f, *lhs)?;
                f.write_str(", ")?;
                val(f, *rhs)
            }
            InstKind::Select { cond, then_value, else_value } => {
                f.write_str("select ")?;
                val(f, *cond)?;
                f.write_str(", ")?;
                val(f, *then_value)?;
                f.write_str(", ")?;
                val(f, *else_value)
            }
            InstKind::Zext { arg } => {
                write!(f, "zext {} ", data.ty.unwrap())?;
                val(f, *arg)
            }
            InstKind::Trunc { arg } => {
                write!(f, "trunc {} ", data.ty.unwrap())?;
                val(f, *arg)
            }
            InstKind::Load { ptr } => {
                write!(f, "load {}, ", data.ty.unwrap())?;
                val(f, *ptr)
            }
            InstKind::Store { value, ptr } => {
                f.write_str("store ")?;
                val(f, *value)?;
                f.write_str(", ")?;
                val(f, *ptr)
            }
            InstKind::Alloca { elem, len } => write!(f, "alloca {elem} x {len}"),
            InstKind::Gep { elem, ptr, offset } => {
                write!(f, "gep {elem} ")?;
                val(f, *ptr)?;
                f.write_str(", ")?;
                val(f, *offset)
            }
            InstKind::Call { func, args } => {
                write!(f, "call {}(", m.function(*func).name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    val(f, *arg)?;
                }
                f.write_str(")")
            }
            InstKind::Phi { incoming } => {
                f.write_str("phi ")?;
                for (i, (v, block)) in incoming.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str("[")?;
                    val(f, *v)?;
                    write!(f, ", {}]", self.block(*block).name)?;
                }
                Ok(())
            }
            InstKind::Br { dest } => write!(f, "br {}", self.block(*dest).name),
            InstKind::Brif { cond, then_block, else_block } => {
                f.write_str("brif ")?;
                val(f, *cond)?;
                write!(f, ", {}, {}", self.block(*then_block).name, self.block(*else_block).name)
            }
            InstKind::Switch { index, default, targets } => {
                f.write_str("switch ")?;
                val(f, *index)?;
                write!(f, ", default {}", self.block(*default).name)?;
                for (case, block) in targets {
                    write!(f, ", {case} => {}", self.block(*block).name)?;
                }
                Ok(())
            }
            InstKind::Ret { value } => {
                f.write_str("ret")?;
                if let Some(v) = value {
                    f.write_str(" ")?;
                    val(f, *v)?;
                }
                Ok(())
            }
            InstKind::Unreachable => f.write_str("unreachable"),
        }
    }
}
