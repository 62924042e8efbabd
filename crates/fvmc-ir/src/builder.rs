use crate::{
    BinOp, BlockData, BlockId, ConstData, ConstId, ConstKind, FuncId, FunctionData, InstData,
    InstId, InstKind, Module, Type, UnOp, Value,
};
use fvmc_backend::{
    Attribute, Backend, BackendTypes, Builder, FunctionAttributeLocation, IntCC, Linkage, Result,
    TypeMethods, U256,
};

/// The in-memory backend: owns the [`Module`] under construction.
#[derive(Debug, Default)]
pub struct IrBackend {
    module: Module,
}

impl IrBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }
}

pub(crate) fn mask(bits: u32) -> U256 {
    if bits >= 256 {
        U256::MAX
    } else {
        (U256::from(1u8) << bits as usize) - U256::from(1u8)
    }
}

impl BackendTypes for IrBackend {
    type Type = Type;
    type Value = Value;
    type BasicBlock = BlockId;
    type Function = FuncId;
}

impl TypeMethods for IrBackend {
    fn type_ptr(&self) -> Type {
        Type::Ptr
    }

    fn type_ptr_sized_int(&self) -> Type {
        Type::Int(64)
    }

    fn type_int(&self, bits: u32) -> Type {
        Type::Int(bits as u16)
    }

    fn type_bit_width(&self, ty: Type) -> u32 {
        ty.bits()
    }
}

impl Backend for IrBackend {
    type Builder<'a> = IrBuilder<'a>;
    type FuncId = FuncId;

    fn set_module_name(&mut self, name: &str) {
        self.module.name = name.to_string();
    }

    fn function_name_is_unique(&self, name: &str) -> bool {
        self.module.get_function(name).is_none()
    }

    fn build_function(
        &mut self,
        name: &str,
        ret: Option<Type>,
        params: &[Type],
        param_names: &[&str],
        linkage: Linkage,
    ) -> Result<(IrBuilder<'_>, FuncId)> {
        let id = self.module.add_function(name, params, param_names, ret, linkage);
        let mut bcx = IrBuilder { module: &mut self.module, func: id, block: None, insert: None };
        let entry = bcx.create_block("entry");
        bcx.switch_to_block(entry);
        Ok((bcx, id))
    }

    fn verify_module(&mut self) -> Result<()> {
        self.module.verify()
    }
}

/// Builds instructions into one function of a [`Module`].
#[derive(Debug)]
pub struct IrBuilder<'a> {
    module: &'a mut Module,
    func: FuncId,
    block: Option<BlockId>,
    /// When set, new instructions are inserted at this position of the
    /// current block instead of appended.
    insert: Option<usize>,
}

impl<'a> IrBuilder<'a> {
    fn func(&self) -> &FunctionData {
        &self.module.functions[self.func.index()]
    }

    fn func_mut(&mut self) -> &mut FunctionData {
        &mut self.module.functions[self.func.index()]
    }

    fn push_inst(&mut self, kind: InstKind, ty: Option<Type>, name: &str) -> Value {
        let block = self.block.expect("no insertion block");
        let insert = self.insert;
        let func = self.func_mut();
        let id = InstId(func.insts.len() as u32);
        func.insts.push(InstData { kind, ty, name: name.to_string() });
        let insts = &mut func.blocks[block.index()].insts;
        match insert {
            Some(at) => {
                insts.insert(at, id);
                self.insert = Some(at + 1);
            }
            None => insts.push(id),
        }
        Value::Inst(id)
    }

    fn push_const(&mut self, ty: Type, kind: ConstKind) -> Value {
        let func = self.func_mut();
        let id = ConstId(func.consts.len() as u32);
        func.consts.push(ConstData { ty, kind });
        Value::Const(id)
    }

    fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.value_type(lhs);
        self.push_inst(InstKind::Binary { op, lhs, rhs }, Some(ty), "")
    }

    fn unary(&mut self, op: UnOp, arg: Value) -> Value {
        let ty = self.value_type(arg);
        self.push_inst(InstKind::Unary { op, arg }, Some(ty), "")
    }

    /// The type of an already-created value.
    pub fn value_type(&self, value: Value) -> Type {
        let func = self.func();
        match value {
            Value::Param(i) => func.params[i as usize],
            Value::Inst(id) => func.inst(id).ty.expect("value of void instruction"),
            Value::Const(id) => func.consts[id.index()].ty,
            Value::Global(_) => Type::Ptr,
        }
    }
}

impl BackendTypes for IrBuilder<'_> {
    type Type = Type;
    type Value = Value;
    type BasicBlock = BlockId;
    type Function = FuncId;
}

impl TypeMethods for IrBuilder<'_> {
    fn type_ptr(&self) -> Type {
        Type::Ptr
    }

    fn type_ptr_sized_int(&self) -> Type {
        Type::Int(64)
    }

    fn type_int(&self, bits: u32) -> Type {
        Type::Int(bits as u16)
    }

    fn type_bit_width(&self, ty: Type) -> u32 {
        ty.bits()
    }
}

impl Builder for IrBuilder<'_> {
    fn create_block(&mut self, name: &str) -> BlockId {
        let func = self.func_mut();
        let id = BlockId(func.blocks.len() as u32);
        func.blocks.push(BlockData { name: name.to_string(), ..Default::default() });
        func.block_order.push(id);
        id
    }

    fn create_block_after(&mut self, after: BlockId, name: &str) -> BlockId {
        let func = self.func_mut();
        let id = BlockId(func.blocks.len() as u32);
        func.blocks.push(BlockData { name: name.to_string(), ..Default::default() });
        let at = match func.block_order.iter().position(|&b| b == after) {
            Some(i) => i + 1,
            None => func.block_order.len(),
        };
        func.block_order.insert(at, id);
        id
    }

    fn switch_to_block(&mut self, block: BlockId) {
        self.block = Some(block);
        self.insert = None;
    }

    fn position_at_term(&mut self, block: BlockId) {
        self.block = Some(block);
        self.insert = self.func().terminator(block).is_some().then(|| {
            let insts = &self.func().blocks[block.index()].insts;
            insts.len() - 1
        });
    }

    fn set_current_block_cold(&mut self) {
        let block = self.block.expect("no insertion block");
        self.func_mut().blocks[block.index()].cold = true;
    }

    fn current_block(&mut self) -> Option<BlockId> {
        self.block
    }

    fn fn_param(&mut self, index: usize) -> Value {
        debug_assert!(index < self.func().params.len());
        Value::Param(index as u32)
    }

    fn num_fn_params(&self) -> usize {
        self.func().params.len()
    }

    fn bool_const(&mut self, value: bool) -> Value {
        self.push_const(Type::Int(1), ConstKind::Int(U256::from(value as u8)))
    }

    fn iconst(&mut self, ty: Type, value: i64) -> Value {
        let wide = if value >= 0 {
            U256::from(value as u64)
        } else {
            U256::MAX - U256::from(!(value as u64))
        };
        self.push_const(ty, ConstKind::Int(wide & mask(ty.bits())))
    }

    fn uconst(&mut self, ty: Type, value: u64) -> Value {
        self.push_const(ty, ConstKind::Int(U256::from(value) & mask(ty.bits())))
    }

    fn iconst_wide(&mut self, ty: Type, value: U256) -> Value {
        self.push_const(ty, ConstKind::Int(value & mask(ty.bits())))
    }

    fn undef(&mut self, ty: Type) -> Value {
        self.push_const(ty, ConstKind::Undef)
    }

    fn as_const_int(&mut self, value: Value) -> Option<U256> {
        match value {
            Value::Const(id) => match self.func().consts[id.index()].kind {
                ConstKind::Int(v) => Some(v),
                ConstKind::Undef => None,
            },
            _ => None,
        }
    }

    fn declare_global(&mut self, ty: Type, name: &str, init: u64) {
        debug_assert!(self.module.get_global(name).is_none(), "duplicate global `{name}`");
        self.module.globals.push(crate::GlobalData { name: name.to_string(), ty, init });
    }

    fn global_addr(&mut self, name: &str) -> Value {
        let idx = self
            .module
            .globals
            .iter()
            .position(|g| g.name == name)
            .unwrap_or_else(|| panic!("unknown global `{name}`"));
        Value::Global(idx as u32)
    }

    fn alloca(&mut self, ty: Type, len: u64, name: &str) -> Value {
        self.push_inst(InstKind::Alloca { elem: ty, len }, Some(Type::Ptr), name)
    }

    fn load(&mut self, ty: Type, ptr: Value, name: &str) -> Value {
        self.push_inst(InstKind::Load { ptr }, Some(ty), name)
    }

    fn store(&mut self, value: Value, ptr: Value) {
        self.push_inst(InstKind::Store { value, ptr }, None, "");
    }

    fn ret(&mut self, value: Option<Value>) {
        self.push_inst(InstKind::Ret { value }, None, "");
    }

    fn icmp(&mut self, cc: IntCC, lhs: Value, rhs: Value) -> Value {
        self.push_inst(InstKind::Icmp { cc, lhs, rhs }, Some(Type::Int(1)), "")
    }

    fn icmp_imm(&mut self, cc: IntCC, lhs: Value, rhs: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, rhs);
        self.icmp(cc, lhs, rhs)
    }

    fn br(&mut self, dest: BlockId) {
        self.push_inst(InstKind::Br { dest }, None, "");
    }

    fn brif(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.push_inst(InstKind::Brif { cond, then_block, else_block }, None, "");
    }

    fn switch(
        &mut self,
        index: Value,
        default: BlockId,
        targets: &[(u64, BlockId)],
        default_is_cold: bool,
    ) {
        if default_is_cold {
            self.func_mut().blocks[default.index()].cold = true;
        }
        self.push_inst(
            InstKind::Switch { index, default, targets: targets.to_vec() },
            None,
            "",
        );
    }

    fn phi(&mut self, ty: Type, incoming: &[(Value, BlockId)]) -> Value {
        self.push_inst(InstKind::Phi { incoming: incoming.to_vec() }, Some(ty), "")
    }

    fn select(&mut self, cond: Value, then_value: Value, else_value: Value) -> Value {
        let ty = self.value_type(then_value);
        self.push_inst(InstKind::Select { cond, then_value, else_value }, Some(ty), "")
    }

    fn iadd(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    fn isub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    fn imul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    fn udiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::UDiv, lhs, rhs)
    }

    fn sdiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::SDiv, lhs, rhs)
    }

    fn urem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::URem, lhs, rhs)
    }

    fn srem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::SRem, lhs, rhs)
    }

    fn iadd_imm(&mut self, lhs: Value, rhs: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, rhs);
        self.iadd(lhs, rhs)
    }

    fn imul_imm(&mut self, lhs: Value, rhs: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, rhs);
        self.imul(lhs, rhs)
    }

    fn bitor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Or, lhs, rhs)
    }

    fn bitand(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::And, lhs, rhs)
    }

    fn bitxor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Xor, lhs, rhs)
    }

    fn bitnot(&mut self, value: Value) -> Value {
        self.unary(UnOp::Not, value)
    }

    fn ishl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Shl, lhs, rhs)
    }

    fn ushr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::LShr, lhs, rhs)
    }

    fn zext(&mut self, ty: Type, value: Value) -> Value {
        self.push_inst(InstKind::Zext { arg: value }, Some(ty), "")
    }

    fn ireduce(&mut self, to: Type, value: Value) -> Value {
        self.push_inst(InstKind::Trunc { arg: value }, Some(to), "")
    }

    fn bswap(&mut self, value: Value) -> Value {
        self.unary(UnOp::Bswap, value)
    }

    fn ctlz(&mut self, value: Value) -> Value {
        self.unary(UnOp::Ctlz, value)
    }

    fn gep(&mut self, ty: Type, ptr: Value, offset: Value, name: &str) -> Value {
        self.push_inst(InstKind::Gep { elem: ty, ptr, offset }, Some(Type::Ptr), name)
    }

    fn call(&mut self, function: FuncId, args: &[Value]) -> Option<Value> {
        let ret = self.module.function(function).ret;
        let value = self.push_inst(InstKind::Call { func: function, args: args.to_vec() }, ret, "");
        ret.map(|_| value)
    }

    fn set_call_arg(&mut self, call: Value, index: usize, value: Value) {
        let Value::Inst(id) = call else { panic!("set_call_arg on non-instruction {call:?}") };
        match &mut self.func_mut().insts[id.index()].kind {
            InstKind::Call { args, .. } => args[index] = value,
            kind => panic!("set_call_arg on non-call {kind:?}"),
        }
    }

    fn erase_inst(&mut self, inst: Value) {
        let Value::Inst(id) = inst else { panic!("erase_inst on non-instruction {inst:?}") };
        let func = self.func_mut();
        func.insts[id.index()].kind = InstKind::Nop;
        func.insts[id.index()].ty = None;
        for block in &mut func.blocks {
            block.insts.retain(|&i| i != id);
        }
    }

    fn unreachable(&mut self) {
        self.push_inst(InstKind::Unreachable, None, "");
    }

    fn get_or_build_function(
        &mut self,
        name: &str,
        params: &[Type],
        ret: Option<Type>,
        linkage: Linkage,
        build: impl FnOnce(&mut Self),
    ) -> FuncId {
        if let Some(id) = self.module.get_function(name) {
            return id;
        }
        let param_names: Vec<String> = (0..params.len()).map(|i| format!("a{i}")).collect();
        let param_names: Vec<&str> = param_names.iter().map(|s| s.as_str()).collect();
        let id = self.module.add_function(name, params, &param_names, ret, linkage);

        let saved = (self.func, self.block, self.insert);
        self.func = id;
        self.block = None;
        self.insert = None;
        let entry = self.create_block("entry");
        self.switch_to_block(entry);
        build(self);
        (self.func, self.block, self.insert) = saved;
        id
    }

    fn get_function(&mut self, name: &str) -> Option<FuncId> {
        self.module.get_function(name)
    }

    fn add_function(
        &mut self,
        name: &str,
        params: &[Type],
        ret: Option<Type>,
        linkage: Linkage,
    ) -> FuncId {
        if let Some(id) = self.module.get_function(name) {
            return id;
        }
        let param_names: Vec<String> = (0..params.len()).map(|i| format!("a{i}")).collect();
        let param_names: Vec<&str> = param_names.iter().map(|s| s.as_str()).collect();
        self.module.add_function(name, params, &param_names, ret, linkage)
    }

    fn add_function_attribute(
        &mut self,
        function: Option<FuncId>,
        attribute: Attribute,
        loc: FunctionAttributeLocation,
    ) {
        let func = function.unwrap_or(self.func);
        self.module.functions[func.index()].attrs.push((attribute, loc));
    }
}
