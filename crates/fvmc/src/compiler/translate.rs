//! Bytecode to IR translation: the per-opcode emission rules.

use super::{gas::schedule, gas::GasMeter, stack::LocalStack, CompilerConfig};
use crate::{
    bytecode::{opcode as op, opcode::OpcodesIter, BasicBlock},
    evm::{CallKind, ReturnCode, Revision, EVM_CALL_FAILURE},
    ext::{Arith128, Ext, Memory},
    runtime::RuntimeManager,
};
use fvmc_backend::{Backend, Builder, IntCC, TypeMethods, U256};

/// A `JUMP`/`JUMPI` whose branch is emitted once all blocks exist.
struct PendingJump<B: Backend> {
    dest: B::Value,
    /// `Some` for `JUMPI`; the false edge goes to the next block.
    cond: Option<B::Value>,
}

/// How a compiled block ends.
enum BlockExit<B: Backend> {
    /// No terminator; flow continues into the next block.
    FallThrough,
    /// Ends in a recorded jump, resolved late.
    Jump(PendingJump<B>),
    /// Already ends in a terminator.
    Terminated,
}

pub(super) struct FunctionCx<'a, B: Backend + 'a> {
    config: CompilerConfig,
    bcx: B::Builder<'a>,

    word_type: B::Type,
    word256_type: B::Type,
    gas_type: B::Type,
    bool_type: B::Type,
    ptr_type: B::Type,
    size_type: B::Type,

    code: &'a [u8],
    blocks: &'a [BasicBlock],
    /// Entry IR block of each bytecode block.
    entries: Vec<B::BasicBlock>,
    /// Exit IR block and exit kind of each compiled block.
    exits: Vec<(B::BasicBlock, BlockExit<B>)>,

    stop_block: B::BasicBlock,
    jump_table: B::BasicBlock,
    abort_block: B::BasicBlock,
    /// One case per `JUMPDEST`, keyed by byte offset.
    jumpdest_cases: Vec<(u64, B::BasicBlock)>,
    /// Dynamic destinations feeding the jump-table phi.
    incoming_jumps: Vec<(B::Value, B::BasicBlock)>,

    rt: RuntimeManager<B::Builder<'a>>,
    gas_meter: GasMeter<B::Builder<'a>>,
    ext: Ext<B::Builder<'a>>,
    memory: Memory<B::Builder<'a>>,
    arith: Arith128<B::Builder<'a>>,
    jmp_buf: B::Value,
}

impl<'a, B: Backend + 'a> FunctionCx<'a, B> {
    /// Translates a split bytecode into the current function.
    ///
    /// Layout of the emitted function:
    ///
    /// ```text
    /// entry:     gas_out = 0; jmp_buf = alloca; br .0 (or Stop)
    /// .N:        sp = stack.prepare(...); <instructions>; <writeback>
    /// Stop:      return Stop
    /// JumpTable: switch phi(destinations), default Abort, case per JUMPDEST
    /// Abort:     return OutOfGas
    /// ```
    pub(super) fn translate(
        mut bcx: B::Builder<'a>,
        config: CompilerConfig,
        code: &'a [u8],
        blocks: &'a [BasicBlock],
    ) {
        let word_type = bcx.type_int(128);
        let word256_type = bcx.type_int(256);
        let gas_type = bcx.type_int(64);
        let bool_type = bcx.type_int(1);
        let ptr_type = bcx.type_ptr();
        let size_type = bcx.type_int(64);

        bcx.declare_global(bool_type, "gas_out", 0);

        let rt_ptr = bcx.fn_param(0);

        let entries: Vec<_> = blocks.iter().map(|block| bcx.create_block(&block.name())).collect();
        // Special "Stop" block: guarantees that a next block exists after
        // the code blocks, also when there are none.
        let stop_block = bcx.create_block("Stop");
        let jump_table = bcx.create_block("JumpTable");
        let abort_block = bcx.create_block("Abort");

        // Entry: reset the failure flag and set up the jump buffer threaded
        // to the helpers (unused with the portable flag mechanism).
        let zero = bcx.bool_const(false);
        let gas_out = bcx.global_addr("gas_out");
        bcx.store(zero, gas_out);
        let jmp_buf = bcx.alloca(ptr_type, 3, "jmpbuf");

        let rt = RuntimeManager::new(&mut bcx, rt_ptr);
        let gas_meter = GasMeter::new(&mut bcx, config.revision, rt.gas_ptr(), jmp_buf);
        let ext = Ext::new(&mut bcx, rt_ptr);
        let memory = Memory::new(&mut bcx, rt_ptr);
        let arith = Arith128::new(&mut bcx);

        let first = entries.first().copied().unwrap_or(stop_block);
        bcx.br(first);

        let mut fx: FunctionCx<'a, B> = FunctionCx {
            config,
            bcx,
            word_type,
            word256_type,
            gas_type,
            bool_type,
            ptr_type,
            size_type,
            code,
            blocks,
            entries,
            exits: Vec::with_capacity(blocks.len()),
            stop_block,
            jump_table,
            abort_block,
            jumpdest_cases: Vec::new(),
            incoming_jumps: Vec::new(),
            rt,
            gas_meter,
            ext,
            memory,
            arith,
            jmp_buf,
        };

        for idx in 0..blocks.len() {
            fx.compile_block(idx);
        }

        fx.bcx.switch_to_block(fx.stop_block);
        fx.rt.exit(&mut fx.bcx, ReturnCode::Stop);

        fx.bcx.switch_to_block(fx.abort_block);
        fx.bcx.set_current_block_cold();
        fx.rt.exit(&mut fx.bcx, ReturnCode::OutOfGas);

        fx.resolve_jumps();
    }

    fn compile_block(&mut self, idx: usize) {
        let block = &self.blocks[idx];
        self.bcx.switch_to_block(self.entries[idx]);

        let stack_base = self.rt.stack_base(&mut self.bcx);
        let stack_size_ptr = self.rt.stack_size_ptr(&mut self.bcx);
        let mut stack = LocalStack::new(&mut self.bcx, stack_base, stack_size_ptr, self.jmp_buf);

        let mut exit: Option<BlockExit<B>> = None;

        // Invalid instruction: abort at runtime and stop compiling the
        // block.
        macro_rules! invalid {
            () => {{
                self.rt.exit(&mut self.bcx, ReturnCode::OutOfGas);
                exit = Some(BlockExit::Terminated);
                break;
            }};
        }

        let rev = self.config.revision;
        let static_call = self.config.static_call;
        let code = &self.code[block.begin()..block.end()];
        for (rel_pc, opcode) in OpcodesIter::new(code).with_pc() {
            if self.gas_meter.count(&mut self.bcx, opcode.opcode).is_some() {
                self.gas_out_poll();
            }

            match opcode.opcode {
                op::ADD => {
                    let lhs = stack.pop(&mut self.bcx);
                    let rhs = stack.pop(&mut self.bcx);
                    let result = self.bcx.iadd(lhs, rhs);
                    stack.push(result);
                }

                op::SUB => {
                    let lhs = stack.pop(&mut self.bcx);
                    let rhs = stack.pop(&mut self.bcx);
                    let result = self.bcx.isub(lhs, rhs);
                    stack.push(result);
                }

                op::MUL => {
                    let lhs = stack.pop(&mut self.bcx);
                    let rhs = stack.pop(&mut self.bcx);
                    let result = self.bcx.imul(lhs, rhs);
                    stack.push(result);
                }

                op::DIV => {
                    let d = stack.pop(&mut self.bcx);
                    let n = stack.pop(&mut self.bcx);
                    let div_by_zero = self.bcx.icmp_imm(IntCC::Equal, n, 0);
                    // Protect against hardware signal.
                    let one = self.word_const(1);
                    let n = self.bcx.select(div_by_zero, one, n);
                    let r = self.bcx.udiv(d, n);
                    let zero = self.word_const(0);
                    let r = self.bcx.select(div_by_zero, zero, r);
                    stack.push(r);
                }

                op::SDIV => {
                    let d = stack.pop(&mut self.bcx);
                    let n = stack.pop(&mut self.bcx);
                    let div_by_zero = self.bcx.icmp_imm(IntCC::Equal, n, 0);
                    let div_by_minus_one = self.bcx.icmp_imm(IntCC::Equal, n, -1);
                    let one = self.word_const(1);
                    let n = self.bcx.select(div_by_zero, one, n);
                    let r = self.bcx.sdiv(d, n);
                    let zero = self.word_const(0);
                    let r = self.bcx.select(div_by_zero, zero, r);
                    // Protect against undef word.min / -1.
                    let zero = self.word_const(0);
                    let d_neg = self.bcx.isub(zero, d);
                    let r = self.bcx.select(div_by_minus_one, d_neg, r);
                    stack.push(r);
                }

                op::MOD => {
                    let d = stack.pop(&mut self.bcx);
                    let n = stack.pop(&mut self.bcx);
                    let div_by_zero = self.bcx.icmp_imm(IntCC::Equal, n, 0);
                    let one = self.word_const(1);
                    let n = self.bcx.select(div_by_zero, one, n);
                    let r = self.bcx.urem(d, n);
                    let zero = self.word_const(0);
                    let r = self.bcx.select(div_by_zero, zero, r);
                    stack.push(r);
                }

                op::SMOD => {
                    let d = stack.pop(&mut self.bcx);
                    let n = stack.pop(&mut self.bcx);
                    let div_by_zero = self.bcx.icmp_imm(IntCC::Equal, n, 0);
                    let div_by_minus_one = self.bcx.icmp_imm(IntCC::Equal, n, -1);
                    let one = self.word_const(1);
                    let n = self.bcx.select(div_by_zero, one, n);
                    let r = self.bcx.srem(d, n);
                    let zero = self.word_const(0);
                    let r = self.bcx.select(div_by_zero, zero, r);
                    let zero = self.word_const(0);
                    let r = self.bcx.select(div_by_minus_one, zero, r);
                    stack.push(r);
                }

                op::ADDMOD | op::MULMOD => {
                    let a = stack.pop(&mut self.bcx);
                    let b = stack.pop(&mut self.bcx);
                    let m = stack.pop(&mut self.bcx);
                    let div_by_zero = self.bcx.icmp_imm(IntCC::Equal, m, 0);
                    let a = self.bcx.zext(self.word256_type, a);
                    let b = self.bcx.zext(self.word256_type, b);
                    let m = self.bcx.zext(self.word256_type, m);
                    let one = self.bcx.iconst(self.word256_type, 1);
                    let m = self.bcx.select(div_by_zero, one, m);
                    let s = if opcode.opcode == op::ADDMOD {
                        self.bcx.iadd(a, b)
                    } else {
                        self.bcx.imul(a, b)
                    };
                    let s = self.bcx.urem(s, m);
                    let s = self.bcx.ireduce(self.word_type, s);
                    let zero = self.word_const(0);
                    let s = self.bcx.select(div_by_zero, zero, s);
                    stack.push(s);
                }

                op::EXP => {
                    let base = stack.pop(&mut self.bcx);
                    let exponent = stack.pop(&mut self.bcx);
                    let _ = self.gas_meter.count_exp(&mut self.bcx, exponent);
                    self.gas_out_poll();
                    let ret = self.arith.exp(&mut self.bcx, base, exponent);
                    stack.push(ret);
                }

                op::NOT => {
                    let value = stack.pop(&mut self.bcx);
                    let ret = self.bcx.bitnot(value);
                    stack.push(ret);
                }

                op::LT | op::GT | op::SLT | op::SGT | op::EQ => {
                    let cond = match opcode.opcode {
                        op::LT => IntCC::UnsignedLessThan,
                        op::GT => IntCC::UnsignedGreaterThan,
                        op::SLT => IntCC::SignedLessThan,
                        op::SGT => IntCC::SignedGreaterThan,
                        _ => IntCC::Equal,
                    };
                    let lhs = stack.pop(&mut self.bcx);
                    let rhs = stack.pop(&mut self.bcx);
                    let res = self.bcx.icmp(cond, lhs, rhs);
                    let res = self.bcx.zext(self.word_type, res);
                    stack.push(res);
                }

                op::ISZERO => {
                    let top = stack.pop(&mut self.bcx);
                    let is_zero = self.bcx.icmp_imm(IntCC::Equal, top, 0);
                    let result = self.bcx.zext(self.word_type, is_zero);
                    stack.push(result);
                }

                op::AND => {
                    let lhs = stack.pop(&mut self.bcx);
                    let rhs = stack.pop(&mut self.bcx);
                    let res = self.bcx.bitand(lhs, rhs);
                    stack.push(res);
                }

                op::OR => {
                    let lhs = stack.pop(&mut self.bcx);
                    let rhs = stack.pop(&mut self.bcx);
                    let res = self.bcx.bitor(lhs, rhs);
                    stack.push(res);
                }

                op::XOR => {
                    let lhs = stack.pop(&mut self.bcx);
                    let rhs = stack.pop(&mut self.bcx);
                    let res = self.bcx.bitxor(lhs, rhs);
                    stack.push(res);
                }

                op::BYTE => {
                    // The index counts from the most significant end; the
                    // word is 16 bytes, anything past it reads zero.
                    let idx = stack.pop(&mut self.bcx);
                    let value = stack.pop(&mut self.bcx);
                    let idx_valid = self.bcx.icmp_imm(IntCC::UnsignedLessThan, idx, 16);
                    let top_byte = self.word_const(15);
                    let pos = self.bcx.isub(top_byte, idx);
                    let shift = self.bcx.imul_imm(pos, 8);
                    let shifted = self.bcx.ushr(value, shift);
                    let byte = {
                        let mask = self.word_const(0xff);
                        self.bcx.bitand(shifted, mask)
                    };
                    let zero = self.word_const(0);
                    let value = self.bcx.select(idx_valid, byte, zero);
                    stack.push(value);
                }

                op::SIGNEXTEND => {
                    let idx = stack.pop(&mut self.bcx);
                    let word = stack.pop(&mut self.bcx);

                    let k16 = {
                        let i4 = self.bcx.type_int(4);
                        let t = self.bcx.ireduce(i4, idx);
                        self.bcx.zext(self.word_type, t)
                    };
                    let k16x8 = self.bcx.imul_imm(k16, 8);

                    // Test for word >> (k * 8 + 7).
                    let bitpos = self.bcx.iadd_imm(k16x8, 7);
                    let bitval = self.bcx.ushr(word, bitpos);
                    let bittest = self.bcx.ireduce(self.bool_type, bitval);

                    let mask = {
                        let one = self.word_const(1);
                        let m = self.bcx.ishl(one, bitpos);
                        let one = self.word_const(1);
                        self.bcx.isub(m, one)
                    };
                    let neg_mask = {
                        let all_ones = self.word_const(-1);
                        self.bcx.bitxor(mask, all_ones)
                    };
                    let val1 = self.bcx.bitor(word, neg_mask);
                    let val0 = self.bcx.bitand(word, mask);

                    let k_in_range = self.bcx.icmp_imm(IntCC::UnsignedLessThanOrEqual, idx, 14);
                    let extended = self.bcx.select(bittest, val1, val0);
                    let result = self.bcx.select(k_in_range, extended, word);
                    stack.push(result);
                }

                op::SHA3 => {
                    let in_off = stack.pop(&mut self.bcx);
                    let in_size = stack.pop(&mut self.bcx);
                    self.mem_require(in_off, in_size);
                    let _ = self.gas_meter.count_sha3_data(&mut self.bcx, in_size);
                    self.gas_out_poll();
                    let hash = self.ext.sha3(&mut self.bcx, in_off, in_size);
                    self.push_word256(&mut stack, hash);
                }

                op::POP => {
                    stack.pop(&mut self.bcx);
                }

                op::PUSH1..=op::PUSH32 => {
                    let value = opcode.immediate.map(U256::from_be_slice).unwrap_or_default();
                    if op::imm_len(opcode.opcode) > 16 {
                        let value = self.bcx.iconst_wide(self.word256_type, value);
                        self.push_word256(&mut stack, value);
                    } else {
                        let value = self.bcx.iconst_wide(self.word_type, value);
                        stack.push(value);
                    }
                }

                op::DUP1..=op::DUP16 => {
                    stack.dup(&mut self.bcx, (opcode.opcode - op::DUP1) as usize);
                }

                op::DUP17..=op::DUP32 if rev < Revision::AionV1 => invalid!(),
                op::DUP17..=op::DUP32 => {
                    stack.dup(&mut self.bcx, (opcode.opcode - op::DUP17) as usize + 16);
                }

                op::SWAP1..=op::SWAP16 => {
                    stack.swap(&mut self.bcx, (opcode.opcode - op::SWAP1) as usize + 1);
                }

                op::SWAP17..=op::SWAP32 if rev < Revision::AionV1 => invalid!(),
                op::SWAP17..=op::SWAP32 => {
                    stack.swap(&mut self.bcx, (opcode.opcode - op::SWAP17) as usize + 17);
                }

                op::MLOAD => {
                    let addr = stack.pop(&mut self.bcx);
                    let size = self.word_const(16);
                    self.mem_require(addr, size);
                    let word = self.memory.load_word(&mut self.bcx, addr);
                    stack.push(word);
                }

                op::MSTORE => {
                    let addr = stack.pop(&mut self.bcx);
                    let word = stack.pop(&mut self.bcx);
                    let size = self.word_const(16);
                    self.mem_require(addr, size);
                    self.memory.store_word(&mut self.bcx, addr, word);
                }

                op::MSTORE8 => {
                    let addr = stack.pop(&mut self.bcx);
                    let word = stack.pop(&mut self.bcx);
                    let size = self.word_const(1);
                    self.mem_require(addr, size);
                    self.memory.store_byte(&mut self.bcx, addr, word);
                }

                op::MSIZE => {
                    let word = self.memory.get_size(&mut self.bcx);
                    stack.push(word);
                }

                op::SLOAD => {
                    let index = stack.pop(&mut self.bcx);
                    let value = self.ext.sload(&mut self.bcx, index);
                    stack.push(value);
                }

                op::SSTORE if static_call => invalid!(),
                op::SSTORE => {
                    let index = stack.pop(&mut self.bcx);
                    let value = stack.pop(&mut self.bcx);
                    let _ = self.gas_meter.count_sstore(&mut self.bcx, &mut self.ext, index, value);
                    self.gas_out_poll();
                    self.ext.sstore(&mut self.bcx, index, value);
                }

                op::JUMP | op::JUMPI => {
                    // Destination resolution is deferred: constant targets
                    // become direct edges, the rest go through the jump
                    // table.
                    let dest = stack.pop(&mut self.bcx);
                    let cond = (opcode.opcode == op::JUMPI).then(|| {
                        let cond_word = stack.pop(&mut self.bcx);
                        self.bcx.icmp_imm(IntCC::NotEqual, cond_word, 0)
                    });
                    exit = Some(BlockExit::Jump(PendingJump { dest, cond }));
                    break;
                }

                op::JUMPDEST => {
                    // Add the basic block to the jump table.
                    debug_assert_eq!(rel_pc, 0, "JUMPDEST must start its block");
                    self.jumpdest_cases.push((block.first_instr_idx(), self.entries[idx]));
                }

                op::PC => {
                    let pc = block.first_instr_idx() + rel_pc as u64;
                    let value = self.bcx.uconst(self.word_type, pc);
                    stack.push(value);
                }

                op::GAS => {
                    self.gas_meter.commit_cost_block(&mut self.bcx);
                    let gas = self.rt.get_gas(&mut self.bcx);
                    let gas = self.bcx.zext(self.word_type, gas);
                    stack.push(gas);
                }

                op::ADDRESS => {
                    let addr = self.rt.address_be(&mut self.bcx);
                    let addr = self.bcx.bswap(addr);
                    self.push_word256(&mut stack, addr);
                }

                op::CALLER => {
                    let addr = self.rt.caller_be(&mut self.bcx);
                    let addr = self.bcx.bswap(addr);
                    self.push_word256(&mut stack, addr);
                }

                op::ORIGIN => {
                    let addr = self.rt.tx_origin_be(&mut self.bcx);
                    let addr = self.bcx.bswap(addr);
                    self.push_word256(&mut stack, addr);
                }

                op::COINBASE => {
                    let addr = self.rt.coinbase_be(&mut self.bcx);
                    let addr = self.bcx.bswap(addr);
                    self.push_word256(&mut stack, addr);
                }

                op::GASPRICE => {
                    let price = self.rt.tx_gas_price_be(&mut self.bcx);
                    let price = self.bcx.bswap(price);
                    stack.push(price);
                }

                op::DIFFICULTY => {
                    let difficulty = self.rt.difficulty_be(&mut self.bcx);
                    let difficulty = self.bcx.bswap(difficulty);
                    stack.push(difficulty);
                }

                op::GASLIMIT => {
                    let value = self.rt.block_gas_limit(&mut self.bcx);
                    stack.push(value);
                }

                op::NUMBER => {
                    let value = self.rt.block_number(&mut self.bcx);
                    stack.push(value);
                }

                op::TIMESTAMP => {
                    let value = self.rt.block_timestamp(&mut self.bcx);
                    stack.push(value);
                }

                op::CALLVALUE => {
                    let value = self.rt.call_value_be(&mut self.bcx);
                    let value = self.bcx.bswap(value);
                    stack.push(value);
                }

                op::CODESIZE => {
                    let size = self.rt.code_size(&mut self.bcx);
                    stack.push(size);
                }

                op::CALLDATASIZE => {
                    let size = self.rt.call_data_size(&mut self.bcx);
                    stack.push(size);
                }

                op::RETURNDATASIZE if rev < Revision::Byzantium => invalid!(),
                op::RETURNDATASIZE => {
                    let size_ptr = self.rt.return_buf_size_ptr(&mut self.bcx);
                    let size = self.bcx.load(self.size_type, size_ptr, "retbufsize");
                    let size = self.bcx.zext(self.word_type, size);
                    stack.push(size);
                }

                op::BLOCKHASH => {
                    let number = stack.pop(&mut self.bcx);
                    // If the number is bigger than int64 assume the result
                    // is 0.
                    let limit = {
                        let max = self.bcx.iconst(self.gas_type, i64::MAX);
                        self.bcx.zext(self.word_type, max)
                    };
                    let is_big_number = self.bcx.icmp(IntCC::UnsignedGreaterThan, number, limit);
                    let hash = self.ext.blockhash(&mut self.bcx, number);
                    let zero = self.bcx.iconst_wide(self.word256_type, U256::ZERO);
                    let hash = self.bcx.select(is_big_number, zero, hash);
                    self.push_word256(&mut stack, hash);
                }

                op::BALANCE => {
                    let addr = self.pop_word256(&mut stack);
                    let value = self.ext.balance(&mut self.bcx, addr);
                    stack.push(value);
                }

                op::EXTCODESIZE => {
                    let addr = self.pop_word256(&mut stack);
                    let size = self.ext.extcodesize(&mut self.bcx, addr);
                    stack.push(size);
                }

                op::CALLDATACOPY => {
                    let dst_idx = stack.pop(&mut self.bcx);
                    let src_idx = stack.pop(&mut self.bcx);
                    let req_bytes = stack.pop(&mut self.bcx);
                    let src_ptr = self.rt.call_data(&mut self.bcx);
                    let src_size = self.rt.call_data_size(&mut self.bcx);
                    self.copy_bytes(src_ptr, src_size, src_idx, dst_idx, req_bytes, true);
                }

                op::RETURNDATACOPY if rev < Revision::Byzantium => invalid!(),
                op::RETURNDATACOPY => {
                    let dst_idx = stack.pop(&mut self.bcx);
                    let src_idx = stack.pop(&mut self.bcx);
                    let req_bytes = stack.pop(&mut self.bcx);
                    let src_ptr = {
                        let ptr = self.rt.return_buf_data_ptr(&mut self.bcx);
                        self.bcx.load(self.ptr_type, ptr, "retbuf")
                    };
                    let src_size = {
                        let ptr = self.rt.return_buf_size_ptr(&mut self.bcx);
                        let size = self.bcx.load(self.size_type, ptr, "retbufsize");
                        self.bcx.zext(self.word_type, size)
                    };
                    self.copy_bytes(src_ptr, src_size, src_idx, dst_idx, req_bytes, false);
                }

                op::CODECOPY => {
                    let dst_idx = stack.pop(&mut self.bcx);
                    let src_idx = stack.pop(&mut self.bcx);
                    let req_bytes = stack.pop(&mut self.bcx);
                    let src_ptr = self.rt.code(&mut self.bcx);
                    let src_size = self.rt.code_size(&mut self.bcx);
                    self.copy_bytes(src_ptr, src_size, src_idx, dst_idx, req_bytes, true);
                }

                op::EXTCODECOPY => {
                    let addr = self.pop_word256(&mut stack);
                    let dst_idx = stack.pop(&mut self.bcx);
                    let src_idx = stack.pop(&mut self.bcx);
                    let req_bytes = stack.pop(&mut self.bcx);
                    let src_ptr = self.ext.extcode(&mut self.bcx, addr);
                    let src_size = self.ext.extcodesize(&mut self.bcx, addr);
                    self.copy_bytes(src_ptr, src_size, src_idx, dst_idx, req_bytes, true);
                }

                op::CALLDATALOAD => {
                    let idx = stack.pop(&mut self.bcx);
                    let value = self.ext.calldataload(&mut self.bcx, idx);
                    stack.push(value);
                }

                op::CREATE if static_call => invalid!(),
                op::CREATE => {
                    let endowment = stack.pop(&mut self.bcx);
                    let init_off = stack.pop(&mut self.bcx);
                    let init_size = stack.pop(&mut self.bcx);
                    self.mem_require(init_off, init_size);
                    self.create_common(&mut stack, endowment, init_off, init_size);
                }

                op::DELEGATECALL if rev < Revision::Homestead => invalid!(),
                op::STATICCALL if rev < Revision::Byzantium => invalid!(),
                op::CALL | op::CALLCODE | op::DELEGATECALL | op::STATICCALL => {
                    self.call_common(&mut stack, opcode.opcode);
                }

                op::REVERT if rev < Revision::Byzantium => invalid!(),
                op::RETURN | op::REVERT => {
                    let index = stack.pop(&mut self.bcx);
                    let size = stack.pop(&mut self.bcx);

                    self.mem_require(index, size);
                    self.rt.register_return_data(&mut self.bcx, index, size);

                    let code = if opcode.opcode == op::REVERT {
                        ReturnCode::Revert
                    } else {
                        ReturnCode::Return
                    };
                    self.rt.exit(&mut self.bcx, code);
                    exit = Some(BlockExit::Terminated);
                }

                op::SELFDESTRUCT if static_call => invalid!(),
                op::SELFDESTRUCT => {
                    let dest = self.pop_word256(&mut stack);
                    if rev >= Revision::TangerineWhistle {
                        let dest_exists = self.ext.exists(&mut self.bcx, dest);
                        let no_penalty = if rev >= Revision::SpuriousDragon {
                            let addr = self.rt.address_be(&mut self.bcx);
                            let addr = self.bcx.bswap(addr);
                            let balance = self.ext.balance(&mut self.bcx, addr);
                            let no_transfer = self.bcx.icmp_imm(IntCC::Equal, balance, 0);
                            self.bcx.bitor(dest_exists, no_transfer)
                        } else {
                            dest_exists
                        };
                        let zero = self.bcx.iconst(self.gas_type, 0);
                        let account_gas =
                            self.bcx.iconst(self.gas_type, schedule::CALL_NEW_ACCOUNT);
                        let penalty = self.bcx.select(no_penalty, zero, account_gas);
                        let _ = self.gas_meter.count_dyn(&mut self.bcx, penalty);
                        self.gas_out_poll();
                    }
                    self.ext.selfdestruct(&mut self.bcx, dest);
                    // Fall through to STOP.
                    self.rt.exit(&mut self.bcx, ReturnCode::Stop);
                    exit = Some(BlockExit::Terminated);
                }

                op::STOP => {
                    self.rt.exit(&mut self.bcx, ReturnCode::Stop);
                    exit = Some(BlockExit::Terminated);
                }

                op::LOG0..=op::LOG4 if static_call => invalid!(),
                op::LOG0..=op::LOG4 => {
                    let begin_idx = stack.pop(&mut self.bcx);
                    let num_bytes = stack.pop(&mut self.bcx);
                    self.mem_require(begin_idx, num_bytes);

                    // This commits the current cost block.
                    let _ = self.gas_meter.count_log_data(&mut self.bcx, num_bytes);
                    self.gas_out_poll();

                    // Each topic takes two stack items, high half first.
                    let num_topics = (opcode.opcode - op::LOG0) as u64;
                    let topics =
                        self.bcx.alloca(self.word_type, num_topics * 2, "log.topics");
                    for slot in 0..num_topics * 2 {
                        let item = stack.pop(&mut self.bcx);
                        let offset = self.bcx.uconst(self.size_type, slot);
                        let ptr = self.bcx.gep(self.word_type, topics, offset, "topic");
                        self.bcx.store(item, ptr);
                    }
                    let num_topics = self.bcx.uconst(self.gas_type, num_topics);
                    self.ext.log(&mut self.bcx, begin_idx, num_bytes, num_topics, topics);
                }

                // Invalid instruction - abort.
                _ => invalid!(),
            }

            if exit.is_some() {
                break;
            }
        }

        self.gas_meter.commit_cost_block(&mut self.bcx);

        let exit_block = self.bcx.current_block().expect("block under construction");
        stack.finalize(&mut self.bcx, exit_block);
        self.exits.push((exit_block, exit.unwrap_or(BlockExit::FallThrough)));
    }

    /// The `CREATE` lowering: forward all but 1/64th of the remaining gas,
    /// decode the result as gas-or-failure, push the new address or zero.
    fn create_common(
        &mut self,
        stack: &mut LocalStack<B::Builder<'a>>,
        endowment: B::Value,
        init_off: B::Value,
        init_size: B::Value,
    ) {
        self.gas_meter.commit_cost_block(&mut self.bcx);

        let gas = self.rt.get_gas(&mut self.bcx);
        let gas_kept = if self.config.revision >= Revision::TangerineWhistle {
            let six = self.bcx.iconst(self.gas_type, 6);
            self.bcx.ushr(gas, six)
        } else {
            self.bcx.iconst(self.gas_type, 0)
        };
        let create_gas = self.bcx.isub(gas, gas_kept);

        let addr_slot = self.bcx.alloca(self.word256_type, 1, "create.addr");
        let r = self.ext.create(&mut self.bcx, create_gas, endowment, init_off, init_size, addr_slot);

        let ret = self.bcx.icmp_imm(IntCC::SignedGreaterThanOrEqual, r, 0);
        let rmagic = {
            let zero = self.bcx.iconst(self.gas_type, 0);
            let failure = self.bcx.iconst(self.gas_type, EVM_CALL_FAILURE);
            self.bcx.select(ret, zero, failure)
        };
        let gas_left = self.bcx.isub(r, rmagic);
        let gas = self.bcx.iadd(gas_left, gas_kept);
        self.rt.set_gas(&mut self.bcx, gas);

        let addr = self.bcx.load(self.word256_type, addr_slot, "create.addr");
        let addr = self.bcx.bswap(addr);
        let zero = self.bcx.iconst_wide(self.word256_type, U256::ZERO);
        let addr = self.bcx.select(ret, addr, zero);
        self.push_word256(stack, addr);
    }

    /// The `CALL`/`CALLCODE`/`DELEGATECALL`/`STATICCALL` lowering.
    fn call_common(&mut self, stack: &mut LocalStack<B::Builder<'a>>, opcode: u8) {
        let rev = self.config.revision;

        let call_gas = stack.pop(&mut self.bcx);
        let address = self.pop_word256(stack);
        let has_value = opcode == op::CALL || opcode == op::CALLCODE;
        let value =
            if has_value { stack.pop(&mut self.bcx) } else { self.word_const(0) };

        let in_off = stack.pop(&mut self.bcx);
        let in_size = stack.pop(&mut self.bcx);
        let out_off = stack.pop(&mut self.bcx);
        let out_size = stack.pop(&mut self.bcx);

        self.gas_meter.commit_cost_block(&mut self.bcx);

        // Require memory for the in and out buffers; out first as we guess
        // it will be after the in one.
        self.mem_require(out_off, out_size);
        self.mem_require(in_off, in_size);

        let no_transfer = self.bcx.icmp_imm(IntCC::Equal, value, 0);

        // For static call mode, select infinite penalty for CALL with value
        // transfer.
        let transfer_gas = if opcode == op::CALL && self.config.static_call {
            i64::MAX
        } else if rev >= Revision::Aion {
            15_000
        } else {
            schedule::VALUE_TRANSFER_GAS
        };
        let transfer_cost = {
            let zero = self.bcx.iconst(self.gas_type, 0);
            let gas = self.bcx.iconst(self.gas_type, transfer_gas);
            self.bcx.select(no_transfer, zero, gas)
        };
        let _ = self.gas_meter.count_dyn(&mut self.bcx, transfer_cost);
        self.gas_out_poll();

        if opcode == op::CALL {
            let account_exists = self.ext.exists(&mut self.bcx, address);
            let no_penalty_cond = if rev >= Revision::SpuriousDragon {
                self.bcx.bitor(account_exists, no_transfer)
            } else {
                account_exists
            };
            let penalty = {
                let zero = self.bcx.iconst(self.gas_type, 0);
                let account_gas = self.bcx.iconst(self.gas_type, schedule::CALL_NEW_ACCOUNT);
                self.bcx.select(no_penalty_cond, zero, account_gas)
            };
            let _ = self.gas_meter.count_dyn(&mut self.bcx, penalty);
            self.gas_out_poll();
        }

        let call_gas = if rev >= Revision::TangerineWhistle {
            let gas = self.rt.get_gas(&mut self.bcx);
            let six = self.bcx.iconst(self.gas_type, 6);
            let gas_64th = self.bcx.ushr(gas, six);
            let max_allowed = {
                let kept = self.bcx.isub(gas, gas_64th);
                self.bcx.zext(self.word_type, kept)
            };
            let cmp = self.bcx.icmp(IntCC::UnsignedGreaterThan, call_gas, max_allowed);
            self.bcx.select(cmp, max_allowed, call_gas)
        } else {
            call_gas
        };

        let _ = self.gas_meter.count_dyn_word(&mut self.bcx, call_gas);
        self.gas_out_poll();

        let stipend = {
            let zero = self.bcx.iconst(self.gas_type, 0);
            let stipend = self.bcx.iconst(self.gas_type, schedule::CALL_STIPEND);
            self.bcx.select(no_transfer, zero, stipend)
        };
        let gas = self.bcx.ireduce(self.gas_type, call_gas);
        let gas = self.bcx.iadd(gas, stipend);

        let kind = match opcode {
            op::CALL => CallKind::Call,
            op::CALLCODE => CallKind::CallCode,
            op::DELEGATECALL => CallKind::DelegateCall,
            _ => CallKind::StaticCall,
        };
        let i32_type = self.bcx.type_int(32);
        let kind = self.bcx.iconst(i32_type, kind as i64);
        let r = self.ext.call(
            &mut self.bcx,
            kind,
            gas,
            address,
            value,
            in_off,
            in_size,
            out_off,
            out_size,
        );

        let ret = self.bcx.icmp_imm(IntCC::SignedGreaterThanOrEqual, r, 0);
        let rmagic = {
            let zero = self.bcx.iconst(self.gas_type, 0);
            let failure = self.bcx.iconst(self.gas_type, EVM_CALL_FAILURE);
            self.bcx.select(ret, zero, failure)
        };
        let final_gas = self.bcx.isub(r, rmagic);
        self.gas_meter.give_back(&mut self.bcx, final_gas);

        let ret = self.bcx.zext(self.word_type, ret);
        stack.push(ret);
    }

    /// Emits branches for the recorded jumps and fall-throughs, then the
    /// jump-table interior.
    fn resolve_jumps(&mut self) {
        let exits = std::mem::take(&mut self.exits);
        for (idx, (exit_block, exit)) in exits.into_iter().enumerate() {
            let next = self.entries.get(idx + 1).copied().unwrap_or(self.stop_block);
            match exit {
                BlockExit::Terminated => {}
                // Block may have no terminator if the next instruction is a
                // jump destination.
                BlockExit::FallThrough => {
                    self.bcx.switch_to_block(exit_block);
                    self.bcx.br(next);
                }
                BlockExit::Jump(PendingJump { dest, cond }) => {
                    self.bcx.switch_to_block(exit_block);
                    let direct = self.bcx.as_const_int(dest).and_then(|dest| {
                        let dest = u64::try_from(dest).ok()?;
                        let case = self.jumpdest_cases.iter().find(|(pc, _)| *pc == dest)?;
                        Some(case.1)
                    });
                    let target = match direct {
                        // Destination index is a constant: do a direct jump
                        // to the destination block.
                        Some(block) => {
                            trace!(block = idx, "resolved static jump");
                            block
                        }
                        // Fill up the phi node.
                        None => {
                            self.incoming_jumps.push((dest, exit_block));
                            self.jump_table
                        }
                    };
                    match cond {
                        Some(cond) => self.bcx.brif(cond, target, next),
                        None => self.bcx.br(target),
                    }
                }
            }
        }

        // The jump-table interior: the destination phi feeding the shared
        // switch. The phi simplifies away when it has no incoming values or
        // a single one.
        self.bcx.switch_to_block(self.jump_table);
        let target = match self.incoming_jumps.as_slice() {
            [] => self.bcx.undef(self.word_type),
            [(single, _)] => *single,
            incoming => {
                let values: Vec<_> = incoming.iter().map(|(value, _)| *value).collect();
                let first = self.bcx.as_const_int(values[0]);
                let all_same = first.is_some()
                    && values.iter().all(|&value| self.bcx.as_const_int(value) == first);
                if all_same {
                    values[0]
                } else {
                    self.bcx.phi(self.word_type, &self.incoming_jumps)
                }
            }
        };
        self.bcx.switch(target, self.abort_block, &self.jumpdest_cases, true);
    }

    /// A constant of the native stack word type.
    fn word_const(&mut self, value: i64) -> B::Value {
        self.bcx.iconst(self.word_type, value)
    }

    /// Pushes a value wider than one stack word as two, high half on top.
    fn push_word256(&mut self, stack: &mut LocalStack<B::Builder<'a>>, value: B::Value) {
        let low = self.bcx.ireduce(self.word_type, value);
        stack.push(low);
        let shift = self.bcx.iconst(self.word256_type, 128);
        let high = self.bcx.ushr(value, shift);
        let high = self.bcx.ireduce(self.word_type, high);
        stack.push(high);
    }

    /// Pops two stack words and joins them into a single 256-bit value.
    fn pop_word256(&mut self, stack: &mut LocalStack<B::Builder<'a>>) -> B::Value {
        let high = stack.pop(&mut self.bcx);
        let high = self.bcx.zext(self.word256_type, high);
        let shift = self.bcx.iconst(self.word256_type, 128);
        let high = self.bcx.ishl(high, shift);
        let low = stack.pop(&mut self.bcx);
        let low = self.bcx.zext(self.word256_type, low);
        self.bcx.bitor(high, low)
    }

    /// Expands memory to cover `[offset, offset + size)`, paying the
    /// expansion.
    fn mem_require(&mut self, offset: B::Value, size: B::Value) {
        let new_words = self.memory.require(&mut self.bcx, offset, size);
        self.gas_out_poll();
        let cost = self.bcx.imul_imm(new_words, schedule::MEMORY_GAS);
        let _ = self.gas_meter.count_memory(&mut self.bcx, cost);
        self.gas_out_poll();
    }

    /// Pays for and performs a bytes copy into memory.
    fn copy_bytes(
        &mut self,
        src_ptr: B::Value,
        src_size: B::Value,
        src_idx: B::Value,
        dst_idx: B::Value,
        req_bytes: B::Value,
        padding: bool,
    ) {
        let words = {
            let padded = self.bcx.iadd_imm(req_bytes, 31);
            let word = self.word_const(32);
            self.bcx.udiv(padded, word)
        };
        let _ = self.gas_meter.count_copy(&mut self.bcx, words);
        self.gas_out_poll();
        self.mem_require(dst_idx, req_bytes);
        self.memory
            .copy_bytes(&mut self.bcx, src_ptr, src_size, src_idx, dst_idx, req_bytes, padding);
    }

    /// Cuts the current block with a check of the failure flag, branching to
    /// `Abort` when it is raised. Emitted after every `mem.require` and
    /// `gas.check` call; this is what makes the helpers' failure paths land
    /// in `Abort` without a non-local jump.
    fn gas_out_poll(&mut self) {
        let gas_out = self.bcx.global_addr("gas_out");
        let flag = self.bcx.load(self.bool_type, gas_out, "gas_out");
        let current = self.bcx.current_block().expect("block under construction");
        let contd = self.bcx.create_block_after(current, "contd");
        self.bcx.brif(flag, self.abort_block, contd);
        self.bcx.switch_to_block(contd);
    }
}
