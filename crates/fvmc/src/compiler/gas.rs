//! Gas metering: the per-block deferred cost accounting, the dynamic cost
//! points, and the `gas.check` helper.

use crate::{bytecode::opcode as op, evm::Revision, ext::Ext};
use fvmc_backend::{Attribute, Builder, FunctionAttributeLocation, IntCC, Linkage};

/// Baseline gas prices. Revision-dependent overrides live in [`step_cost`].
pub mod schedule {
    pub const STEP_GAS0: i64 = 0;
    pub const STEP_GAS1: i64 = 2;
    pub const STEP_GAS2: i64 = 3;
    pub const STEP_GAS3: i64 = 5;
    pub const STEP_GAS4: i64 = 8;
    pub const STEP_GAS5: i64 = 10;
    pub const STEP_GAS6: i64 = 20;
    pub const SHA3_GAS: i64 = 30;
    pub const SHA3_WORD_GAS: i64 = 6;
    pub const SLOAD_GAS: i64 = 50;
    pub const JUMPDEST_GAS: i64 = 1;
    pub const LOG_GAS: i64 = 375;
    pub const LOG_DATA_GAS: i64 = 8;
    pub const LOG_TOPIC_GAS: i64 = 375;
    pub const CREATE_GAS: i64 = 32_000;
    pub const CALL_GAS: i64 = 40;
    pub const COPY_GAS: i64 = 3;
    pub const EXP_BYTE_GAS: i64 = 10;
    pub const MEMORY_GAS: i64 = 3;
    pub const VALUE_TRANSFER_GAS: i64 = 9_000;
    pub const CALL_STIPEND: i64 = 2_300;
    pub const CALL_NEW_ACCOUNT: i64 = 25_000;
    pub const SSTORE_SET_GAS: i64 = 20_000;
    pub const SSTORE_RESET_GAS: i64 = 5_000;
    pub const SELFDESTRUCT_GAS: i64 = 5_000;
}

/// The deterministic cost of a single instruction.
///
/// `SSTORE` is handled separately in [`GasMeter::count_sstore`]. Invalid
/// instructions cost 0.
pub fn step_cost(opcode: u8, rev: Revision) -> i64 {
    use schedule::*;
    let aion = rev >= Revision::Aion;
    let flat = |cost: i64| if aion { 1 } else { cost };
    match opcode {
        // Tier 0
        op::STOP | op::RETURN | op::REVERT | op::SSTORE => STEP_GAS0,

        // Tier 1
        op::ADDRESS
        | op::ORIGIN
        | op::CALLER
        | op::CALLVALUE
        | op::CALLDATASIZE
        | op::RETURNDATASIZE
        | op::CODESIZE
        | op::GASPRICE
        | op::COINBASE
        | op::TIMESTAMP
        | op::NUMBER
        | op::DIFFICULTY
        | op::GASLIMIT
        | op::POP
        | op::PC
        | op::MSIZE
        | op::GAS => flat(STEP_GAS1),

        // Tier 2
        op::ADD
        | op::SUB
        | op::LT
        | op::GT
        | op::SLT
        | op::SGT
        | op::EQ
        | op::ISZERO
        | op::AND
        | op::OR
        | op::XOR
        | op::NOT
        | op::BYTE
        | op::CALLDATALOAD
        | op::CALLDATACOPY
        | op::RETURNDATACOPY
        | op::CODECOPY
        | op::MLOAD
        | op::MSTORE
        | op::MSTORE8
        | op::PUSH1..=op::PUSH32
        | op::DUP1..=op::DUP16
        | op::SWAP1..=op::SWAP16
        | op::DUP17..=op::DUP32
        | op::SWAP17..=op::SWAP32 => flat(STEP_GAS2),

        // Tier 3
        op::MUL | op::DIV | op::SDIV | op::MOD | op::SMOD | op::SIGNEXTEND => flat(STEP_GAS3),

        // Tier 4
        op::ADDMOD | op::MULMOD | op::JUMP => flat(STEP_GAS4),

        // Tier 5
        op::EXP | op::JUMPI => flat(STEP_GAS5),

        // Tier 6
        op::BALANCE => {
            if aion {
                1000
            } else if rev >= Revision::TangerineWhistle {
                400
            } else {
                STEP_GAS6
            }
        }
        op::EXTCODESIZE | op::EXTCODECOPY => {
            if aion {
                1000
            } else if rev >= Revision::TangerineWhistle {
                700
            } else {
                STEP_GAS6
            }
        }
        op::BLOCKHASH => STEP_GAS6,

        op::SHA3 => SHA3_GAS,

        op::SLOAD => {
            if aion {
                1000
            } else if rev >= Revision::TangerineWhistle {
                200
            } else {
                SLOAD_GAS
            }
        }

        op::JUMPDEST => JUMPDEST_GAS,

        op::LOG0..=op::LOG4 => {
            let topics = (opcode - op::LOG0) as i64;
            if aion {
                500 + topics * 500
            } else {
                LOG_GAS + topics * LOG_TOPIC_GAS
            }
        }

        op::CALL | op::CALLCODE | op::DELEGATECALL | op::STATICCALL => {
            if aion {
                1000
            } else if rev >= Revision::TangerineWhistle {
                700
            } else {
                CALL_GAS
            }
        }

        op::CREATE => {
            if aion {
                200_000
            } else {
                CREATE_GAS
            }
        }

        op::SELFDESTRUCT => {
            if rev >= Revision::TangerineWhistle {
                SELFDESTRUCT_GAS
            } else {
                STEP_GAS0
            }
        }

        // For invalid instructions just return 0.
        _ => 0,
    }
}

/// Per-function gas accounting.
///
/// Deterministic costs are aggregated per cost block: the first
/// [`count`](Self::count) emits a `gas.check` call with a placeholder cost,
/// and [`commit_cost_block`](Self::commit_cost_block) patches the aggregate
/// in (or erases the call when it is zero). Dynamic costs commit the open
/// block and emit their own check.
///
/// Methods that emit a `gas.check` call return it so the caller can insert
/// the `gas_out` poll right after.
pub(crate) struct GasMeter<B: Builder> {
    rev: Revision,
    gas_check: B::Function,
    gas_ptr: B::Value,
    jmp_buf: B::Value,
    gas_type: B::Type,
    word_type: B::Type,
    check_call: Option<B::Value>,
    block_cost: i64,
}

impl<B: Builder> GasMeter<B> {
    pub(crate) fn new(
        bcx: &mut B,
        rev: Revision,
        gas_ptr: B::Value,
        jmp_buf: B::Value,
    ) -> Self {
        let gas_type = bcx.type_int(64);
        let word_type = bcx.type_int(128);
        let bool_type = bcx.type_int(1);
        let ptr = bcx.type_ptr();

        let gas_check = bcx.get_or_build_function(
            "gas.check",
            &[ptr, gas_type, ptr],
            Some(bool_type),
            Linkage::Private,
            |bcx| {
                bcx.add_function_attribute(
                    None,
                    Attribute::NoUnwind,
                    FunctionAttributeLocation::Function,
                );
                bcx.add_function_attribute(
                    None,
                    Attribute::NoCapture,
                    FunctionAttributeLocation::Param(0),
                );

                let update = bcx.create_block("Update");
                let out_of_gas = bcx.create_block("OutOfGas");

                let gas_ptr = bcx.fn_param(0);
                let cost = bcx.fn_param(1);
                // jmp_buf (param 2) is kept for ABI stability and unused.
                let gas = bcx.load(gas_type, gas_ptr, "gas");
                let gas_updated = bcx.isub(gas, cost);
                // gas >= 0: with gas == 0 we can still do 0 cost instructions.
                let gas_ok =
                    bcx.icmp_imm(IntCC::SignedGreaterThanOrEqual, gas_updated, 0);
                bcx.brif(gas_ok, update, out_of_gas);

                bcx.switch_to_block(update);
                bcx.store(gas_updated, gas_ptr);
                let zero = bcx.bool_const(false);
                bcx.ret(Some(zero));

                bcx.switch_to_block(out_of_gas);
                bcx.set_current_block_cold();
                let one = bcx.bool_const(true);
                let gas_out = bcx.global_addr("gas_out");
                bcx.store(one, gas_out);
                bcx.ret(Some(one));
            },
        );

        Self {
            rev,
            gas_check,
            gas_ptr,
            jmp_buf,
            gas_type,
            word_type,
            check_call: None,
            block_cost: 0,
        }
    }

    /// Accounts the deterministic cost of `opcode`.
    ///
    /// Returns the placeholder `gas.check` call when this opens a new cost
    /// block.
    pub(crate) fn count(&mut self, bcx: &mut B, opcode: u8) -> Option<B::Value> {
        let mut emitted = None;
        if self.check_call.is_none() {
            // Placeholder cost, filled in by `commit_cost_block`.
            let undef = bcx.undef(self.gas_type);
            let call = bcx
                .call(self.gas_check, &[self.gas_ptr, undef, self.jmp_buf])
                .expect("gas.check returns a value");
            self.check_call = Some(call);
            emitted = Some(call);
        }
        self.block_cost += step_cost(opcode, self.rev);
        emitted
    }

    /// Emits a check for a dynamic, gas-typed cost. Commits the open cost
    /// block first.
    pub(crate) fn count_dyn(&mut self, bcx: &mut B, cost: B::Value) -> B::Value {
        self.commit_cost_block(bcx);
        bcx.call(self.gas_check, &[self.gas_ptr, cost, self.jmp_buf])
            .expect("gas.check returns a value")
    }

    /// Like [`count_dyn`](Self::count_dyn) for a word-typed cost, clamped to
    /// `i64::MAX` (more than any gas counter can hold).
    pub(crate) fn count_dyn_word(&mut self, bcx: &mut B, cost: B::Value) -> B::Value {
        let gas_max = bcx.iconst(self.gas_type, i64::MAX);
        let gas_max_wide = bcx.zext(self.word_type, gas_max);
        let too_high = bcx.icmp(IntCC::UnsignedGreaterThan, cost, gas_max_wide);
        let cost64 = bcx.ireduce(self.gas_type, cost);
        let cost = bcx.select(too_high, gas_max, cost64);
        self.count_dyn(bcx, cost)
    }

    /// Cost of `EXP`: one `EXP_BYTE_GAS` per significant byte of the
    /// exponent.
    pub(crate) fn count_exp(&mut self, bcx: &mut B, exponent: B::Value) -> B::Value {
        // cost = ((128 - lz) + 7) / 8 * byte_cost
        let lz_wide = bcx.ctlz(exponent);
        let lz = bcx.ireduce(self.gas_type, lz_wide);
        let full = bcx.iconst(self.gas_type, 128);
        let sig_bits = bcx.isub(full, lz);
        let sig_bytes = {
            let seven = bcx.iadd_imm(sig_bits, 7);
            let eight = bcx.iconst(self.gas_type, 8);
            bcx.udiv(seven, eight)
        };
        let byte_cost = if self.rev >= Revision::Aion {
            1
        } else if self.rev >= Revision::SpuriousDragon {
            50
        } else {
            schedule::EXP_BYTE_GAS
        };
        let cost = bcx.imul_imm(sig_bytes, byte_cost);
        self.count_dyn(bcx, cost)
    }

    /// Cost of `SSTORE`: distinguishes inserting a fresh slot from resetting
    /// an existing one by pre-reading the old value.
    pub(crate) fn count_sstore(
        &mut self,
        bcx: &mut B,
        ext: &mut Ext<B>,
        key: B::Value,
        new_value: B::Value,
    ) -> B::Value {
        let old_value = ext.sload(bcx, key);
        let old_is_zero = bcx.icmp_imm(IntCC::Equal, old_value, 0);
        let new_isnt_zero = bcx.icmp_imm(IntCC::NotEqual, new_value, 0);
        let is_insert = bcx.bitand(old_is_zero, new_isnt_zero);
        let reset = if self.rev >= Revision::Aion { 8000 } else { schedule::SSTORE_RESET_GAS };
        let set = bcx.iconst(self.gas_type, schedule::SSTORE_SET_GAS);
        let reset = bcx.iconst(self.gas_type, reset);
        let cost = bcx.select(is_insert, set, reset);
        self.count_dyn(bcx, cost)
    }

    /// Cost of the data bytes of a `LOG` instruction.
    pub(crate) fn count_log_data(&mut self, bcx: &mut B, len: B::Value) -> B::Value {
        let per_byte = if self.rev >= Revision::Aion { 20 } else { schedule::LOG_DATA_GAS };
        let cost = bcx.imul_imm(len, per_byte);
        self.count_dyn_word(bcx, cost)
    }

    /// Cost of the hashed bytes of a `SHA3` instruction, per 32-byte word.
    pub(crate) fn count_sha3_data(&mut self, bcx: &mut B, len: B::Value) -> B::Value {
        let len64 = bcx.ireduce(self.gas_type, len);
        let words64 = {
            let padded = bcx.iadd_imm(len64, 31);
            let size = bcx.iconst(self.gas_type, 32);
            bcx.udiv(padded, size)
        };
        let cost = bcx.imul_imm(words64, schedule::SHA3_WORD_GAS);
        self.count_dyn(bcx, cost)
    }

    /// Memory expansion cost, already priced in gas by the memory module.
    pub(crate) fn count_memory(&mut self, bcx: &mut B, cost: B::Value) -> B::Value {
        self.count_dyn(bcx, cost)
    }

    /// Cost of copying `words` 32-byte words.
    pub(crate) fn count_copy(&mut self, bcx: &mut B, words: B::Value) -> B::Value {
        let cost = bcx.imul_imm(words, schedule::COPY_GAS);
        self.count_dyn_word(bcx, cost)
    }

    /// Returns unused gas of a completed sub-call.
    pub(crate) fn give_back(&mut self, bcx: &mut B, gas: B::Value) {
        let current = bcx.load(self.gas_type, self.gas_ptr, "gas");
        let refunded = bcx.iadd(current, gas);
        bcx.store(refunded, self.gas_ptr);
    }

    /// Ends the open cost block: patches the aggregated cost into the
    /// placeholder call, or erases it when the aggregate is zero. A no-op
    /// when no block is open.
    pub(crate) fn commit_cost_block(&mut self, bcx: &mut B) {
        if let Some(call) = self.check_call.take() {
            if self.block_cost == 0 {
                // Do not check 0.
                bcx.erase_inst(call);
                return;
            }
            let cost = bcx.iconst(self.gas_type, self.block_cost);
            bcx.set_call_arg(call, 1, cost);
            self.block_cost = 0;
        }
        debug_assert_eq!(self.block_cost, 0);
    }
}
