//! The runtime structure shared with the host.
//!
//! The emitted `execute` function receives a pointer to a [`RuntimeData`];
//! every environment access is a `gep`/`load` against this layout, with
//! offsets taken by `mem::offset_of!` so hosts and tests can build the same
//! image. Identity, value and price fields are big-endian on the wire;
//! counters are native.

use crate::evm::ReturnCode;
use fvmc_backend::Builder;
use std::mem;

/// The runtime stack holds at most this many words.
pub const STACK_SIZE_LIMIT: u64 = 1024;

/// Per-execution state handed in by the host.
#[repr(C)]
#[derive(Debug)]
pub struct RuntimeData {
    /// Remaining gas.
    pub gas: i64,
    /// Pointer to the base of the global stack (1024 words).
    pub stack_base: u64,
    /// Current number of words on the global stack.
    pub stack_size: u64,
    /// Pointer to the call data.
    pub call_data: u64,
    pub call_data_size: u64,
    /// Pointer to the executing code.
    pub code: u64,
    pub code_size: u64,
    /// Executing account address, big-endian.
    pub address: [u8; 32],
    /// Calling account address, big-endian.
    pub caller: [u8; 32],
    /// Transferred value, big-endian.
    pub call_value: [u8; 16],
    pub tx: TxContext,
    /// Pointer to the buffer holding the last sub-call's return data.
    pub return_buf_data: u64,
    pub return_buf_size: u64,
    /// Memory range registered by `RETURN`/`REVERT` for the host to read.
    pub return_offset: u128,
    pub return_size: u128,
}

/// Transaction and block context.
#[repr(C)]
#[derive(Debug)]
pub struct TxContext {
    /// Big-endian.
    pub gas_price: [u8; 16],
    /// Big-endian.
    pub origin: [u8; 32],
    /// Big-endian.
    pub coinbase: [u8; 32],
    pub number: i64,
    pub timestamp: i64,
    pub gas_limit: i64,
    /// Big-endian.
    pub difficulty: [u8; 16],
}

/// Emits accesses to the runtime structure.
pub(crate) struct RuntimeManager<B: Builder> {
    rt: B::Value,
    gas_ptr: B::Value,
    gas_type: B::Type,
    i32_type: B::Type,
    word_type: B::Type,
    word256_type: B::Type,
    size_type: B::Type,
    ptr_type: B::Type,
}

impl<B: Builder> RuntimeManager<B> {
    pub(crate) fn new(bcx: &mut B, rt: B::Value) -> Self {
        let mut this = Self {
            rt,
            gas_ptr: rt,
            gas_type: bcx.type_int(64),
            i32_type: bcx.type_int(32),
            word_type: bcx.type_int(128),
            word256_type: bcx.type_int(256),
            size_type: bcx.type_int(64),
            ptr_type: bcx.type_ptr(),
        };
        this.gas_ptr = this.field_ptr(bcx, mem::offset_of!(RuntimeData, gas), "rt.gas.addr");
        this
    }

    fn field_ptr(&self, bcx: &mut B, offset: usize, name: &str) -> B::Value {
        let byte = bcx.type_int(8);
        let offset = bcx.iconst(self.size_type, offset as i64);
        bcx.gep(byte, self.rt, offset, name)
    }

    pub(crate) fn gas_ptr(&self) -> B::Value {
        self.gas_ptr
    }

    pub(crate) fn get_gas(&self, bcx: &mut B) -> B::Value {
        bcx.load(self.gas_type, self.gas_ptr, "gas")
    }

    pub(crate) fn set_gas(&self, bcx: &mut B, gas: B::Value) {
        bcx.store(gas, self.gas_ptr);
    }

    /// The base of the global stack.
    pub(crate) fn stack_base(&self, bcx: &mut B) -> B::Value {
        let ptr = self.field_ptr(bcx, mem::offset_of!(RuntimeData, stack_base), "rt.stack.addr");
        bcx.load(self.ptr_type, ptr, "rt.stack")
    }

    /// A pointer to the stack size, for `stack.prepare` to update.
    pub(crate) fn stack_size_ptr(&self, bcx: &mut B) -> B::Value {
        self.field_ptr(bcx, mem::offset_of!(RuntimeData, stack_size), "rt.stack_size.addr")
    }

    pub(crate) fn call_data(&self, bcx: &mut B) -> B::Value {
        let ptr = self.field_ptr(bcx, mem::offset_of!(RuntimeData, call_data), "rt.calldata.addr");
        bcx.load(self.ptr_type, ptr, "rt.calldata")
    }

    pub(crate) fn call_data_size(&self, bcx: &mut B) -> B::Value {
        let ptr =
            self.field_ptr(bcx, mem::offset_of!(RuntimeData, call_data_size), "rt.cds.addr");
        let size = bcx.load(self.size_type, ptr, "rt.cds");
        bcx.zext(self.word_type, size)
    }

    pub(crate) fn code(&self, bcx: &mut B) -> B::Value {
        let ptr = self.field_ptr(bcx, mem::offset_of!(RuntimeData, code), "rt.code.addr");
        bcx.load(self.ptr_type, ptr, "rt.code")
    }

    pub(crate) fn code_size(&self, bcx: &mut B) -> B::Value {
        let ptr = self.field_ptr(bcx, mem::offset_of!(RuntimeData, code_size), "rt.codesize.addr");
        let size = bcx.load(self.size_type, ptr, "rt.codesize");
        bcx.zext(self.word_type, size)
    }

    /// The executing address as stored: big-endian.
    pub(crate) fn address_be(&self, bcx: &mut B) -> B::Value {
        let ptr = self.field_ptr(bcx, mem::offset_of!(RuntimeData, address), "rt.address.addr");
        bcx.load(self.word256_type, ptr, "rt.address")
    }

    pub(crate) fn caller_be(&self, bcx: &mut B) -> B::Value {
        let ptr = self.field_ptr(bcx, mem::offset_of!(RuntimeData, caller), "rt.caller.addr");
        bcx.load(self.word256_type, ptr, "rt.caller")
    }

    pub(crate) fn call_value_be(&self, bcx: &mut B) -> B::Value {
        let ptr = self.field_ptr(bcx, mem::offset_of!(RuntimeData, call_value), "rt.value.addr");
        bcx.load(self.word_type, ptr, "rt.value")
    }

    pub(crate) fn tx_gas_price_be(&self, bcx: &mut B) -> B::Value {
        let offset = mem::offset_of!(RuntimeData, tx) + mem::offset_of!(TxContext, gas_price);
        let ptr = self.field_ptr(bcx, offset, "rt.gasprice.addr");
        bcx.load(self.word_type, ptr, "rt.gasprice")
    }

    pub(crate) fn tx_origin_be(&self, bcx: &mut B) -> B::Value {
        let offset = mem::offset_of!(RuntimeData, tx) + mem::offset_of!(TxContext, origin);
        let ptr = self.field_ptr(bcx, offset, "rt.origin.addr");
        bcx.load(self.word256_type, ptr, "rt.origin")
    }

    pub(crate) fn coinbase_be(&self, bcx: &mut B) -> B::Value {
        let offset = mem::offset_of!(RuntimeData, tx) + mem::offset_of!(TxContext, coinbase);
        let ptr = self.field_ptr(bcx, offset, "rt.coinbase.addr");
        bcx.load(self.word256_type, ptr, "rt.coinbase")
    }

    pub(crate) fn difficulty_be(&self, bcx: &mut B) -> B::Value {
        let offset = mem::offset_of!(RuntimeData, tx) + mem::offset_of!(TxContext, difficulty);
        let ptr = self.field_ptr(bcx, offset, "rt.difficulty.addr");
        bcx.load(self.word_type, ptr, "rt.difficulty")
    }

    /// Loads an `i64` block-context field, widened to a stack word.
    fn block_item(&self, bcx: &mut B, offset: usize, name: &str) -> B::Value {
        let offset = mem::offset_of!(RuntimeData, tx) + offset;
        let ptr = self.field_ptr(bcx, offset, name);
        let item = bcx.load(self.gas_type, ptr, "");
        bcx.zext(self.word_type, item)
    }

    pub(crate) fn block_number(&self, bcx: &mut B) -> B::Value {
        self.block_item(bcx, mem::offset_of!(TxContext, number), "rt.number.addr")
    }

    pub(crate) fn block_timestamp(&self, bcx: &mut B) -> B::Value {
        self.block_item(bcx, mem::offset_of!(TxContext, timestamp), "rt.timestamp.addr")
    }

    pub(crate) fn block_gas_limit(&self, bcx: &mut B) -> B::Value {
        self.block_item(bcx, mem::offset_of!(TxContext, gas_limit), "rt.gaslimit.addr")
    }

    pub(crate) fn return_buf_data_ptr(&self, bcx: &mut B) -> B::Value {
        self.field_ptr(bcx, mem::offset_of!(RuntimeData, return_buf_data), "rt.retbuf.addr")
    }

    pub(crate) fn return_buf_size_ptr(&self, bcx: &mut B) -> B::Value {
        self.field_ptr(bcx, mem::offset_of!(RuntimeData, return_buf_size), "rt.retbufsize.addr")
    }

    /// Publishes the memory range `RETURN`/`REVERT` hands back to the host.
    pub(crate) fn register_return_data(&self, bcx: &mut B, offset: B::Value, size: B::Value) {
        let off_ptr =
            self.field_ptr(bcx, mem::offset_of!(RuntimeData, return_offset), "rt.retoff.addr");
        bcx.store(offset, off_ptr);
        let size_ptr =
            self.field_ptr(bcx, mem::offset_of!(RuntimeData, return_size), "rt.retsize.addr");
        bcx.store(size, size_ptr);
    }

    pub(crate) fn exit(&self, bcx: &mut B, code: ReturnCode) {
        let code = bcx.iconst(self.i32_type, code as i64);
        bcx.ret(Some(code));
    }
}
