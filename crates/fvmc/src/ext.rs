//! Shims over the external collaborators: blockchain state (`ext.*`), linear
//! memory (`mem.*`) and the 128-bit EXP helper (`arith.exp`).
//!
//! These are pure IR generators: they declare the imported host symbols and
//! emit calls with the fixed ABI; the host links the implementations.

use fvmc_backend::{Builder, Linkage};

/// Blockchain state access.
pub(crate) struct Ext<B: Builder> {
    rt: B::Value,
    sha3: B::Function,
    balance: B::Function,
    blockhash: B::Function,
    sload: B::Function,
    sstore: B::Function,
    exists: B::Function,
    calldataload: B::Function,
    extcode: B::Function,
    extcodesize: B::Function,
    call: B::Function,
    create: B::Function,
    selfdestruct: B::Function,
    log: B::Function,
}

impl<B: Builder> Ext<B> {
    pub(crate) fn new(bcx: &mut B, rt: B::Value) -> Self {
        let p = bcx.type_ptr();
        let w = bcx.type_int(128);
        let dw = bcx.type_int(256);
        let g = bcx.type_int(64);
        let i32t = bcx.type_int(32);
        let i1 = bcx.type_int(1);
        fn import<B: Builder>(
            bcx: &mut B,
            name: &str,
            params: &[B::Type],
            ret: Option<B::Type>,
        ) -> B::Function {
            bcx.add_function(name, params, ret, Linkage::Import)
        }
        Self {
            rt,
            sha3: import(bcx, "ext.sha3", &[p, w, w], Some(dw)),
            balance: import(bcx, "ext.balance", &[p, dw], Some(w)),
            blockhash: import(bcx, "ext.blockhash", &[p, w], Some(dw)),
            sload: import(bcx, "ext.sload", &[p, w], Some(w)),
            sstore: import(bcx, "ext.sstore", &[p, w, w], None),
            exists: import(bcx, "ext.exists", &[p, dw], Some(i1)),
            calldataload: import(bcx, "ext.calldataload", &[p, w], Some(w)),
            extcode: import(bcx, "ext.extcode", &[p, dw], Some(p)),
            extcodesize: import(bcx, "ext.extcodesize", &[p, dw], Some(w)),
            call: import(bcx, "ext.call", &[p, i32t, g, dw, w, w, w, w, w], Some(g)),
            create: import(bcx, "ext.create", &[p, g, w, w, w, p], Some(g)),
            selfdestruct: import(bcx, "ext.selfdestruct", &[p, dw], None),
            log: import(bcx, "ext.log", &[p, w, w, g, p], None),
        }
    }

    pub(crate) fn sha3(&mut self, bcx: &mut B, off: B::Value, size: B::Value) -> B::Value {
        bcx.call(self.sha3, &[self.rt, off, size]).expect("ext.sha3 returns a value")
    }

    pub(crate) fn balance(&mut self, bcx: &mut B, address: B::Value) -> B::Value {
        bcx.call(self.balance, &[self.rt, address]).expect("ext.balance returns a value")
    }

    pub(crate) fn blockhash(&mut self, bcx: &mut B, number: B::Value) -> B::Value {
        bcx.call(self.blockhash, &[self.rt, number]).expect("ext.blockhash returns a value")
    }

    pub(crate) fn sload(&mut self, bcx: &mut B, key: B::Value) -> B::Value {
        bcx.call(self.sload, &[self.rt, key]).expect("ext.sload returns a value")
    }

    pub(crate) fn sstore(&mut self, bcx: &mut B, key: B::Value, value: B::Value) {
        let _ = bcx.call(self.sstore, &[self.rt, key, value]);
    }

    pub(crate) fn exists(&mut self, bcx: &mut B, address: B::Value) -> B::Value {
        bcx.call(self.exists, &[self.rt, address]).expect("ext.exists returns a value")
    }

    pub(crate) fn calldataload(&mut self, bcx: &mut B, index: B::Value) -> B::Value {
        bcx.call(self.calldataload, &[self.rt, index]).expect("ext.calldataload returns a value")
    }

    pub(crate) fn extcode(&mut self, bcx: &mut B, address: B::Value) -> B::Value {
        bcx.call(self.extcode, &[self.rt, address]).expect("ext.extcode returns a value")
    }

    pub(crate) fn extcodesize(&mut self, bcx: &mut B, address: B::Value) -> B::Value {
        bcx.call(self.extcodesize, &[self.rt, address]).expect("ext.extcodesize returns a value")
    }

    /// `r >= 0` means success with `r` gas remaining; failure is
    /// `EVM_CALL_FAILURE + gas`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn call(
        &mut self,
        bcx: &mut B,
        kind: B::Value,
        gas: B::Value,
        address: B::Value,
        value: B::Value,
        in_off: B::Value,
        in_size: B::Value,
        out_off: B::Value,
        out_size: B::Value,
    ) -> B::Value {
        bcx.call(
            self.call,
            &[self.rt, kind, gas, address, value, in_off, in_size, out_off, out_size],
        )
        .expect("ext.call returns a value")
    }

    /// On success the created address is written big-endian through
    /// `address_out`.
    pub(crate) fn create(
        &mut self,
        bcx: &mut B,
        gas: B::Value,
        endowment: B::Value,
        init_off: B::Value,
        init_size: B::Value,
        address_out: B::Value,
    ) -> B::Value {
        bcx.call(self.create, &[self.rt, gas, endowment, init_off, init_size, address_out])
            .expect("ext.create returns a value")
    }

    pub(crate) fn selfdestruct(&mut self, bcx: &mut B, beneficiary: B::Value) {
        let _ = bcx.call(self.selfdestruct, &[self.rt, beneficiary]);
    }

    /// `topics` points at `num_topics` topics of two words each, high half
    /// first.
    pub(crate) fn log(
        &mut self,
        bcx: &mut B,
        off: B::Value,
        size: B::Value,
        num_topics: B::Value,
        topics: B::Value,
    ) {
        let _ = bcx.call(self.log, &[self.rt, off, size, num_topics, topics]);
    }
}

/// Linear byte memory with gas-priced expansion.
pub(crate) struct Memory<B: Builder> {
    rt: B::Value,
    require: B::Function,
    load: B::Function,
    store: B::Function,
    store8: B::Function,
    size: B::Function,
    copy: B::Function,
}

impl<B: Builder> Memory<B> {
    pub(crate) fn new(bcx: &mut B, rt: B::Value) -> Self {
        let p = bcx.type_ptr();
        let w = bcx.type_int(128);
        let g = bcx.type_int(64);
        let i1 = bcx.type_int(1);
        fn import<B: Builder>(
            bcx: &mut B,
            name: &str,
            params: &[B::Type],
            ret: Option<B::Type>,
        ) -> B::Function {
            bcx.add_function(name, params, ret, Linkage::Import)
        }
        Self {
            rt,
            require: import(bcx, "mem.require", &[p, w, w], Some(g)),
            load: import(bcx, "mem.load", &[p, w], Some(w)),
            store: import(bcx, "mem.store", &[p, w, w], None),
            store8: import(bcx, "mem.store8", &[p, w, w], None),
            size: import(bcx, "mem.size", &[p], Some(w)),
            copy: import(bcx, "mem.copy", &[p, p, w, w, w, w, i1], None),
        }
    }

    /// Expands memory to cover `[offset, offset + size)`.
    ///
    /// Returns the call; its value is the number of newly added 32-byte
    /// words, to be priced by the gas meter. The host raises `gas_out` on
    /// unsatisfiable sizes.
    pub(crate) fn require(&mut self, bcx: &mut B, offset: B::Value, size: B::Value) -> B::Value {
        bcx.call(self.require, &[self.rt, offset, size]).expect("mem.require returns a value")
    }

    pub(crate) fn load_word(&mut self, bcx: &mut B, addr: B::Value) -> B::Value {
        bcx.call(self.load, &[self.rt, addr]).expect("mem.load returns a value")
    }

    pub(crate) fn store_word(&mut self, bcx: &mut B, addr: B::Value, word: B::Value) {
        let _ = bcx.call(self.store, &[self.rt, addr, word]);
    }

    pub(crate) fn store_byte(&mut self, bcx: &mut B, addr: B::Value, word: B::Value) {
        let _ = bcx.call(self.store8, &[self.rt, addr, word]);
    }

    pub(crate) fn get_size(&mut self, bcx: &mut B) -> B::Value {
        bcx.call(self.size, &[self.rt]).expect("mem.size returns a value")
    }

    /// Copies `req_bytes` from a source buffer into memory at `dst_idx`.
    ///
    /// With `padding`, reads past `src_size` yield zeros; without, the host
    /// raises `gas_out` on out-of-range reads.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn copy_bytes(
        &mut self,
        bcx: &mut B,
        src_ptr: B::Value,
        src_size: B::Value,
        src_idx: B::Value,
        dst_idx: B::Value,
        req_bytes: B::Value,
        padding: bool,
    ) {
        let padding = bcx.bool_const(padding);
        let _ =
            bcx.call(self.copy, &[self.rt, src_ptr, src_size, src_idx, dst_idx, req_bytes, padding]);
    }
}

/// 128-bit big-integer helper.
pub(crate) struct Arith128<B: Builder> {
    exp: B::Function,
}

impl<B: Builder> Arith128<B> {
    pub(crate) fn new(bcx: &mut B) -> Self {
        let w = bcx.type_int(128);
        Self { exp: bcx.add_function("arith.exp", &[w, w], Some(w), Linkage::Import) }
    }

    /// `base ** exponent` with wrapping 128-bit semantics.
    pub(crate) fn exp(&mut self, bcx: &mut B, base: B::Value, exponent: B::Value) -> B::Value {
        bcx.call(self.exp, &[base, exponent]).expect("arith.exp returns a value")
    }
}
