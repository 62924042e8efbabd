//! The per-block symbolic stack and the `stack.prepare` helper.

use crate::runtime::STACK_SIZE_LIMIT;
use fvmc_backend::{Attribute, Builder, FunctionAttributeLocation, IntCC, Linkage};

/// Symbolic stack of one basic block.
///
/// Values produced and consumed within the block never touch memory. Reads
/// below the block entry are loaded lazily through `sp` and cached; the net
/// effect against the global stack is written back once in
/// [`finalize`](Self::finalize), and the single bounds check lives in
/// `stack.prepare`, whose `min`/`max`/`diff` arguments are patched there.
pub(crate) struct LocalStack<B: Builder> {
    /// Values pushed within this block, bottom first.
    local: Vec<B::Value>,
    /// Cached reads below the entry top; index 0 is the first word below it.
    input: Vec<Option<B::Value>>,
    /// Pops that drained the entry stack after `local` emptied.
    global_pops: usize,
    /// Most negative stack depth reached, relative to entry.
    min_size: i64,
    /// Most positive stack depth reached, relative to entry.
    max_size: i64,
    /// The `stack.prepare` call; points at the slot above the entry top.
    sp: B::Value,
    word_type: B::Type,
    size_type: B::Type,
}

impl<B: Builder> LocalStack<B> {
    /// Emits the `stack.prepare` call for the current block. The `min`,
    /// `max` and `diff` arguments are placeholders until `finalize`.
    pub(crate) fn new(
        bcx: &mut B,
        stack_base: B::Value,
        stack_size_ptr: B::Value,
        jmp_buf: B::Value,
    ) -> Self {
        let word_type = bcx.type_int(128);
        let size_type = bcx.type_int(64);
        let prepare = stack_prepare_func(bcx);
        let undef = bcx.undef(size_type);
        let sp = bcx
            .call(prepare, &[stack_base, stack_size_ptr, undef, undef, undef, jmp_buf])
            .expect("stack.prepare returns a value");
        Self {
            local: Vec::new(),
            input: Vec::new(),
            global_pops: 0,
            min_size: 0,
            max_size: 0,
            sp,
            word_type,
            size_type,
        }
    }

    /// Stack depth relative to block entry.
    pub(crate) fn size(&self) -> i64 {
        self.local.len() as i64 - self.global_pops as i64
    }

    pub(crate) fn push(&mut self, value: B::Value) {
        self.local.push(value);
        self.max_size = self.max_size.max(self.size());
    }

    pub(crate) fn pop(&mut self, bcx: &mut B) -> B::Value {
        let item = self.get(bcx, 0);
        if !self.local.is_empty() {
            self.local.pop();
        } else {
            self.global_pops += 1;
        }
        self.min_size = self.min_size.min(self.size());
        item
    }

    /// The `index`-th element from the top without popping. Reads below the
    /// entry top load from the global stack once and are cached.
    pub(crate) fn get(&mut self, bcx: &mut B, index: usize) -> B::Value {
        if index < self.local.len() {
            return self.local[self.local.len() - 1 - index];
        }

        let idx = index - self.local.len() + self.global_pops;
        if idx >= self.input.len() {
            self.input.resize(idx + 1, None);
        }
        if let Some(item) = self.input[idx] {
            return item;
        }

        // Fetch an item from the global stack.
        let global_idx = -(idx as i64) - 1;
        let offset = bcx.iconst(self.size_type, global_idx);
        let slot = bcx.gep(self.word_type, self.sp, offset, "slot");
        let item = bcx.load(self.word_type, slot, "item");
        self.input[idx] = Some(item);
        // Remember the required stack size.
        self.min_size = self.min_size.min(global_idx);
        item
    }

    pub(crate) fn set(&mut self, index: usize, value: B::Value) {
        if index < self.local.len() {
            let len = self.local.len();
            self.local[len - 1 - index] = value;
            return;
        }

        let idx = index - self.local.len() + self.global_pops;
        debug_assert!(idx < self.input.len(), "set of an unread global slot");
        self.input[idx] = Some(value);
    }

    /// Copies the `index`-th element of the stack and pushes it on the top.
    pub(crate) fn dup(&mut self, bcx: &mut B, index: usize) {
        let value = self.get(bcx, index);
        self.push(value);
    }

    /// Swaps the top element with the `index`-th element. `index` must not
    /// be 0.
    pub(crate) fn swap(&mut self, bcx: &mut B, index: usize) {
        debug_assert!(index > 0);
        let value = self.get(bcx, index);
        let top = self.get(bcx, 0);
        self.set(index, top);
        self.set(0, value);
    }

    /// Patches the `stack.prepare` arguments and writes the net result of
    /// the block back to the global stack, before the block terminator if
    /// one exists.
    pub(crate) fn finalize(&mut self, bcx: &mut B, block: B::BasicBlock) {
        let min = bcx.iconst(self.size_type, self.min_size);
        let max = bcx.iconst(self.size_type, self.max_size);
        let diff = bcx.iconst(self.size_type, self.size());
        bcx.set_call_arg(self.sp, 2, min);
        bcx.set_call_arg(self.sp, 3, max);
        bcx.set_call_arg(self.sp, 4, diff);

        bcx.position_at_term(block);

        let mut input_it = self.input.iter().rev();
        let mut local_it = self.local.iter();
        for global_idx in -(self.input.len() as i64)..self.size() {
            let item = if global_idx < -(self.global_pops as i64) {
                // Update input items; unread slots are skipped.
                match input_it.next().expect("input underrun") {
                    Some(item) => *item,
                    None => continue,
                }
            } else {
                // Store new items.
                *local_it.next().expect("local underrun")
            };
            let offset = bcx.iconst(self.size_type, global_idx);
            let slot = bcx.gep(self.word_type, self.sp, offset, "slot");
            bcx.store(item, slot);
        }
    }
}

/// Builds (once per module) the private helper that bounds-checks a block's
/// whole stack effect and bumps the global size:
///
/// `stack.prepare(base, size_ptr, min, max, diff, jmp_buf) -> *word`
///
/// On a bounds violation it raises `gas_out` but still returns a well-formed
/// `sp`; the caller aborts at its next poll.
fn stack_prepare_func<B: Builder>(bcx: &mut B) -> B::Function {
    if let Some(func) = bcx.get_function("stack.prepare") {
        return func;
    }

    let ptr = bcx.type_ptr();
    let size_type = bcx.type_int(64);
    let word_type = bcx.type_int(128);
    bcx.get_or_build_function(
        "stack.prepare",
        &[ptr, ptr, size_type, size_type, size_type, ptr],
        Some(ptr),
        Linkage::Private,
        |bcx| {
            bcx.add_function_attribute(None, Attribute::NoUnwind, FunctionAttributeLocation::Function);
            bcx.add_function_attribute(None, Attribute::ReadNone, FunctionAttributeLocation::Param(0));
            bcx.add_function_attribute(None, Attribute::NoAlias, FunctionAttributeLocation::Param(1));
            bcx.add_function_attribute(None, Attribute::NoCapture, FunctionAttributeLocation::Param(1));

            let update = bcx.create_block("Update");
            let out_of_stack = bcx.create_block("OutOfStack");

            let base = bcx.fn_param(0);
            let size_ptr = bcx.fn_param(1);
            let min = bcx.fn_param(2);
            let max = bcx.fn_param(3);
            let diff = bcx.fn_param(4);
            // jmp_buf (param 5) is kept for ABI stability and unused.

            let size = bcx.load(size_type, size_ptr, "size");
            let size_min = bcx.iadd(size, min);
            let size_max = bcx.iadd(size, max);
            let min_ok = bcx.icmp_imm(IntCC::SignedGreaterThanOrEqual, size_min, 0);
            let max_ok =
                bcx.icmp_imm(IntCC::UnsignedLessThanOrEqual, size_max, STACK_SIZE_LIMIT as i64);
            let ok = bcx.bitand(min_ok, max_ok);
            bcx.brif(ok, update, out_of_stack);

            let bump = |bcx: &mut B| {
                let new_size = bcx.iadd(size, diff);
                bcx.store(new_size, size_ptr);
                let sp = bcx.gep(word_type, base, size, "sp");
                bcx.ret(Some(sp));
            };

            bcx.switch_to_block(update);
            bump(bcx);

            bcx.switch_to_block(out_of_stack);
            bcx.set_current_block_cold();
            let one = bcx.bool_const(true);
            let gas_out = bcx.global_addr("gas_out");
            bcx.store(one, gas_out);
            // Keep the downstream IR well-formed; the abort happens at the
            // caller's next gas_out poll.
            bump(bcx);
        },
    )
}
