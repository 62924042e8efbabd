//! Bytecode representation and basic-block reconstruction.

pub mod opcode;
use self::opcode as op;

/// A maximal straight-line run of instructions.
///
/// Begins at offset 0, after a terminator, or at a `JUMPDEST`; ends at a
/// terminator or the byte before the next `JUMPDEST`. Backend-free: the
/// compiler keeps the IR block handles in a parallel vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    first_instr_idx: u64,
    begin: usize,
    end: usize,
}

impl BasicBlock {
    /// The byte offset of the first instruction.
    #[inline]
    pub fn first_instr_idx(&self) -> u64 {
        self.first_instr_idx
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    /// One past the last byte of the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// The IR-level name of the block.
    pub fn name(&self) -> String {
        format!(".{}", self.first_instr_idx)
    }
}

/// Splits `code` into basic blocks in one forward pass.
///
/// Bytes after a terminator are dead until the next `JUMPDEST` and produce no
/// block.
pub fn build_basic_blocks(code: &[u8]) -> Vec<BasicBlock> {
    // Skips push data and finds the next iterator (can be the end).
    let skip_push_data = |curr: usize| curr + 1 + op::imm_len(code[curr]).min(code.len() - curr - 1);

    let mut blocks = Vec::new();
    let mut is_dead = false;
    let mut begin = 0;
    let mut curr = 0;
    while curr < code.len() {
        let next = skip_push_data(curr);

        if is_dead {
            if code[curr] == op::JUMPDEST {
                is_dead = false;
                begin = curr;
            } else {
                curr = next;
                continue;
            }
        }

        let mut is_end = match code[curr] {
            _ if op::is_terminator(code[curr]) => {
                is_dead = true;
                true
            }
            op::JUMPI => true,
            _ => false,
        };

        debug_assert!(next <= code.len());
        if next == code.len() || code[next] == op::JUMPDEST {
            is_end = true;
        }

        if is_end {
            blocks.push(BasicBlock { first_instr_idx: begin as u64, begin, end: next });
            begin = next;
        }
        curr = next;
    }

    trace!(count = blocks.len(), "split basic blocks");
    blocks
}
