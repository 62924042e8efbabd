#![allow(unreachable_pub, missing_docs)]

use crate::{opcode as op, ReturnCode, Revision};

pub use runner::*;

macro_rules! tests {
    ($($group:ident { $($name:ident { $($fields:tt)* })* })*) => {
        $(
            mod $group {
                use super::*;

                $(
                    #[test]
                    fn $name() {
                        run_test_case(&TestCase { $($fields)* ..Default::default() });
                    }
                )*
            }
        )*
    };
}

tests! {
    ret {
        empty {
            bytecode: &[],
            expected_gas_used: Some(0),
        }
        stop {
            bytecode: &[op::STOP],
            expected_gas_used: Some(0),
        }
        unknown_opcode {
            bytecode: &[0x21],
            expected_return: ReturnCode::OutOfGas,
        }
        stack_underflow {
            bytecode: &[op::ADD],
            expected_return: ReturnCode::OutOfGas,
        }
        jumpi_on_empty_stack {
            bytecode: &[op::PUSH1, 1, op::JUMPI],
            expected_return: ReturnCode::OutOfGas,
        }
    }

    arith {
        add {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP],
            revision: Revision::Frontier,
            expected_stack: &[3],
            expected_gas_used: Some(9),
        }
        sub {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::SUB, op::STOP],
            revision: Revision::Frontier,
            expected_stack: &[1],
            expected_gas_used: Some(9),
        }
        div {
            bytecode: &[op::PUSH1, 2, op::PUSH1, 6, op::DIV, op::STOP],
            expected_stack: &[3],
        }
        div_by_zero {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 6, op::DIV, op::STOP],
            expected_stack: &[0],
        }
        modulo {
            bytecode: &[op::PUSH1, 4, op::PUSH1, 6, op::MOD, op::STOP],
            expected_stack: &[2],
        }
        modulo_by_zero {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 6, op::MOD, op::STOP],
            expected_stack: &[0],
        }
        addmod {
            bytecode: &[op::PUSH1, 5, op::PUSH1, 3, op::PUSH1, 4, op::ADDMOD, op::STOP],
            expected_stack: &[2],
        }
        addmod_by_zero {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 3, op::PUSH1, 4, op::ADDMOD, op::STOP],
            expected_stack: &[0],
        }
        mulmod {
            bytecode: &[op::PUSH1, 5, op::PUSH1, 3, op::PUSH1, 4, op::MULMOD, op::STOP],
            expected_stack: &[2],
        }
        exp {
            bytecode: &[op::PUSH1, 3, op::PUSH1, 2, op::EXP, op::STOP],
            revision: Revision::Frontier,
            expected_stack: &[8],
            expected_gas_used: Some(26),
        }
        exp_zero_exponent {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 2, op::EXP, op::STOP],
            revision: Revision::Frontier,
            expected_stack: &[1],
            expected_gas_used: Some(16),
        }
        iszero {
            bytecode: &[op::PUSH1, 0, op::ISZERO, op::STOP],
            expected_stack: &[1],
        }
        not {
            bytecode: &[op::PUSH1, 0, op::NOT, op::STOP],
            expected_stack: &[u128::MAX],
        }
        lt {
            bytecode: &[op::PUSH1, 2, op::PUSH1, 1, op::LT, op::STOP],
            expected_stack: &[1],
        }
        gt {
            bytecode: &[op::PUSH1, 2, op::PUSH1, 1, op::GT, op::STOP],
            expected_stack: &[0],
        }
        eq {
            bytecode: &[op::PUSH1, 5, op::PUSH1, 5, op::EQ, op::STOP],
            expected_stack: &[1],
        }
        and {
            bytecode: &[op::PUSH1, 0b1100, op::PUSH1, 0b1010, op::AND, op::STOP],
            expected_stack: &[0b1000],
        }
        or {
            bytecode: &[op::PUSH1, 0b1100, op::PUSH1, 0b1010, op::OR, op::STOP],
            expected_stack: &[0b1110],
        }
        xor {
            bytecode: &[op::PUSH1, 0b1100, op::PUSH1, 0b1010, op::XOR, op::STOP],
            expected_stack: &[0b0110],
        }
        byte_low {
            bytecode: &[op::PUSH1, 0xab, op::PUSH1, 15, op::BYTE, op::STOP],
            expected_stack: &[0xab],
        }
        byte_high {
            bytecode: &[op::PUSH1, 0xab, op::PUSH1, 0, op::BYTE, op::STOP],
            expected_stack: &[0],
        }
        byte_out_of_range {
            bytecode: &[op::PUSH1, 0xab, op::PUSH1, 16, op::BYTE, op::STOP],
            expected_stack: &[0],
        }
        signextend {
            bytecode: &[op::PUSH1, 0x80, op::PUSH1, 0, op::SIGNEXTEND, op::STOP],
            expected_stack: &[u128::MAX - 0x7f],
        }
        signextend_positive {
            bytecode: &[op::PUSH1, 0x7f, op::PUSH1, 0, op::SIGNEXTEND, op::STOP],
            expected_stack: &[0x7f],
        }
        signextend_out_of_range {
            bytecode: &[op::PUSH1, 0x80, op::PUSH1, 15, op::SIGNEXTEND, op::STOP],
            expected_stack: &[0x80],
        }
    }

    stack_ops {
        pop {
            bytecode: &[op::PUSH1, 1, op::POP, op::STOP],
            revision: Revision::Frontier,
            expected_gas_used: Some(5),
        }
        dup1 {
            bytecode: &[op::PUSH1, 1, op::DUP1, op::STOP],
            expected_stack: &[1, 1],
        }
        dup2 {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::DUP2, op::STOP],
            expected_stack: &[1, 2, 1],
        }
        swap1 {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::SWAP1, op::STOP],
            expected_stack: &[2, 1],
        }
        swap2 {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::PUSH1, 3, op::SWAP2, op::STOP],
            expected_stack: &[3, 2, 1],
        }
    }

    control_flow {
        basic_jump {
            bytecode: &[op::PUSH1, 3, op::JUMP, op::JUMPDEST, op::PUSH1, 69, op::STOP],
            revision: Revision::Frontier,
            expected_stack: &[69],
            expected_gas_used: Some(15),
        }
        jump_over_dead_code {
            bytecode: &[op::PUSH1, 4, op::JUMP, op::ADD, op::JUMPDEST, op::STOP],
            expected_stack: &[],
        }
        jumpi_taken {
            bytecode: &[
                op::PUSH1, 1, op::PUSH1, 6, op::JUMPI, op::STOP, op::JUMPDEST, op::PUSH1, 9,
                op::STOP,
            ],
            expected_stack: &[9],
        }
        jumpi_not_taken {
            bytecode: &[
                op::PUSH1, 0, op::PUSH1, 6, op::JUMPI, op::STOP, op::JUMPDEST, op::PUSH1, 9,
                op::STOP,
            ],
            expected_stack: &[],
        }
        dynamic_jump {
            // The destination is computed, so it goes through the jump
            // table.
            bytecode: &[
                op::PUSH1, 4, op::PUSH1, 3, op::ADD, op::JUMP, op::STOP, op::JUMPDEST,
                op::PUSH1, 42, op::STOP,
            ],
            expected_stack: &[42],
        }
        dynamic_jump_to_invalid_target {
            bytecode: &[op::PUSH1, 5, op::PUSH1, 1, op::ADD, op::JUMP],
            expected_return: ReturnCode::OutOfGas,
        }
        constant_jump_to_invalid_target {
            bytecode: &[op::PUSH1, 0, op::JUMP],
            expected_return: ReturnCode::OutOfGas,
        }
        countdown_loop {
            bytecode: &[
                op::PUSH1, 3,  // i=3
                op::JUMPDEST,  // i
                op::PUSH1, 1,  // 1, i
                op::SWAP1,     // i, 1
                op::SUB,       // i-1
                op::DUP1,      // i-1, i-1
                op::PUSH1, 2,  // dst, i-1, i-1
                op::JUMPI,     // i=i-1
                op::POP,
                op::PUSH1, 69,
                op::STOP,
            ],
            expected_stack: &[69],
            expected_gas_used: Some(24),
        }
        cross_block_stack {
            // Block 0 leaves a 7 on the global stack; the jump target
            // consumes it.
            bytecode: &[
                op::PUSH1, 7, op::PUSH1, 1, op::PUSH1, 8, op::JUMPI, op::STOP, op::JUMPDEST,
                op::PUSH1, 2, op::ADD, op::STOP,
            ],
            expected_stack: &[9],
            expected_gas_used: Some(7),
        }
        swap_across_blocks {
            // SWAP1 in the second block touches only entry-stack slots.
            bytecode: &[
                op::PUSH1, 1, op::PUSH1, 2, op::PUSH1, 7, op::JUMP, op::JUMPDEST, op::SWAP1,
                op::STOP,
            ],
            expected_stack: &[2, 1],
        }
    }

    memory {
        mstore_mload {
            bytecode: &[
                op::PUSH1, 42, op::PUSH1, 0, op::MSTORE, op::PUSH1, 0, op::MLOAD, op::STOP,
            ],
            revision: Revision::Frontier,
            expected_stack: &[42],
            expected_gas_used: Some(18),
        }
        mstore8 {
            bytecode: &[
                op::PUSH1, 0xff, op::PUSH1, 3, op::MSTORE8, op::PUSH1, 0, op::MLOAD, op::STOP,
            ],
            expected_stack: &[0xff << 96],
        }
        msize {
            bytecode: &[op::PUSH1, 10, op::PUSH1, 0, op::MSTORE, op::MSIZE, op::STOP],
            expected_stack: &[32],
        }
        return_empty {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 0, op::RETURN],
            expected_return: ReturnCode::Return,
            expected_output: Some(&[]),
        }
        revert_below_byzantium {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 0, op::REVERT],
            revision: Revision::Homestead,
            expected_return: ReturnCode::OutOfGas,
        }
    }

    storage {
        sload {
            bytecode: &[op::PUSH1, 5, op::SLOAD, op::STOP],
            modify_host: Some(|host| {
                host.storage.insert(5, 7);
            }),
            expected_stack: &[7],
        }
        sstore_insert {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 0, op::SSTORE, op::STOP],
            expected_gas_used: Some(20_002),
            assert_host: Some(|host| {
                assert_eq!(host.storage.get(&0), Some(&1));
            }),
        }
        sstore_reset {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 0, op::SSTORE, op::STOP],
            modify_host: Some(|host| {
                host.storage.insert(0, 5);
            }),
            expected_gas_used: Some(8_002),
        }
        sstore_clear_prices_as_reset {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 0, op::SSTORE, op::STOP],
            modify_host: Some(|host| {
                host.storage.insert(0, 5);
            }),
            expected_gas_used: Some(8_002),
        }
        sstore_in_static_call {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 0, op::SSTORE, op::STOP],
            static_call: true,
            expected_return: ReturnCode::OutOfGas,
        }
    }

    env {
        callvalue {
            bytecode: &[op::CALLVALUE, op::STOP],
            expected_stack: &[DEF_CALL_VALUE],
        }
        calldatasize {
            bytecode: &[op::CALLDATASIZE, op::STOP],
            expected_stack: &[64],
        }
        codesize {
            bytecode: &[op::CODESIZE, op::STOP],
            expected_stack: &[2],
        }
        gasprice {
            bytecode: &[op::GASPRICE, op::STOP],
            expected_stack: &[DEF_GAS_PRICE],
        }
        difficulty {
            bytecode: &[op::DIFFICULTY, op::STOP],
            expected_stack: &[DEF_DIFFICULTY],
        }
        gaslimit {
            bytecode: &[op::GASLIMIT, op::STOP],
            expected_stack: &[DEF_GAS_LIMIT as u128],
        }
        number {
            bytecode: &[op::NUMBER, op::STOP],
            expected_stack: &[DEF_NUMBER as u128],
        }
        timestamp {
            bytecode: &[op::TIMESTAMP, op::STOP],
            expected_stack: &[DEF_TIMESTAMP as u128],
        }
        pc {
            bytecode: &[op::PC, op::PUSH1, 0, op::POP, op::PC, op::STOP],
            expected_stack: &[0, 4],
        }
        gas_reads_remaining {
            bytecode: &[op::GAS, op::STOP],
            gas: 1000,
            expected_stack: &[999],
        }
        blockhash {
            bytecode: &[op::PUSH1, 5, op::BLOCKHASH, op::STOP],
            expected_stack: &[5, 5],
        }
        returndatasize {
            bytecode: &[op::RETURNDATASIZE, op::STOP],
            expected_stack: &[64],
        }
        returndatasize_below_byzantium {
            bytecode: &[op::RETURNDATASIZE, op::STOP],
            revision: Revision::Homestead,
            expected_return: ReturnCode::OutOfGas,
        }
        returndatacopy_out_of_range {
            bytecode: &[
                op::PUSH1, 65, op::PUSH1, 0, op::PUSH1, 0, op::RETURNDATACOPY, op::STOP,
            ],
            expected_return: ReturnCode::OutOfGas,
        }
        balance {
            bytecode: &[op::PUSH1, 5, op::PUSH1, 0, op::BALANCE, op::STOP],
            modify_host: Some(|host| {
                host.balances.insert(fvmc_backend::U256::from(5u8), 999);
            }),
            expected_stack: &[999],
        }
        extcodesize {
            bytecode: &[op::PUSH1, 5, op::PUSH1, 0, op::EXTCODESIZE, op::STOP],
            expected_stack: &[EXT_CODE.len() as u128],
        }
    }

    logs {
        log0 {
            bytecode: &[op::PUSH1, 2, op::PUSH1, 0, op::LOG0, op::STOP],
            expected_gas_used: Some(545),
            assert_host: Some(|host| {
                assert_eq!(host.logs.len(), 1);
                assert_eq!(host.logs[0].data, &[0, 0]);
                assert!(host.logs[0].topics.is_empty());
            }),
        }
        log2_topics {
            bytecode: &[
                op::PUSH1, 0x22, op::PUSH1, 0, op::PUSH1, 0x11, op::PUSH1, 0, op::PUSH1, 0,
                op::PUSH1, 0, op::LOG2, op::STOP,
            ],
            assert_host: Some(|host| {
                use fvmc_backend::U256;
                assert_eq!(host.logs.len(), 1);
                assert!(host.logs[0].data.is_empty());
                assert_eq!(host.logs[0].topics, vec![U256::from(0x11), U256::from(0x22)]);
            }),
        }
        log_in_static_call {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 0, op::LOG0, op::STOP],
            static_call: true,
            expected_return: ReturnCode::OutOfGas,
        }
    }

    selfdestruct {
        basic {
            bytecode: &[op::PUSH1, 7, op::PUSH1, 0, op::SELFDESTRUCT],
            revision: Revision::Frontier,
            assert_host: Some(|host| {
                assert_eq!(host.selfdestructs, vec![fvmc_backend::U256::from(7u8)]);
            }),
        }
        new_account_penalty {
            bytecode: &[op::PUSH1, 7, op::PUSH1, 0, op::SELFDESTRUCT],
            revision: Revision::TangerineWhistle,
            expected_gas_used: Some(30_006),
        }
        no_penalty_when_beneficiary_exists {
            bytecode: &[op::PUSH1, 7, op::PUSH1, 0, op::SELFDESTRUCT],
            revision: Revision::TangerineWhistle,
            modify_host: Some(|host| {
                host.existing.insert(fvmc_backend::U256::from(7u8));
            }),
            expected_gas_used: Some(5_006),
        }
        no_penalty_on_zero_balance {
            bytecode: &[op::PUSH1, 7, op::PUSH1, 0, op::SELFDESTRUCT],
            revision: Revision::SpuriousDragon,
            expected_gas_used: Some(5_006),
        }
        in_static_call {
            bytecode: &[op::PUSH1, 7, op::PUSH1, 0, op::SELFDESTRUCT],
            static_call: true,
            expected_return: ReturnCode::OutOfGas,
        }
    }

    gas_metering {
        aion_block_cost_exact {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP],
            gas: 3,
            expected_stack: &[3],
            expected_gas_used: Some(3),
        }
        aion_block_cost_exceeded {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP],
            gas: 2,
            expected_return: ReturnCode::OutOfGas,
        }
        frontier_block_cost_exact {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP],
            revision: Revision::Frontier,
            gas: 9,
            expected_stack: &[3],
        }
        frontier_block_cost_exceeded {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP],
            revision: Revision::Frontier,
            gas: 8,
            expected_return: ReturnCode::OutOfGas,
        }
    }
}

/// Literal hex bytecodes, end to end.
mod scenarios {
    use super::*;

    fn run_hex(bytecode: &str, test_case: TestCase<'_>) {
        let code = hex::decode(bytecode).unwrap();
        run_test_case(&TestCase { bytecode: &code, ..test_case });
    }

    #[test]
    fn push_add_stop() {
        run_hex(
            "600160020100",
            TestCase {
                revision: Revision::Frontier,
                expected_stack: &[3],
                expected_gas_used: Some(9),
                ..Default::default()
            },
        );
    }

    #[test]
    fn constant_jump_to_jumpdest() {
        run_hex("6003565b00", TestCase { ..Default::default() });
    }

    #[test]
    fn adjacent_jumpdests() {
        // Each JUMPDEST opens a block of its own.
        run_hex("5b5b00", TestCase { expected_gas_used: Some(2), ..Default::default() });
    }

    #[test]
    fn store_and_return() {
        let mut output = [0u8; 32];
        output[15] = 0x0a;
        run_hex(
            "600a60005260206000f3",
            TestCase {
                expected_return: ReturnCode::Return,
                expected_output: Some(&output),
                ..Default::default()
            },
        );
    }

    #[test]
    fn jumpi_without_destination_underflows() {
        run_hex(
            "600157",
            TestCase { expected_return: ReturnCode::OutOfGas, ..Default::default() },
        );
    }
}

mod wide_values {
    use super::*;

    fn push16(value: u128) -> Vec<u8> {
        let mut code = vec![op::PUSH16];
        code.extend_from_slice(&value.to_be_bytes());
        code
    }

    #[test]
    fn add_wraps() {
        let mut code = push16(u128::MAX);
        code.extend_from_slice(&[op::PUSH1, 1, op::ADD, op::STOP]);
        run_test_case(&TestCase { bytecode: &code, expected_stack: &[0], ..Default::default() });
    }

    #[test]
    fn sdiv_negative() {
        let mut code = vec![op::PUSH1, 2];
        code.extend_from_slice(&push16((-2i128) as u128));
        code.extend_from_slice(&[op::SDIV, op::STOP]);
        run_test_case(&TestCase {
            bytecode: &code,
            expected_stack: &[u128::MAX], // -1
            ..Default::default()
        });
    }

    #[test]
    fn sdiv_min_by_minus_one() {
        let mut code = push16(u128::MAX); // -1
        code.extend_from_slice(&push16(1 << 127)); // word::MIN
        code.extend_from_slice(&[op::SDIV, op::STOP]);
        run_test_case(&TestCase { bytecode: &code, expected_stack: &[1 << 127], ..Default::default() });
    }

    #[test]
    fn smod_by_minus_one() {
        let mut code = push16(u128::MAX); // -1
        code.extend_from_slice(&[op::PUSH1, 5, op::SMOD, op::STOP]);
        run_test_case(&TestCase { bytecode: &code, expected_stack: &[0], ..Default::default() });
    }

    #[test]
    fn push17_spans_two_words() {
        // 17-byte immediates no longer fit one word and push two, high half
        // on top.
        let mut code = vec![op::PUSH17, 0x01];
        code.extend_from_slice(&[0; 16]);
        code.push(op::STOP);
        run_test_case(&TestCase { bytecode: &code, expected_stack: &[0, 1], ..Default::default() });
    }

    #[test]
    fn push32_spans_two_words() {
        let mut code = vec![op::PUSH32];
        let bytes: Vec<u8> = (1..=32).collect();
        code.extend_from_slice(&bytes);
        code.push(op::STOP);
        let high = u128::from_be_bytes(bytes[..16].try_into().unwrap());
        let low = u128::from_be_bytes(bytes[16..].try_into().unwrap());
        run_test_case(&TestCase {
            bytecode: &code,
            expected_stack: &[low, high],
            ..Default::default()
        });
    }

    #[test]
    fn truncated_push_reads_available_bytes() {
        run_test_case(&TestCase {
            bytecode: &[op::PUSH4, 0x69],
            expected_stack: &[0x69],
            ..Default::default()
        });
    }

    #[test]
    fn blockhash_of_big_number_is_zero() {
        let mut code = push16(u128::MAX);
        code.extend_from_slice(&[op::BLOCKHASH, op::STOP]);
        run_test_case(&TestCase { bytecode: &code, expected_stack: &[0, 0], ..Default::default() });
    }
}

mod extended_stack_ops {
    use super::*;

    fn pushes(values: std::ops::RangeInclusive<u8>) -> Vec<u8> {
        values.flat_map(|value| [op::PUSH1, value]).collect()
    }

    #[test]
    fn dup17_rejected_below_aion_v1() {
        let mut code = pushes(1..=17);
        code.extend_from_slice(&[op::DUP17, op::STOP]);
        run_test_case(&TestCase {
            bytecode: &code,
            revision: Revision::Aion,
            expected_return: ReturnCode::OutOfGas,
            ..Default::default()
        });
    }

    #[test]
    fn dup17() {
        let mut code = pushes(1..=17);
        code.extend_from_slice(&[op::DUP17, op::STOP]);
        let mut expected: Vec<u128> = (1..=17).collect();
        expected.push(1);
        run_test_case(&TestCase {
            bytecode: &code,
            revision: Revision::AionV1,
            expected_stack: &expected,
            ..Default::default()
        });
    }

    #[test]
    fn swap17() {
        let mut code = pushes(1..=18);
        code.extend_from_slice(&[op::SWAP17, op::STOP]);
        let mut expected: Vec<u128> = (1..=18).collect();
        expected.swap(0, 17);
        run_test_case(&TestCase {
            bytecode: &code,
            revision: Revision::AionV1,
            expected_stack: &expected,
            ..Default::default()
        });
    }

    #[test]
    fn stack_at_limit() {
        let code: Vec<u8> = (0..1024).flat_map(|_| [op::PUSH1, 0]).collect();
        let expected = vec![0u128; 1024];
        run_test_case(&TestCase { bytecode: &code, expected_stack: &expected, ..Default::default() });
    }

    #[test]
    fn stack_overflow() {
        let code: Vec<u8> = (0..1025).flat_map(|_| [op::PUSH1, 0]).collect();
        run_test_case(&TestCase {
            bytecode: &code,
            expected_return: ReturnCode::OutOfGas,
            ..Default::default()
        });
    }
}

mod copies {
    use super::*;

    fn word_of(bytes: &[u8]) -> u128 {
        let mut word = [0u8; 16];
        word[..bytes.len()].copy_from_slice(bytes);
        u128::from_be_bytes(word)
    }

    #[test]
    fn calldataload() {
        run_test_case(&TestCase {
            bytecode: &[op::PUSH1, 0, op::CALLDATALOAD, op::STOP],
            expected_stack: &[word_of(&[0xaa; 16])],
            ..Default::default()
        });
    }

    #[test]
    fn calldataload_past_end_pads() {
        run_test_case(&TestCase {
            bytecode: &[op::PUSH1, 60, op::CALLDATALOAD, op::STOP],
            expected_stack: &[word_of(&[0xaa; 4])],
            ..Default::default()
        });
    }

    #[test]
    fn calldatacopy() {
        run_test_case(&TestCase {
            bytecode: &[
                op::PUSH1, 4, op::PUSH1, 0, op::PUSH1, 0, op::CALLDATACOPY, op::PUSH1, 0,
                op::MLOAD, op::STOP,
            ],
            expected_stack: &[word_of(&[0xaa; 4])],
            ..Default::default()
        });
    }

    #[test]
    fn codecopy() {
        let bytecode = &[
            op::PUSH1, 3, op::PUSH1, 0, op::PUSH1, 0, op::CODECOPY, op::PUSH1, 0, op::MLOAD,
            op::STOP,
        ];
        run_test_case(&TestCase {
            bytecode,
            expected_stack: &[word_of(&bytecode[..3])],
            ..Default::default()
        });
    }

    #[test]
    fn returndatacopy() {
        run_test_case(&TestCase {
            bytecode: &[
                op::PUSH1, 4, op::PUSH1, 0, op::PUSH1, 0, op::RETURNDATACOPY, op::PUSH1, 0,
                op::MLOAD, op::STOP,
            ],
            expected_stack: &[word_of(&[0xbb; 4])],
            ..Default::default()
        });
    }

    #[test]
    fn extcodecopy() {
        run_test_case(&TestCase {
            bytecode: &[
                op::PUSH1, 4, op::PUSH1, 0, op::PUSH1, 0, op::PUSH1, 5, op::PUSH1, 0,
                op::EXTCODECOPY, op::PUSH1, 0, op::MLOAD, op::STOP,
            ],
            expected_stack: &[word_of(&EXT_CODE[..4])],
            ..Default::default()
        });
    }

    #[test]
    fn sha3() {
        let (high, low) = fake_sha3(&[0, 0, 0]);
        run_test_case(&TestCase {
            bytecode: &[op::PUSH1, 3, op::PUSH1, 0, op::SHA3, op::STOP],
            revision: Revision::Frontier,
            expected_stack: &[low, high],
            expected_gas_used: Some(45),
            ..Default::default()
        });
    }

    #[test]
    fn identity_pushed_big_endian() {
        let word = u128::from_be_bytes([0xba; 16]);
        run_test_case(&TestCase {
            bytecode: &[op::ADDRESS, op::STOP],
            expected_stack: &[word, word],
            ..Default::default()
        });
        let word = u128::from_be_bytes([0xca; 16]);
        run_test_case(&TestCase {
            bytecode: &[op::CALLER, op::STOP],
            expected_stack: &[word, word],
            ..Default::default()
        });
        let word = u128::from_be_bytes([0xcc; 16]);
        run_test_case(&TestCase {
            bytecode: &[op::ORIGIN, op::STOP],
            expected_stack: &[word, word],
            ..Default::default()
        });
        let word = u128::from_be_bytes([0xcb; 16]);
        run_test_case(&TestCase {
            bytecode: &[op::COINBASE, op::STOP],
            expected_stack: &[word, word],
            ..Default::default()
        });
    }

    #[test]
    fn return_output() {
        let bytecode =
            &[op::PUSH1, 0x0a, op::PUSH1, 0, op::MSTORE, op::PUSH1, 32, op::PUSH1, 0, op::RETURN];
        let mut expected = [0u8; 32];
        expected[15] = 0x0a;
        run_test_case(&TestCase {
            bytecode,
            expected_return: ReturnCode::Return,
            expected_output: Some(&expected),
            ..Default::default()
        });
    }

    #[test]
    fn revert_output() {
        let bytecode =
            &[op::PUSH1, 0x0a, op::PUSH1, 0, op::MSTORE, op::PUSH1, 32, op::PUSH1, 0, op::REVERT];
        let mut expected = [0u8; 32];
        expected[15] = 0x0a;
        run_test_case(&TestCase {
            bytecode,
            expected_return: ReturnCode::Revert,
            expected_output: Some(&expected),
            ..Default::default()
        });
    }
}

mod calls {
    use super::*;
    use crate::CallKind;
    use fvmc_backend::U256;

    /// `<call op> gas=.. address=.. [value=..]`, all buffers empty.
    fn call_code(opcode: u8, gas: u8, address: u8, value: u8) -> Vec<u8> {
        let mut code = vec![
            op::PUSH1, 0, // out_size
            op::PUSH1, 0, // out_off
            op::PUSH1, 0, // in_size
            op::PUSH1, 0, // in_off
        ];
        if opcode == op::CALL || opcode == op::CALLCODE {
            code.extend_from_slice(&[op::PUSH1, value]);
        }
        code.extend_from_slice(&[
            op::PUSH1, address, // low half
            op::PUSH1, 0,       // high half
            op::PUSH1, gas,
            opcode,
            op::STOP,
        ]);
        code
    }

    #[test]
    fn call_success() {
        run_test_case(&TestCase {
            bytecode: &call_code(op::CALL, 5, 9, 0),
            expected_stack: &[1],
            expected_gas_used: Some(1008),
            assert_host: Some(|host| {
                assert_eq!(host.calls.len(), 1);
                assert_eq!(host.calls[0].kind, CallKind::Call as i32);
                assert_eq!(host.calls[0].gas, 5);
                assert_eq!(host.calls[0].address, U256::from(9u8));
                assert_eq!(host.calls[0].value, 0);
            }),
            ..Default::default()
        });
    }

    #[test]
    fn call_failure_pushes_zero() {
        run_test_case(&TestCase {
            bytecode: &call_code(op::CALL, 5, 9, 0),
            modify_host: Some(|host| host.call_fail = true),
            expected_stack: &[0],
            expected_gas_used: Some(1013),
            ..Default::default()
        });
    }

    #[test]
    fn call_with_value_adds_stipend() {
        run_test_case(&TestCase {
            bytecode: &call_code(op::CALL, 5, 9, 7),
            modify_host: Some(|host| {
                host.existing.insert(U256::from(9u8));
            }),
            expected_stack: &[1],
            assert_host: Some(|host| {
                assert_eq!(host.calls[0].value, 7);
                assert_eq!(host.calls[0].gas, 5 + crate::schedule::CALL_STIPEND);
            }),
            ..Default::default()
        });
    }

    #[test]
    fn call_with_value_in_static_call_aborts() {
        run_test_case(&TestCase {
            bytecode: &call_code(op::CALL, 5, 9, 7),
            static_call: true,
            expected_return: ReturnCode::OutOfGas,
            ..Default::default()
        });
    }

    #[test]
    fn delegatecall() {
        run_test_case(&TestCase {
            bytecode: &call_code(op::DELEGATECALL, 5, 9, 0),
            expected_stack: &[1],
            assert_host: Some(|host| {
                assert_eq!(host.calls[0].kind, CallKind::DelegateCall as i32);
                assert_eq!(host.calls[0].value, 0);
            }),
            ..Default::default()
        });
    }

    #[test]
    fn delegatecall_below_homestead() {
        run_test_case(&TestCase {
            bytecode: &call_code(op::DELEGATECALL, 5, 9, 0),
            revision: Revision::Frontier,
            expected_return: ReturnCode::OutOfGas,
            ..Default::default()
        });
    }

    #[test]
    fn staticcall_below_byzantium() {
        run_test_case(&TestCase {
            bytecode: &call_code(op::STATICCALL, 5, 9, 0),
            revision: Revision::Homestead,
            expected_return: ReturnCode::OutOfGas,
            ..Default::default()
        });
    }

    #[test]
    fn create_success() {
        let address_half = u128::from_be_bytes([0xcd; 16]);
        run_test_case(&TestCase {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 0, op::PUSH1, 0, op::CREATE, op::STOP],
            expected_stack: &[address_half, address_half],
            expected_gas_used: Some(200_003),
            assert_host: Some(|host| {
                assert_eq!(host.creates.len(), 1);
                assert_eq!(host.creates[0].endowment, 0);
            }),
            ..Default::default()
        });
    }

    #[test]
    fn create_failure_pushes_zero_address() {
        run_test_case(&TestCase {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 0, op::PUSH1, 0, op::CREATE, op::STOP],
            modify_host: Some(|host| host.create_fail = true),
            expected_stack: &[0, 0],
            ..Default::default()
        });
    }

    #[test]
    fn create_in_static_call() {
        run_test_case(&TestCase {
            bytecode: &[op::PUSH1, 0, op::PUSH1, 0, op::PUSH1, 0, op::CREATE, op::STOP],
            static_call: true,
            expected_return: ReturnCode::OutOfGas,
            ..Default::default()
        });
    }
}

mod ir_shape {
    use super::*;
    use crate::CompilerConfig;
    use fvmc_backend::U256;
    use fvmc_ir::{ConstKind, FunctionData, InstKind, Module, Value};

    fn compile(bytecode: &[u8]) -> Module {
        compile_module(
            bytecode,
            CompilerConfig { revision: Revision::Frontier, static_call: false },
        )
    }

    fn function<'m>(module: &'m Module, name: &str) -> &'m FunctionData {
        module.function(module.get_function(name).expect("missing function"))
    }

    fn const_int(func: &FunctionData, value: Value) -> U256 {
        match value {
            Value::Const(id) => match func.consts[id.index()].kind {
                ConstKind::Int(v) => v,
                ConstKind::Undef => panic!("unpatched undef argument"),
            },
            other => panic!("expected a constant, got {other:?}"),
        }
    }

    fn const_i64(func: &FunctionData, value: Value) -> i64 {
        let v = const_int(func, value);
        let low: u64 = (v & (U256::from(u64::MAX))).to();
        low as i64
    }

    fn calls_to(module: &Module, func: &FunctionData, callee: &str) -> Vec<Vec<Value>> {
        func.insts
            .iter()
            .filter_map(|inst| match &inst.kind {
                InstKind::Call { func: id, args } if module.function(*id).name == callee => {
                    Some(args.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn jump_table_has_one_case_per_jumpdest() {
        let module = compile(&[op::JUMPDEST, op::JUMPDEST, op::STOP]);
        let func = function(&module, "test");
        let switches: Vec<_> = func
            .insts
            .iter()
            .filter_map(|inst| match &inst.kind {
                InstKind::Switch { default, targets, .. } => Some((*default, targets.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(switches.len(), 1);
        let (default, targets) = &switches[0];
        assert_eq!(func.block(*default).name, "Abort");
        let cases: Vec<u64> = targets.iter().map(|(case, _)| *case).collect();
        assert_eq!(cases, vec![0, 1]);
        assert_eq!(func.block(targets[0].1).name, ".0");
        assert_eq!(func.block(targets[1].1).name, ".1");
    }

    #[test]
    fn constant_jump_is_a_direct_edge() {
        let module = compile(&[op::PUSH1, 3, op::JUMP, op::JUMPDEST, op::STOP]);
        let func = function(&module, "test");
        // No destination phi, and no branch targets the jump table.
        let table = func
            .blocks
            .iter()
            .position(|block| block.name == "JumpTable")
            .expect("jump table exists");
        for inst in &func.insts {
            match &inst.kind {
                InstKind::Phi { .. } => panic!("unexpected phi"),
                InstKind::Br { dest } => assert_ne!(dest.index(), table),
                InstKind::Brif { then_block, else_block, .. } => {
                    assert_ne!(then_block.index(), table);
                    assert_ne!(else_block.index(), table);
                }
                _ => {}
            }
        }
        // The jump still lands on the destination block.
        let dest = func
            .insts
            .iter()
            .filter_map(|inst| match &inst.kind {
                InstKind::Br { dest } => Some(*dest),
                _ => None,
            })
            .find(|dest| func.block(*dest).name == ".3");
        assert!(dest.is_some(), "direct edge to the JUMPDEST block");
    }

    #[test]
    fn dynamic_jumps_feed_the_phi() {
        let module = compile(&[
            op::PUSH1, 0, op::CALLDATALOAD, op::JUMP, op::JUMPDEST, op::PUSH1, 0,
            op::CALLDATALOAD, op::JUMP, op::JUMPDEST, op::STOP,
        ]);
        let func = function(&module, "test");
        let phis: Vec<_> = func
            .insts
            .iter()
            .filter_map(|inst| match &inst.kind {
                InstKind::Phi { incoming } => Some(incoming.len()),
                _ => None,
            })
            .collect();
        assert_eq!(phis, vec![2]);
    }

    #[test]
    fn stack_prepare_args_cover_the_block_effect() {
        let module = compile(&[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP]);
        let func = function(&module, "test");
        let calls = calls_to(&module, func, "stack.prepare");
        assert_eq!(calls.len(), 1);
        let (min, max, diff) = (
            const_i64(func, calls[0][2]),
            const_i64(func, calls[0][3]),
            const_i64(func, calls[0][4]),
        );
        assert_eq!((min, max, diff), (0, 2, 1));
        assert!(min <= 0 && 0 <= max);
        assert!(diff.abs() <= max.abs().max(min.abs()));
    }

    #[test]
    fn stack_prepare_args_on_underflowing_block() {
        let module = compile(&[op::ADD]);
        let func = function(&module, "test");
        let calls = calls_to(&module, func, "stack.prepare");
        assert_eq!(calls.len(), 1);
        let (min, max, diff) = (
            const_i64(func, calls[0][2]),
            const_i64(func, calls[0][3]),
            const_i64(func, calls[0][4]),
        );
        assert_eq!((min, max, diff), (-2, 0, -1));
    }

    #[test]
    fn block_gas_is_checked_once_up_front() {
        let module = compile(&[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP]);
        let func = function(&module, "test");
        let calls = calls_to(&module, func, "gas.check");
        assert_eq!(calls.len(), 1);
        assert_eq!(const_i64(func, calls[0][1]), 9);
    }

    #[test]
    fn zero_cost_block_has_no_gas_check() {
        let module = compile(&[op::STOP]);
        let func = function(&module, "test");
        assert!(calls_to(&module, func, "gas.check").is_empty());
    }
}

mod gas_meter {
    use super::*;
    use crate::compiler::GasMeter;
    use fvmc_backend::{Backend, Builder, Linkage, TypeMethods, U256};
    use fvmc_ir::{ConstKind, InstKind, IrBackend, Value};

    #[test]
    fn commit_cost_block_is_idempotent() {
        let mut backend = IrBackend::new();
        let i32_type = backend.type_int(32);
        let (mut bcx, _) = backend
            .build_function("f", Some(i32_type), &[], &[], Linkage::Public)
            .unwrap();
        let bool_type = bcx.type_int(1);
        bcx.declare_global(bool_type, "gas_out", 0);
        let gas_type = bcx.type_int(64);
        let ptr_type = bcx.type_ptr();
        let gas_slot = bcx.alloca(gas_type, 1, "gas");
        let jmp_buf = bcx.alloca(ptr_type, 3, "jmpbuf");

        let mut meter = GasMeter::new(&mut bcx, Revision::Frontier, gas_slot, jmp_buf);
        let call = meter.count(&mut bcx, crate::opcode::ADD).expect("opens a cost block");
        assert!(meter.count(&mut bcx, crate::opcode::MUL).is_none());
        meter.commit_cost_block(&mut bcx);
        // A second commit is a no-op.
        meter.commit_cost_block(&mut bcx);

        let zero = bcx.iconst(i32_type, 0);
        bcx.ret(Some(zero));
        drop(bcx);

        let module = backend.module();
        let func = module.function(module.get_function("f").unwrap());
        let Value::Inst(id) = call else { panic!("call is an instruction") };
        let InstKind::Call { args, .. } = &func.inst(id).kind else { panic!("patched call") };
        let Value::Const(cost) = args[1] else { panic!("cost was patched") };
        let ConstKind::Int(cost) = func.consts[cost.index()].kind else { panic!("constant cost") };
        // ADD + MUL on Frontier.
        assert_eq!(cost, U256::from(3 + 5u8));
    }

    #[test]
    fn out_of_gas_flag_is_sticky() {
        // Once raised, nothing on the abort path resets the flag; execution
        // cannot continue past the poll.
        run_test_case(&TestCase {
            bytecode: &[op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::PUSH1, 3, op::ADD, op::STOP],
            gas: 2,
            expected_return: ReturnCode::OutOfGas,
            ..Default::default()
        });
    }
}
