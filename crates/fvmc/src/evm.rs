//! Host-facing VM definitions: revisions, return codes and the sub-call ABI.

/// A named milestone of the VM specification.
///
/// Gates instruction availability and gas pricing; all feature tests are
/// simple `revision >= level` comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Revision {
    Frontier,
    Homestead,
    TangerineWhistle,
    SpuriousDragon,
    Byzantium,
    Aion,
    AionV1,
}

/// The result of an `execute` call, as returned to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    Stop = 0,
    Return = 1,
    Revert = 2,
    OutOfGas = 3,
}

/// Sub-call kind passed to `ext.call`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CallKind {
    Call = 0,
    CallCode = 1,
    DelegateCall = 2,
    StaticCall = 3,
}

/// Magic added by the host to the remaining gas of a failed sub-call or
/// create, making the result negative. Subtracting it back recovers the gas.
pub const EVM_CALL_FAILURE: i64 = i64::MIN;
