// Error taxonomy (§7). `GuestException` is the set of architectural faults
// that are always delivered to the guest through a vectored entry; `HostFault`
// is the set of host-internal conditions the core tries to recover from
// locally before surfacing them through the error channel.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionKind {
    ArithmeticTrap = 0,
    IllegalInstruction = 1,
    PrivilegedInstruction = 2,
    Alignment = 3,
    AccessViolation = 4,
    ReadFault = 5,
    WriteFault = 6,
    ExecuteFault = 7,
    PageFault = 8,
    IntegerOverflow = 9,
    IntegerDivide = 10,
    FpOverflow = 11,
    FpUnderflow = 12,
    FpDivide = 13,
    FpInvalid = 14,
    ReservedOperand = 15,
    MachineCheck = 16,
    BusError = 17,
    SystemCall = 18,
    Breakpoint = 19,
    Interrupt = 20,
    Halt = 21,
}

impl ExceptionKind {
    /// Fixed entry vector: 0x100 + kind * 0x80 (§7).
    pub fn entry_vector(self) -> u64 {
        0x100 + (self as u64) * 0x80
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("guest exception {kind:?} at pc={pc:#018x} (fault_address={fault_address:?})")]
pub struct GuestException {
    pub kind: ExceptionKind,
    pub pc: u64,
    pub fault_address: Option<u64>,
}

impl GuestException {
    pub fn new(kind: ExceptionKind, pc: u64) -> Self {
        Self { kind, pc, fault_address: None }
    }

    pub fn with_address(kind: ExceptionKind, pc: u64, fault_address: u64) -> Self {
        Self { kind, pc, fault_address: Some(fault_address) }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostFault {
    #[error("page-table walker failed for va={va:#018x}: {reason}")]
    TlbWalker { va: u64, reason: String },
    #[error("cache coherency timeout on cpu {source_cpu} targeting {targets:?}")]
    CacheCoherencyTimeout { source_cpu: u32, targets: Vec<u32> },
    #[error("SMP message lost: cpu {source_cpu} -> cpu {target_cpu}")]
    SmpMessageLoss { source_cpu: u32, target_cpu: u32 },
    #[error("JIT compilation failed for block at pc={pc:#018x}: {reason}")]
    JitCompile { pc: u64, reason: String },
    #[error("translation cache corruption detected for pc={pc:#018x}")]
    TranslationCacheCorruption { pc: u64 },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Guest(#[from] GuestException),
    #[error(transparent)]
    Host(#[from] HostFault),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
