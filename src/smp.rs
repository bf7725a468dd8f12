// SMP manager (§4.6/§4.7/§6, layer L7). Owns the CPU set by id (breaking the
// CPU<->memory<->cache<->CPU ownership cycle per the arena+index design note
// in spec.md §9) and routes IPIs, barrier acknowledgements, and TLB
// shootdown requests between per-CPU mailboxes.

use crate::error::{CoreError, CoreResult, HostFault};
use crate::external::{SmpCollaborator, SmpMessage, SmpPayload};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;

struct Mailbox {
    tx: Sender<SmpMessage>,
    rx: Receiver<SmpMessage>,
    ack_tx: Sender<u64>,
    ack_rx: Receiver<u64>,
}

pub struct SmpManager {
    this_cpu: u32,
    mailboxes: HashMap<u32, Mailbox>,
}

impl SmpManager {
    pub fn new(cpu_ids: &[u32]) -> Self {
        let mut mailboxes = HashMap::new();
        for &id in cpu_ids {
            let (tx, rx) = crossbeam_channel::bounded(256);
            let (ack_tx, ack_rx) = crossbeam_channel::bounded(256);
            mailboxes.insert(id, Mailbox { tx, rx, ack_tx, ack_rx });
        }
        Self { this_cpu: cpu_ids.first().copied().unwrap_or(0), mailboxes }
    }

    /// Creates a view of this manager scoped to `cpu_id`, the handle passed
    /// to that CPU's barrier coordinator and cache coherency machinery.
    pub fn view(self: &Arc<Self>, cpu_id: u32) -> CpuView {
        CpuView { manager: Arc::clone(self), cpu_id }
    }

    pub fn ack_receiver(&self, cpu_id: u32) -> Option<Receiver<u64>> {
        self.mailboxes.get(&cpu_id).map(|m| m.ack_rx.clone())
    }

    pub fn inbox(&self, cpu_id: u32) -> Option<Receiver<SmpMessage>> {
        self.mailboxes.get(&cpu_id).map(|m| m.rx.clone())
    }

    /// Drains every pending message for `cpu_id`. A barrier request
    /// immediately posts the acknowledgement back to every mailbox's ack
    /// channel, modelling an IPI handler that always completes (peers never
    /// independently time out in this model; the originator is the only side
    /// with a bounded wait). An Invalidate message (posted by a peer's
    /// `Cpu::propagate_coherency`) is handed to `on_invalidate`, which the
    /// caller wires to `cpu_id`'s own `CpuMemoryPort::observe_peer_invalidate`.
    pub fn pump(&self, cpu_id: u32, mut on_invalidate: impl FnMut(u64)) -> CoreResult<()> {
        let mailbox = self.mailboxes.get(&cpu_id).ok_or_else(|| {
            CoreError::Host(HostFault::SmpMessageLoss { source_cpu: cpu_id, target_cpu: cpu_id })
        })?;
        while let Ok(msg) = mailbox.rx.try_recv() {
            match msg.payload {
                SmpPayload::BarrierRequest { sequence, .. } => {
                    for other in self.mailboxes.values() {
                        let _ = other.ack_tx.try_send(sequence);
                    }
                }
                SmpPayload::Invalidate { pa } => on_invalidate(pa),
                _ => {}
            }
        }
        Ok(())
    }
}

impl SmpCollaborator for SmpManager {
    fn broadcast(&self, sender: u32, msg: SmpMessage, targets: &[u32]) -> CoreResult<()> {
        for &t in targets {
            self.send(sender, t, msg.clone())?;
        }
        Ok(())
    }

    fn send(&self, sender: u32, target: u32, msg: SmpMessage) -> CoreResult<()> {
        let mailbox = self
            .mailboxes
            .get(&target)
            .ok_or(HostFault::SmpMessageLoss { source_cpu: sender, target_cpu: target })?;
        mailbox
            .tx
            .try_send(msg)
            .map_err(|_| HostFault::SmpMessageLoss { source_cpu: sender, target_cpu: target }.into())
    }

    fn cpu_count(&self) -> usize {
        self.mailboxes.len()
    }

    fn this_cpu_id(&self) -> u32 {
        self.this_cpu
    }
}

/// A per-CPU scoped handle into the shared `SmpManager`, given to exactly
/// one CPU's barrier coordinator / coherency machinery.
pub struct CpuView {
    manager: Arc<SmpManager>,
    cpu_id: u32,
}

impl CpuView {
    pub fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    pub fn ack_receiver(&self) -> Receiver<u64> {
        self.manager.ack_receiver(self.cpu_id).expect("cpu registered at construction")
    }

    pub fn collaborator(&self) -> &dyn SmpCollaborator {
        self.manager.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_then_pump_acks_every_target() {
        let manager = Arc::new(SmpManager::new(&[0, 1, 2]));
        let ack_rx = manager.ack_receiver(0).unwrap();
        manager
            .broadcast(0, SmpMessage { payload: SmpPayload::BarrierRequest { sequence: 7, kind: crate::barrier::BarrierType::Mb } }, &[1, 2])
            .unwrap();
        manager.pump(1, |_| {}).unwrap();
        assert_eq!(ack_rx.recv().unwrap(), 7);
    }

    #[test]
    fn pump_routes_invalidate_payloads_to_the_callback() {
        let manager = SmpManager::new(&[0, 1]);
        manager.send(0, 1, SmpMessage { payload: SmpPayload::Invalidate { pa: 0x4000 } }).unwrap();

        let mut seen = Vec::new();
        manager.pump(1, |pa| seen.push(pa)).unwrap();

        assert_eq!(seen, vec![0x4000]);
    }

    #[test]
    fn send_to_unknown_cpu_is_smp_message_loss() {
        let manager = SmpManager::new(&[0]);
        let err = manager.send(0, 99, SmpMessage { payload: SmpPayload::Invalidate { pa: 0 } });
        assert!(err.is_err());
    }
}
