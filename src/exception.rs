// Exception/trap exit (§6, §7, expanded in SPEC_FULL §4.11). Guest
// exceptions are always delivered through this channel after the CPU saves
// its register file and switches to kernel mode; host-internal faults are
// recovered locally where possible and otherwise reported here too.

use crate::error::ExceptionKind;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub cpu_id: u32,
    pub kind: ExceptionKind,
    pub pc: u64,
    pub fault_address: Option<u64>,
}

type Callback = Box<dyn Fn(&ExceptionEvent) + Send + Sync>;

pub struct ExceptionChannel {
    tx: Sender<ExceptionEvent>,
    rx: Receiver<ExceptionEvent>,
    callbacks: Mutex<HashMap<ExceptionKind, Vec<Callback>>>,
}

impl ExceptionChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, callbacks: Mutex::new(HashMap::new()) }
    }

    pub fn sender(&self) -> Sender<ExceptionEvent> {
        self.tx.clone()
    }

    pub fn raise(&self, event: ExceptionEvent) {
        log::debug!("guest exception {:?} at pc={:#018x} on cpu {}", event.kind, event.pc, event.cpu_id);
        let _ = self.tx.try_send(event);
    }

    /// Registers a per-kind callback, invoked from `dispatch_pending` on the
    /// consuming thread (§6 "The handler may register per-kind callbacks").
    pub fn register<F>(&self, kind: ExceptionKind, callback: F)
    where
        F: Fn(&ExceptionEvent) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().entry(kind).or_default().push(Box::new(callback));
    }

    /// Drains pending events and invokes registered callbacks for each.
    pub fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        while let Ok(event) = self.rx.try_recv() {
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(handlers) = callbacks.get(&event.kind) {
                for handler in handlers {
                    handler(&event);
                }
            }
            dispatched += 1;
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn registered_callback_fires_on_dispatch() {
        let channel = ExceptionChannel::new(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        channel.register(ExceptionKind::PageFault, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        channel.raise(ExceptionEvent { cpu_id: 0, kind: ExceptionKind::PageFault, pc: 0x400, fault_address: Some(0x1000) });
        assert_eq!(channel.dispatch_pending(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
