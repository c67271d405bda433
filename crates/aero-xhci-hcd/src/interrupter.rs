//! Interrupt service thread for one event ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::error::{Result, XhciError};
use crate::event_ring::EventRing;

/// A hardware interrupt line the service thread can block on.
pub trait InterruptObject: Send + Sync {
    /// Blocks until the interrupt fires. Returns an error once the object has been destroyed.
    fn wait(&self) -> Result<()>;

    /// Re-enables delivery after the interrupt has been serviced.
    fn ack(&self);

    /// Wakes any waiter with an error and makes every later `wait` fail.
    fn destroy(&self);
}

/// Binds one interrupt object to one event ring and services it on a dedicated thread.
pub struct Interrupter {
    index: u16,
    event_ring: Arc<EventRing>,
    irq: Arc<dyn InterruptObject>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Interrupter {
    pub fn new(index: u16, event_ring: Arc<EventRing>, irq: Arc<dyn InterruptObject>) -> Self {
        Self {
            index,
            event_ring,
            irq,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn event_ring(&self) -> &Arc<EventRing> {
        &self.event_ring
    }

    pub fn is_running(&self) -> bool {
        match self.thread.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Spawns the service thread: wait, drain events, re-arm `IMAN`, acknowledge, repeat.
    pub fn start(&self) -> Result<()> {
        let mut thread = match self.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if thread.is_some() {
            return Err(XhciError::AlreadyInitialized);
        }
        self.shutdown.store(false, Ordering::Release);

        let index = self.index;
        let event_ring = Arc::clone(&self.event_ring);
        let irq = Arc::clone(&self.irq);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name(format!("xhci-irq-{index}"))
            .spawn(move || service(index, &event_ring, irq.as_ref(), &shutdown))
            .map_err(|_| XhciError::OutOfMemory)?;
        *thread = Some(handle);
        debug!(interrupter = index, "interrupter started");
        Ok(())
    }

    /// Stops the service thread and waits for it to exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.irq.destroy();
        let handle = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(interrupter = self.index, "interrupter thread panicked");
            }
        }
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn service(index: u16, event_ring: &EventRing, irq: &dyn InterruptObject, shutdown: &AtomicBool) {
    let mmio = event_ring.mmio();
    let regs = event_ring.interrupter();
    loop {
        if let Err(err) = irq.wait() {
            debug!(interrupter = index, %err, "interrupt wait ended");
            break;
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let drained = event_ring.handle_irq();
        regs.rearm(mmio.as_ref());
        irq.ack();
        trace!(interrupter = index, drained, "interrupt serviced");
    }
    event_ring.host_controller().interrupter_exited(index);
}
