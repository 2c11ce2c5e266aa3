//! Interrupt core: the single worker thread that serializes
//! device/timer/softirq/event sources into handler invocations.
//!
//! Grounded on `examples/original_source/platform/linux/intr.c`, whose
//! worker `sigwait`s on a fixed signal set (`SIGHUP` terminate,
//! `SIGUSR1` softirq, `SIGUSR2` event, `SIGALRM` 1 ms tick, plus one
//! signal per registered IRQ) and dispatches in that priority order.
//! Here the signal set becomes an [`Event`] enum and `sigwait` becomes
//! `Receiver::recv_timeout` on one `mpsc` channel; `intr_raise_irq`
//! (`pthread_kill`) becomes a channel send.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::DeviceError;

/// How often the worker wakes on its own even with nothing queued, so
/// the timer wheel keeps advancing while otherwise idle. Matches the
/// 1 ms `itimerspec` of the source's `SIGALRM` timer.
pub const TICK: Duration = Duration::from_millis(1);

/// One event delivered to the interrupt worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Terminate,
    SoftIrq,
    Application,
    TimerTick,
    Irq(u32),
}

struct IrqEntry {
    irq: u32,
    shared: bool,
    handler: Box<dyn Fn() + Send>,
}

/// Registry of IRQ handlers plus the channel used to raise events.
/// Cloning the `Sender` (via [`Intr::sender`]) is how devices and
/// application code reach the worker.
pub struct Intr {
    sender: Sender<Event>,
    irqs: Mutex<Vec<IrqEntry>>,
}

impl Intr {
    /// Build a fresh interrupt core and the receiving end of its channel.
    pub fn new() -> (Intr, Receiver<Event>) {
        let (sender, receiver) = mpsc::channel();
        (
            Intr {
                sender,
                irqs: Mutex::new(Vec::new()),
            },
            receiver,
        )
    }

    pub fn sender(&self) -> Sender<Event> {
        self.sender.clone()
    }

    /// Register a handler for `irq`. A non-shared handler may not
    /// coexist with any other handler already registered on that
    /// number, matching `intr_request_irq`'s shared-flag check.
    pub fn request_irq(
        &self,
        irq: u32,
        shared: bool,
        handler: impl Fn() + Send + 'static,
    ) -> Result<(), DeviceError> {
        let mut irqs = self.irqs.lock().unwrap();
        if let Some(existing) = irqs.iter().find(|e| e.irq == irq) {
            if !shared || !existing.shared {
                return Err(DeviceError::IrqConflict);
            }
        }
        irqs.push(IrqEntry {
            irq,
            shared,
            handler: Box::new(handler),
        });
        Ok(())
    }

    /// Deliver `irq` to the worker (analogous to `intr_raise_irq`/`pthread_kill`).
    pub fn raise_irq(&self, irq: u32) {
        let _ = self.sender.send(Event::Irq(irq));
    }

    pub fn raise_softirq(&self) {
        let _ = self.sender.send(Event::SoftIrq);
    }

    /// Wake every blocked application task (used at shutdown to
    /// broadcast `sched_interrupt` to every live PCB).
    pub fn raise_event(&self) {
        let _ = self.sender.send(Event::Application);
    }

    pub fn terminate(&self) {
        let _ = self.sender.send(Event::Terminate);
    }

    fn dispatch_irq(&self, irq: u32) {
        let irqs = self.irqs.lock().unwrap();
        for entry in irqs.iter().filter(|e| e.irq == irq) {
            (entry.handler)();
        }
    }
}

/// Handlers the worker calls for each non-IRQ event source.
pub struct Handlers {
    pub softirq: Box<dyn Fn() + Send>,
    pub timer_tick: Box<dyn Fn() + Send>,
    pub application: Box<dyn Fn() + Send>,
}

/// Spawn the worker thread: loop on `recv_timeout(TICK)`, dispatching
/// each event to its handler; a timeout is itself treated as a timer
/// tick so the wheel advances even when the channel is otherwise idle.
pub fn spawn(intr: &'static Intr, receiver: Receiver<Event>, handlers: Handlers) -> JoinHandle<()> {
    thread::Builder::new()
        .name("netstack-worker".into())
        .spawn(move || loop {
            match receiver.recv_timeout(TICK) {
                Ok(Event::Terminate) => {
                    log::debug!("interrupt worker received terminate");
                    break;
                }
                Ok(Event::SoftIrq) => (handlers.softirq)(),
                Ok(Event::Application) => (handlers.application)(),
                Ok(Event::TimerTick) => (handlers.timer_tick)(),
                Ok(Event::Irq(n)) => intr.dispatch_irq(n),
                Err(RecvTimeoutError::Timeout) => (handlers.timer_tick)(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .expect("failed to spawn interrupt worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn shared_irq_accepted_nonshared_rejected() {
        let (intr, _rx) = Intr::new();
        assert!(intr.request_irq(7, true, || {}).is_ok());
        assert!(intr.request_irq(7, true, || {}).is_ok());
        assert!(intr.request_irq(7, false, || {}).is_err());
    }

    #[test]
    fn raise_irq_invokes_registered_handler() {
        let (intr, rx) = Intr::new();
        let count = Arc::new(AtomicU32::new(0));
        let c2 = count.clone();
        intr.request_irq(3, false, move || {
            c2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        intr.raise_irq(3);
        let ev = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(ev, Event::Irq(3));
    }
}
