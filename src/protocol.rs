//! Link-protocol dispatch: a `{type, handler, input queue}` registry
//! drained by the softirq (`spec.md` §4.2).
//!
//! Grounded on the same registry-behind-one-lock shape as
//! [`crate::device::DeviceManager`], applied to protocol handlers
//! instead of devices: `register` is append-only and rejects a
//! duplicate type, `input_handler` (called by a device's receive path)
//! copies the frame into an owned queue entry and pushes it, and
//! `drain` (called by the softirq) pops entries FIFO and invokes the
//! matching handler.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::DeviceError;

struct QueueEntry {
    dev: usize,
    data: Vec<u8>,
}

struct ProtocolEntry {
    proto_type: u16,
    handler: Box<dyn Fn(&[u8], usize) + Send>,
    queue: VecDeque<QueueEntry>,
}

/// The link-protocol registry (one instance shared by the whole stack).
pub struct ProtocolRegistry {
    entries: Mutex<Vec<ProtocolEntry>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        ProtocolRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` for `proto_type`; each link-protocol type may
    /// be registered at most once.
    pub fn register(&self, proto_type: u16, handler: impl Fn(&[u8], usize) + Send + 'static) -> Result<(), DeviceError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.proto_type == proto_type) {
            return Err(DeviceError::ProtocolTaken);
        }
        entries.push(ProtocolEntry {
            proto_type,
            handler: Box::new(handler),
            queue: VecDeque::new(),
        });
        Ok(())
    }

    /// Called by a device's receive path: queue `data` for `proto_type`
    /// on behalf of device `dev`. Unknown protocols drop silently.
    /// Returns whether the frame was queued (the caller raises the
    /// softirq only if so, matching "unknown protocols drop silently").
    pub fn input_handler(&self, proto_type: u16, data: &[u8], dev: usize) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.proto_type == proto_type) {
            Some(entry) => {
                entry.queue.push_back(QueueEntry {
                    dev,
                    data: data.to_vec(),
                });
                true
            }
            None => {
                log::trace!("dropping frame of unregistered link-protocol type {proto_type:#06x}");
                false
            }
        }
    }

    /// The softirq handler: drain every protocol's queue FIFO, calling
    /// its handler on each entry. Each entry is popped and the registry
    /// lock released before the handler runs, so a handler that itself
    /// calls `input_handler` (there are none in this stack) would not
    /// deadlock.
    pub fn drain(&self) {
        loop {
            let next = {
                let mut entries = self.entries.lock().unwrap();
                let mut found = None;
                for entry in entries.iter_mut() {
                    if let Some(item) = entry.queue.pop_front() {
                        found = Some((entry.proto_type, item));
                        break;
                    }
                }
                found
            };
            match next {
                Some((proto_type, item)) => self.call_handler(proto_type, &item.data, item.dev),
                None => break,
            }
        }
    }

    fn call_handler(&self, proto_type: u16, data: &[u8], dev: usize) {
        let entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter().find(|e| e.proto_type == proto_type) {
            (entry.handler)(data, dev);
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        ProtocolRegistry::new()
    }
}
