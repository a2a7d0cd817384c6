//! Event center: maps the 29 hardware event IDs to the work that has to run
//! when the GPU raises them.

use crate::error::{N2dError, N2dResult};
use crate::kernel::os::Signal;
use crate::kernel::regs::{EVENT_COUNT, EVENT_MASK};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Work attached to an event.
pub enum EventAction {
    /// Set a user or kernel signal.
    Signal(Arc<Signal>),
    /// Deferred kernel work, e.g. an unmap that must wait for the GPU.
    Callback(Box<dyn FnOnce() + Send>),
}

impl EventAction {
    fn run(self) {
        match self {
            Self::Signal(signal) => signal.signal(true),
            Self::Callback(f) => f(),
        }
    }
}

impl std::fmt::Debug for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(s) => f.debug_tuple("Signal").field(s).finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug)]
struct Slots {
    /// `Some` while the slot is armed (or its actions are still running).
    queues: Vec<Option<Vec<EventAction>>>,
    last: usize,
}

impl Slots {
    fn find_free(&self) -> Option<usize> {
        (1..=EVENT_COUNT)
            .map(|step| (self.last + step) % EVENT_COUNT)
            .find(|&id| self.queues[id].is_none())
    }
}

/// Pending action list plus the per-ID chains.
///
/// `pending` is the producer lock taken by `add`; `slots` is the event-id
/// lock serialising `submit` against completion.
#[derive(Debug)]
pub struct EventCenter {
    pending: Mutex<Vec<EventAction>>,
    slots: Mutex<Slots>,
    raised: AtomicU32,
}

impl Default for EventCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCenter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            slots: Mutex::new(Slots {
                queues: (0..EVENT_COUNT).map(|_| None).collect(),
                last: EVENT_COUNT - 1,
            }),
            raised: AtomicU32::new(0),
        }
    }

    /// Queues an action for the next submitted event.
    pub fn add(&self, action: EventAction) {
        self.pending.lock().push(action);
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Number of armed event IDs.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots.lock().queues.iter().filter(|q| q.is_some()).count()
    }

    /// Moves the pending actions onto a free event ID and returns it.
    ///
    /// Retries `wait` times, 1 ms apart, while every ID is busy. Returns
    /// `None` when there is nothing to submit.
    ///
    /// # Errors
    /// `OutOfResources` when no ID frees up in time.
    pub fn submit(&self, wait: u32) -> N2dResult<Option<u32>> {
        let mut slots = self.slots.lock();
        if !self.has_pending() {
            return Ok(None);
        }

        let mut retries = 0;
        let id = loop {
            if let Some(id) = slots.find_free() {
                break id;
            }
            if retries >= wait {
                log::warn!("event: all {EVENT_COUNT} IDs busy");
                return Err(N2dError::OutOfResources);
            }
            retries += 1;
            MutexGuard::unlocked(&mut slots, || std::thread::sleep(SUBMIT_RETRY_DELAY));
        };

        let actions = std::mem::take(&mut *self.pending.lock());
        log::trace!("event: {} actions on ID {id}", actions.len());
        slots.queues[id] = Some(actions);
        slots.last = id;
        Ok(Some(id as u32))
    }

    /// Records raised event bits; called from interrupt context.
    pub fn raise(&self, bits: u32) {
        self.raised.fetch_or(bits & EVENT_MASK, Ordering::AcqRel);
    }

    /// Completes `bits` and anything raised while running. Returns the number
    /// of events completed.
    pub fn notify(&self, bits: u32) -> usize {
        self.raise(bits);
        let mut completed = 0;

        loop {
            let bits = self.raised.swap(0, Ordering::AcqRel);
            if bits == 0 {
                break;
            }
            for id in (0..EVENT_COUNT).filter(|id| bits & (1 << id) != 0) {
                if self.complete(id) {
                    completed += 1;
                } else {
                    log::warn!("event: ID {id} raised while idle");
                }
            }
        }

        completed
    }

    fn complete(&self, id: usize) -> bool {
        let actions = {
            let mut slots = self.slots.lock();
            match slots.queues[id].as_mut() {
                Some(queue) => std::mem::take(queue),
                None => return false,
            }
        };

        for action in actions {
            action.run();
        }

        self.slots.lock().queues[id] = None;
        true
    }

    /// Releases an armed ID whose marker never reached the ring, running its
    /// actions.
    pub fn cancel(&self, id: u32) {
        if (id as usize) < EVENT_COUNT && !self.complete(id as usize) {
            log::warn!("event: cancel of idle ID {id}");
        }
    }

    /// Runs every armed and pending action. Returns the number of actions run.
    pub fn drain(&self) -> usize {
        let mut actions = Vec::new();
        {
            let mut slots = self.slots.lock();
            for queue in &mut slots.queues {
                if let Some(q) = queue.take() {
                    actions.extend(q);
                }
            }
            actions.append(&mut self.pending.lock());
        }
        self.raised.store(0, Ordering::Release);

        let count = actions.len();
        for action in actions {
            action.run();
        }
        if count > 0 {
            log::info!("event: drained {count} actions");
        }
        count
    }
}
