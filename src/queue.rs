//! Three-lane outgoing dispatch queue.
//!
//! High, standard, and low lanes feed a single consumer. Ordering across
//! lanes is deliberately weak: the consumer takes whichever lane has an
//! item ready first, with no strict high-over-low precedence under
//! contention. Within a lane, FIFO holds. Shutdown is signalled with a
//! sentinel so the consumer can distinguish "stop" from "momentarily
//! empty", and whatever is still queued afterwards can be drained and
//! failed by the owner.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::config::Priority;

enum Slot<T> {
    Item(T),
    Shutdown,
}

struct Senders<T> {
    high: mpsc::UnboundedSender<Slot<T>>,
    standard: mpsc::UnboundedSender<Slot<T>>,
    low: mpsc::UnboundedSender<Slot<T>>,
}

/// Consumer half; owned by one worker at a time.
pub struct DispatchReceiver<T> {
    high: mpsc::UnboundedReceiver<Slot<T>>,
    standard: mpsc::UnboundedReceiver<Slot<T>>,
    low: mpsc::UnboundedReceiver<Slot<T>>,
}

impl<T> DispatchReceiver<T> {
    /// Take the next item from whichever lane is ready first.
    ///
    /// Returns `None` on the shutdown sentinel (or when all senders are
    /// gone).
    pub async fn recv(&mut self) -> Option<T> {
        // Unbiased select keeps the weak first-ready-wins ordering.
        let slot = tokio::select! {
            slot = self.high.recv() => slot,
            slot = self.standard.recv() => slot,
            slot = self.low.recv() => slot,
        };
        match slot {
            Some(Slot::Item(item)) => Some(item),
            Some(Slot::Shutdown) | None => None,
        }
    }

    /// Pull everything still queued, in lane order. Used after shutdown to
    /// fail leftovers.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        for lane in [&mut self.high, &mut self.standard, &mut self.low] {
            while let Ok(slot) = lane.try_recv() {
                if let Slot::Item(item) = slot {
                    items.push(item);
                }
            }
        }
        items
    }
}

/// Producer side plus lifecycle management.
pub struct DispatchQueue<T> {
    senders: Mutex<Senders<T>>,
    receiver: Mutex<Option<DispatchReceiver<T>>>,
}

impl<T> DispatchQueue<T> {
    /// Fresh queue with its receiver parked inside.
    pub fn new() -> Self {
        let (senders, receiver) = Self::channels();
        Self {
            senders: Mutex::new(senders),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    fn channels() -> (Senders<T>, DispatchReceiver<T>) {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (standard_tx, standard_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        (
            Senders {
                high: high_tx,
                standard: standard_tx,
                low: low_tx,
            },
            DispatchReceiver {
                high: high_rx,
                standard: standard_rx,
                low: low_rx,
            },
        )
    }

    /// Enqueue at the given priority. Returns the item back if the
    /// receiver is gone.
    pub fn enqueue(&self, priority: Priority, item: T) -> Result<(), T> {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let sender = match priority {
            Priority::High => &senders.high,
            Priority::Standard => &senders.standard,
            Priority::Low => &senders.low,
        };
        sender.send(Slot::Item(item)).map_err(|err| match err.0 {
            Slot::Item(item) => item,
            Slot::Shutdown => unreachable!("shutdown slots are only sent by shutdown()"),
        })
    }

    /// Send the shutdown sentinel down every lane.
    pub fn shutdown(&self) {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = senders.high.send(Slot::Shutdown);
        let _ = senders.standard.send(Slot::Shutdown);
        let _ = senders.low.send(Slot::Shutdown);
    }

    /// Hand the receiver to a worker. `None` if a worker already took it
    /// and no [`DispatchQueue::reset`] happened since.
    pub fn take_receiver(&self) -> Option<DispatchReceiver<T>> {
        self.receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Replace the channels, discarding anything still queued. Items from
    /// the previous life cannot leak into the next connection.
    pub fn reset(&self) {
        let (senders, receiver) = Self::channels();
        *self
            .senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = senders;
        *self
            .receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(receiver);
    }
}

impl<T> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for DispatchQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue").finish_non_exhaustive()
    }
}
