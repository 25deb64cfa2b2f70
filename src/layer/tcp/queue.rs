//! A pre-accept queue for listeners.
//!
//! Without a queue, a freshly established passive connection must be accepted synchronously
//! from the [`accept_ready`] callback or it is refused. The queue instead parks such
//! connections in a fixed set of slots, each with its own small receive ring. A slot becomes
//! *ready* once the connection delivers its first data; connections whose peer closes without
//! sending anything are dropped, and connections that stay silent beyond a timeout are expired
//! oldest-first. The application dequeues ready connections at its own pace.
//!
//! The queue is layered strictly on top of the public stack API: the application forwards the
//! relevant [`Events`] callbacks into it and polls it alongside the stack.
//!
//! On dequeueing a connection the application must drain the slot's already-received data and
//! then swap in its own receive buffer; the swap preserves out-of-order data that may sit past
//! the consumed prefix and returns the slot's ring for recycling via [`release_storage`].
//!
//! [`accept_ready`]: ../trait.Events.html#tymethod.accept_ready
//! [`Events`]: ../trait.Events.html
//! [`release_storage`]: struct.ListenQueue.html#method.release_storage
use crate::layer::ip::Ip4Tx;
use crate::managed::Slice;
use crate::time::{Duration, Expiration, Instant};

use super::connection::{Acceptor, ConnKey, Control, ListenerKey, ReclaimedBuffers};
use super::endpoint::TcpStack;

/// One pre-accept slot.
pub struct QueueSlot<'a> {
    key: Option<ConnKey>,
    accepted_at: Instant,
    ready: bool,
    /// The slot's receive ring storage, parked here while the slot is free.
    storage: Option<Slice<'a, u8>>,
}

impl<'a> QueueSlot<'a> {
    pub fn new(storage: Slice<'a, u8>) -> Self {
        QueueSlot {
            key: None,
            accepted_at: Instant::from_millis(0),
            ready: false,
            storage: Some(storage),
        }
    }
}

/// The queue proper.
pub struct ListenQueue<'a> {
    listener: ListenerKey,
    slots: Slice<'a, QueueSlot<'a>>,
    timeout: Duration,
}

impl<'a> ListenQueue<'a> {
    /// Create a queue serving `listener`.
    ///
    /// Each slot needs storage for its receive ring; the listener's announced initial window
    /// should not exceed the smallest slot storage.
    pub fn new(
        listener: ListenerKey,
        slots: Slice<'a, QueueSlot<'a>>,
        timeout: Duration,
    ) -> Self {
        ListenQueue { listener, slots, timeout }
    }

    /// Accept a freshly established connection into a free slot.
    ///
    /// Forwarded from [`Events::accept_ready`]. Returns whether the event belonged to this
    /// queue's listener; with no free slot the acceptor is dropped and the stack refuses the
    /// connection.
    ///
    /// [`Events::accept_ready`]: ../trait.Events.html#tymethod.accept_ready
    pub fn handle_accept_ready(
        &mut self,
        listener: ListenerKey,
        accept: Acceptor<'_, 'a>,
    ) -> bool {
        if listener != self.listener {
            return false;
        }

        let now = accept.now;
        let slot = self.slots.iter_mut()
            .find(|slot| slot.key.is_none() && slot.storage.is_some());
        let slot = match slot {
            Some(slot) => slot,
            // Queue full: dropping the acceptor refuses the connection.
            None => return true,
        };

        let storage = slot.storage.take().expect("checked above");
        match accept.accept(Slice::empty(), storage) {
            Ok(key) => {
                slot.key = Some(key);
                slot.accepted_at = now;
                slot.ready = false;
            }
            Err(_) => {
                // The storage is captive in the failed acceptance; nothing to restore.
            }
        }
        true
    }

    /// Track received data for queued connections.
    ///
    /// Forwarded from [`Events::data_received`]. Returns the control back when the connection
    /// is not queued here.
    ///
    /// [`Events::data_received`]: ../trait.Events.html#tymethod.data_received
    pub fn handle_data_received<'s>(
        &mut self,
        conn: Control<'s, 'a>,
        amount: usize,
    ) -> Option<Control<'s, 'a>> {
        let key = conn.key();
        let pos = match self.slots.iter().position(|slot| slot.key == Some(key)) {
            Some(pos) => pos,
            None => return Some(conn),
        };

        if amount == 0 && conn.recv_available() == 0 {
            // A FIN without any prior data: nothing to dispatch, drop the connection. The
            // stack completes the close by itself and the ring comes straight back.
            let reclaimed = conn.reset();
            let slot = &mut self.slots[pos];
            slot.key = None;
            slot.ready = false;
            slot.storage = reclaimed.map(|buffers| buffers.rcv);
            return None;
        }

        if amount > 0 && !self.slots[pos].ready {
            self.slots[pos].ready = true;
        }
        None
    }

    /// Reclaim the slot of a connection that ended while queued.
    ///
    /// Forwarded from [`Events::connection_aborted`]. Returns the buffers back when the
    /// connection is not queued here.
    ///
    /// [`Events::connection_aborted`]: ../trait.Events.html#tymethod.connection_aborted
    pub fn handle_aborted(
        &mut self,
        key: ConnKey,
        buffers: ReclaimedBuffers<'a>,
    ) -> Option<ReclaimedBuffers<'a>> {
        match self.slots.iter_mut().find(|slot| slot.key == Some(key)) {
            Some(slot) => {
                slot.key = None;
                slot.ready = false;
                slot.storage = Some(buffers.rcv);
                None
            }
            None => Some(buffers),
        }
    }

    /// Expire the oldest silent connections.
    pub fn poll(&mut self, now: Instant, stack: &mut TcpStack<'a>, ip: &mut dyn Ip4Tx) {
        loop {
            let expired = self.oldest(false)
                .filter(|&pos| now - self.slots[pos].accepted_at >= self.timeout);
            let pos = match expired {
                Some(pos) => pos,
                None => break,
            };

            let key = self.slots[pos].key.take().expect("occupied slot");
            let reclaimed = stack.reset(now, ip, key);
            let slot = &mut self.slots[pos];
            slot.ready = false;
            slot.storage = reclaimed.map(|buffers| buffers.rcv);
        }
    }

    /// When `poll` next has something to expire.
    pub fn next_poll_time(&self) -> Expiration {
        match self.oldest(false) {
            Some(pos) => Expiration::When(self.slots[pos].accepted_at + self.timeout),
            None => Expiration::Never,
        }
    }

    /// Dequeue the oldest ready connection.
    ///
    /// The caller must promptly drain the already-received data and replace the receive
    /// buffer (see module docs), then hand the slot storage back via `release_storage`.
    pub fn take_ready(&mut self) -> Option<ConnKey> {
        let pos = self.oldest(true)?;
        let slot = &mut self.slots[pos];
        slot.ready = false;
        slot.key.take()
    }

    /// Whether a connection is ready for `take_ready`.
    pub fn has_ready(&self) -> bool {
        self.oldest(true).is_some()
    }

    /// Return ring storage recovered from a dequeued connection to the free slots.
    pub fn release_storage(&mut self, storage: Slice<'a, u8>) {
        if let Some(slot) = self.slots.iter_mut()
            .find(|slot| slot.key.is_none() && slot.storage.is_none())
        {
            slot.storage = Some(storage);
        }
    }

    fn oldest(&self, ready: bool) -> Option<usize> {
        let mut oldest: Option<usize> = None;
        for (pos, slot) in self.slots.iter().enumerate() {
            if slot.key.is_none() || slot.ready != ready {
                continue;
            }
            match oldest {
                None => oldest = Some(pos),
                Some(best) => {
                    if slot.accepted_at < self.slots[best].accepted_at {
                        oldest = Some(pos);
                    }
                }
            }
        }
        oldest
    }
}
