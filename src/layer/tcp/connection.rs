//! User-facing connection handles and event delivery.
//!
//! The stack owns all connection state; user code holds [`ConnKey`] handles and interacts
//! through methods on [`TcpStack`] or, inside callbacks, through the [`Control`] re-borrow.
//! Events are delivered synchronously through the [`Events`] trait while an entry point
//! (receive, poll, user call) is running; a callback may legally reset the very connection it
//! is invoked for.
//!
//! [`ConnKey`]: struct.ConnKey.html
//! [`TcpStack`]: struct.TcpStack.html
//! [`Control`]: struct.Control.html
//! [`Events`]: trait.Events.html
use crate::layer::ip::{Ip4Tx, Result};
use crate::managed::Slice;
use crate::time::Instant;

use super::endpoint::TcpStack;
use super::pcb::State;

/// Handle to a connection.
///
/// Handles are generation checked: once the connection detaches from its PCB the handle goes
/// stale and all operations on it fail benignly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub(crate) idx: usize,
    pub(crate) generation: u32,
}

/// Handle to a listener slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(pub(crate) usize);

/// Ring storage handed back when a connection ends.
pub struct ReclaimedBuffers<'a> {
    pub snd: Slice<'a, u8>,
    pub rcv: Slice<'a, u8>,
}

/// Protocol events delivered to the user.
///
/// All callbacks run synchronously inside a stack entry point. A connection for which
/// `connection_aborted` was delivered receives no further callbacks.
pub trait Events<'a> {
    /// An active open completed the handshake.
    fn connection_established(&mut self, _conn: Control<'_, 'a>) {}

    /// The connection was terminated by the peer, a timeout or resource reuse.
    ///
    /// The ring storage is returned for reuse. This is the final event for the connection.
    fn connection_aborted(&mut self, key: ConnKey, buffers: ReclaimedBuffers<'a>);

    /// `amount` new bytes became readable; an `amount` of zero reports the peer's FIN.
    fn data_received(&mut self, conn: Control<'_, 'a>, amount: usize);

    /// `amount` bytes of previously queued data were acknowledged and left the send queue.
    fn data_sent(&mut self, _conn: Control<'_, 'a>, _amount: usize) {}

    /// A listener finished a handshake; accept the connection now via [`Acceptor::accept`]
    /// or it will be refused.
    ///
    /// [`Acceptor::accept`]: struct.Acceptor.html#method.accept
    fn accept_ready(&mut self, listener: ListenerKey, accept: Acceptor<'_, 'a>);
}

/// Re-borrow of the stack scoped to one connection, as passed into callbacks.
pub struct Control<'s, 'a> {
    pub(crate) stack: &'s mut TcpStack<'a>,
    pub(crate) ip: &'s mut dyn Ip4Tx,
    pub(crate) now: Instant,
    pub(crate) key: ConnKey,
}

impl<'s, 'a> Control<'s, 'a> {
    /// The handle of the connection this control refers to.
    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn state(&self) -> Option<State> {
        self.stack.state_of(self.key)
    }

    /// Queue data for sending; returns the amount that fit the send buffer.
    pub fn send(&mut self, data: &[u8]) -> usize {
        self.stack.send(self.now, &mut *self.ip, self.key, data)
    }

    /// Request the PSH flag up to the end of the currently queued data and expedite output.
    pub fn push(&mut self) {
        self.stack.push(self.now, &mut *self.ip, self.key)
    }

    /// Close the sending side; queues a FIN after all pending data.
    pub fn shutdown_send(&mut self) {
        self.stack.shutdown_send(self.now, &mut *self.ip, self.key)
    }

    /// Drain received data into `out`; returns the amount read.
    pub fn recv(&mut self, out: &mut [u8]) -> usize {
        self.stack.recv(self.now, &mut *self.ip, self.key, out)
    }

    /// Bytes currently queued and readable.
    pub fn recv_available(&self) -> usize {
        self.stack.recv_available(self.key)
    }

    /// Replace the receive buffer storage, carrying over unread and out-of-order data.
    ///
    /// Returns the old storage, or `Err` with the new storage when it is too small to hold the
    /// currently occupied region.
    pub fn set_recv_buf(&mut self, storage: Slice<'a, u8>)
        -> core::result::Result<Slice<'a, u8>, Slice<'a, u8>>
    {
        self.stack.set_recv_buf(self.now, &mut *self.ip, self.key, storage)
    }

    /// Override the window update suppression threshold for this connection.
    pub fn set_window_update_threshold(&mut self, threshold: u32) {
        self.stack.set_window_update_threshold(self.key, threshold)
    }

    /// Drop interest in the connection.
    ///
    /// The receive storage is always handed back. When queued data or a FIN remains to flush
    /// the stack keeps the PCB alive and drains it on its own, and the send storage (empty in
    /// the returned pair) is recovered only by drop. No further callbacks are delivered
    /// either way.
    pub fn reset(self) -> Option<ReclaimedBuffers<'a>> {
        self.stack.reset(self.now, self.ip, self.key)
    }
}

/// One-shot acceptance of a freshly established passive connection.
pub struct Acceptor<'s, 'a> {
    pub(crate) stack: &'s mut TcpStack<'a>,
    pub(crate) ip: &'s mut dyn Ip4Tx,
    pub(crate) now: Instant,
    pub(crate) listener: ListenerKey,
}

impl<'s, 'a> Acceptor<'s, 'a> {
    /// Take ownership of the pending connection, providing its ring storage.
    pub fn accept(self, snd_storage: Slice<'a, u8>, rcv_storage: Slice<'a, u8>)
        -> Result<ConnKey>
    {
        self.stack.accept_pending(self.now, self.ip, self.listener, snd_storage, rcv_storage)
    }
}
