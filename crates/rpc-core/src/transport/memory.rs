//! In-process transport.
//!
//! [`MemoryChannel`] records every frame sent through it and lets its owner
//! fire `open` and `message` by hand. Two channels can be linked so that a
//! frame sent on one arrives as a message on the other; [`MemoryAcceptor`]
//! hands out such links to a [`crate::Server`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::{Acceptor, Channel, ConnectionCallback, MessageCallback, OpenCallback};
use crate::error::TransportError;
use crate::events::lock;

pub struct MemoryChannel {
    sent: Mutex<Vec<String>>,
    open: AtomicBool,
    closed: AtomicBool,
    open_callbacks: Mutex<Vec<OpenCallback>>,
    message_callbacks: Mutex<Vec<MessageCallback>>,
    peer: Mutex<Weak<MemoryChannel>>,
    inbox: Mutex<VecDeque<String>>,
    delivering: AtomicBool,
}

impl MemoryChannel {
    /// A detached channel that is not yet open.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            open_callbacks: Mutex::new(Vec::new()),
            message_callbacks: Mutex::new(Vec::new()),
            peer: Mutex::new(Weak::new()),
            inbox: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
        })
    }

    /// Two open channels wired to each other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        *lock(&a.peer) = Arc::downgrade(&b);
        *lock(&b.peer) = Arc::downgrade(&a);
        a.open();
        b.open();
        (a, b)
    }

    /// Fire the "open" event.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let callbacks: Vec<OpenCallback> = lock(&self.open_callbacks).clone();
        for callback in &callbacks {
            callback();
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Mark the channel closed; later sends fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver an inbound frame to the "message" subscribers.
    ///
    /// Frames that arrive while a delivery is already running on this channel
    /// (a handler replying synchronously) are queued and delivered in order
    /// once the running one returns.
    pub fn receive(&self, message: impl Into<String>) {
        lock(&self.inbox).push_back(message.into());
        if self.delivering.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let next = lock(&self.inbox).pop_front();
            let Some(message) = next else {
                self.delivering.store(false, Ordering::SeqCst);
                // A frame may have been queued between the pop and the store.
                if lock(&self.inbox).is_empty() || self.delivering.swap(true, Ordering::SeqCst) {
                    return;
                }
                continue;
            };
            let callbacks: Vec<MessageCallback> = lock(&self.message_callbacks).clone();
            for callback in &callbacks {
                callback(message.clone());
            }
        }
    }

    /// Every frame sent so far, oldest first.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn last_sent(&self) -> Option<String> {
        lock(&self.sent).last().cloned()
    }

    /// Drain the record of sent frames.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.sent))
    }
}

impl Channel for MemoryChannel {
    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        lock(&self.sent).push(message.clone());
        let peer = lock(&self.peer).upgrade();
        if let Some(peer) = peer {
            peer.receive(message);
        }
        Ok(())
    }

    fn on_open(&self, callback: OpenCallback) {
        lock(&self.open_callbacks).push(callback.clone());
        if self.is_open() {
            callback();
        }
    }

    fn on_message(&self, callback: MessageCallback) {
        lock(&self.message_callbacks).push(callback);
    }
}

/// Acceptor handing out [`MemoryChannel`]s.
pub struct MemoryAcceptor {
    connection_callbacks: Mutex<Vec<ConnectionCallback>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    enumerable: bool,
}

impl MemoryAcceptor {
    /// An acceptor that can enumerate its connected channels.
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// An acceptor without enumeration; broadcast is unsupported.
    pub fn without_enumeration() -> Arc<Self> {
        Self::build(false)
    }

    fn build(enumerable: bool) -> Arc<Self> {
        Arc::new(Self {
            connection_callbacks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            enumerable,
        })
    }

    /// Register `channel` as connected and fire "connection".
    pub fn accept(&self, channel: Arc<MemoryChannel>) {
        lock(&self.channels).push(channel.clone());
        let callbacks: Vec<ConnectionCallback> = lock(&self.connection_callbacks).clone();
        for callback in &callbacks {
            callback(channel.clone());
        }
    }

    /// Accept a fresh, unlinked channel and return it.
    pub fn connect(&self) -> Arc<MemoryChannel> {
        let channel = MemoryChannel::new();
        channel.open();
        self.accept(channel.clone());
        channel
    }

    /// Accept the server half of a linked pair and return the client half.
    pub fn connect_pair(&self) -> Arc<MemoryChannel> {
        let (client_side, server_side) = MemoryChannel::pair();
        self.accept(server_side);
        client_side
    }

    /// Close `channel` and forget it.
    pub fn disconnect(&self, channel: &Arc<MemoryChannel>) {
        channel.close();
        lock(&self.channels).retain(|c| !Arc::ptr_eq(c, channel));
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.channels).len()
    }
}

impl Acceptor for MemoryAcceptor {
    fn on_connection(&self, callback: ConnectionCallback) {
        lock(&self.connection_callbacks).push(callback);
    }

    fn clients(&self) -> Option<Vec<Arc<dyn Channel>>> {
        if !self.enumerable {
            return None;
        }
        Some(
            lock(&self.channels)
                .iter()
                .map(|c| c.clone() as Arc<dyn Channel>)
                .collect(),
        )
    }
}
