// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The client engine: a single long-lived connection to a server, with a
//! sender and a receiver thread mirroring the server's pipeline.

mod threads;

use std::collections::VecDeque;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::connection::Connection;
use crate::handlers::{ClientEvent, Registry};
use crate::identifier::Identifier;
use crate::packet::{Packet, PacketPool};
use crate::threadpool::ThreadPool;
use crate::wire;

pub use crate::handlers::ClientEvent as Event;

struct ClientThreads {
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

pub(crate) struct ClientShared {
    pub(crate) id: Identifier,
    pub(crate) connection: Mutex<Option<Arc<Connection>>>,
    pub(crate) outbound: Mutex<VecDeque<Packet>>,
    pub(crate) outbound_cv: Condvar,
    pub(crate) quit: AtomicBool,
    pub(crate) pool: Arc<PacketPool>,
    pub(crate) threadpool: Arc<ThreadPool>,
    pub(crate) registry: Mutex<Registry<Client, ClientEvent>>,
    threads: Mutex<Option<ClientThreads>>,
}

/// A handle to a client connection. Cheap to clone: every clone shares the
/// same connection and thread-pool state.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientShared>,
}

impl Client {
    pub(crate) fn new(id: Identifier, pool: Arc<PacketPool>, threadpool: Arc<ThreadPool>) -> Client {
        Client {
            inner: Arc::new(ClientShared {
                id,
                connection: Mutex::new(None),
                outbound: Mutex::new(VecDeque::new()),
                outbound_cv: Condvar::new(),
                quit: AtomicBool::new(false),
                pool,
                threadpool,
                registry: Mutex::new(Registry::new()),
                threads: Mutex::new(None),
            }),
        }
    }

    /// This client's own identifier, sent as the handshake on connect.
    pub fn id(&self) -> Identifier {
        self.inner.id
    }

    /// Connects to `addr`, writes the handshake, and spawns the sender and
    /// receiver threads. Fires [`ClientEvent::Connected`] synchronously
    /// before returning. `host` is resolved the way `std::net::ToSocketAddrs`
    /// resolves any `(host, port)` pair: a dotted-quad is used directly,
    /// anything else goes through name resolution.
    pub fn connect(&self, host: &str, port: u16) -> io::Result<()> {
        let mut stream = TcpStream::connect((host, port))?;
        wire::write_handshake(&mut stream, &self.inner.id)?;

        let connection = Arc::new(Connection::new(self.inner.id, stream)?);
        *self.inner.connection.lock().expect("connection lock poisoned") = Some(connection);

        self.inner.quit.store(false, Ordering::SeqCst);

        let sender_thread = {
            let client = self.clone();
            std::thread::spawn(move || threads::sender_loop(client))
        };
        let receiver_thread = {
            let client = self.clone();
            std::thread::spawn(move || threads::receiver_loop(client))
        };

        *self.inner.threads.lock().expect("threads lock poisoned") =
            Some(ClientThreads { sender: sender_thread, receiver: receiver_thread });

        let handler = self.inner.registry.lock().expect("registry lock poisoned").event_handler(ClientEvent::Connected);
        if let Some(handler) = handler {
            handler(self, ClientEvent::Connected, self.inner.id);
        }

        Ok(())
    }

    /// True while a connection is established.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().expect("connection lock poisoned").is_some()
    }

    /// Signals shutdown, joins both threads, drops the connection, and
    /// releases any packets still sitting in the outbound queue.
    pub fn disconnect(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        self.inner.outbound_cv.notify_all();

        if let Some(threads) = self.inner.threads.lock().expect("threads lock poisoned").take() {
            let _ = threads.sender.join();
            let _ = threads.receiver.join();
        }

        *self.inner.connection.lock().expect("connection lock poisoned") = None;

        let mut outbound = self.inner.outbound.lock().expect("outbound lock poisoned");
        while let Some(packet) = outbound.pop_front() {
            packet.release();
        }
    }

    /// Stamps the local identity as sender, enqueues `packet` for delivery,
    /// and releases the caller's reference.
    pub fn send(&self, packet: Packet) {
        packet.set_sender(self.inner.id);
        let claim = packet.retain();
        self.inner.outbound.lock().expect("outbound lock poisoned").push_back(claim);
        self.inner.outbound_cv.notify_one();
        packet.release();
    }

    /// Registers a handler for `code`. First registration wins.
    pub fn on_packet<F>(&self, code: u32, handler: F)
    where
        F: Fn(&Client, &Packet) -> bool + Send + Sync + 'static,
    {
        self.inner.registry.lock().expect("registry lock poisoned").on_packet(code, handler);
    }

    /// Registers a handler for `kind`. First registration wins.
    pub fn on_event<F>(&self, kind: ClientEvent, handler: F)
    where
        F: Fn(&Client, ClientEvent, Identifier) -> bool + Send + Sync + 'static,
    {
        self.inner.registry.lock().expect("registry lock poisoned").on_event(kind, handler);
    }

    /// Disconnects (if connected) and drops this handle's state.
    pub fn release(self) {
        self.disconnect();
    }
}
