// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The server engine: accepts connections, maintains the routing tables,
//! and runs the listen/receive/send pipeline described at the module level.

mod threads;

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::connection::Connection;
use crate::handlers::{Registry, ServerEvent};
use crate::identifier::Identifier;
use crate::packet::{Packet, PacketPool};
use crate::threadpool::ThreadPool;

pub use crate::handlers::ServerEvent as Event;

struct ServerThreads {
    listener: JoinHandle<()>,
    receiver: JoinHandle<()>,
    sender: JoinHandle<()>,
}

pub(crate) struct ServerShared {
    pub(crate) connections: Mutex<HashMap<Identifier, Arc<Connection>>>,
    pub(crate) routing: Mutex<HashMap<Identifier, HashSet<Identifier>>>,
    pub(crate) listening: Mutex<HashMap<Identifier, HashSet<Identifier>>>,
    pub(crate) outbound: Mutex<VecDeque<Packet>>,
    pub(crate) outbound_cv: Condvar,
    pub(crate) quit: AtomicBool,
    pub(crate) pool: Arc<PacketPool>,
    pub(crate) threadpool: Arc<ThreadPool>,
    pub(crate) registry: Mutex<Registry<Server, ServerEvent>>,
    threads: Mutex<Option<ServerThreads>>,
}

impl ServerShared {
    /// Adds `claim` (an already-retained handle) to the outbound queue and
    /// wakes the sender thread. Implements the tie-break rules in full: a
    /// zero channel is never routed, and a channel whose only subscriber is
    /// the sender is left to handler dispatch instead.
    pub(crate) fn route(&self, packet: &Packet) {
        let channel = packet.channel();
        if channel.is_zero() {
            return;
        }

        let sender = packet.sender();
        let has_other_subscriber = {
            let routing = self.routing.lock().expect("routing lock poisoned");
            match routing.get(&channel) {
                Some(subs) => subs.iter().any(|s| *s != sender),
                None => false,
            }
        };

        if !has_other_subscriber {
            return;
        }

        let claim = packet.retain();
        self.outbound.lock().expect("outbound lock poisoned").push_back(claim);
        self.outbound_cv.notify_one();
    }

    /// Removes `subscriber` from every channel it listens to, and its own
    /// singleton channel along with it, restoring invariant 1.
    pub(crate) fn remove_subscriber_everywhere(&self, subscriber: Identifier) {
        let channels: Vec<Identifier> = {
            let mut listening = self.listening.lock().expect("listening lock poisoned");
            listening.remove(&subscriber).map(|s| s.into_iter().collect()).unwrap_or_default()
        };

        let mut routing = self.routing.lock().expect("routing lock poisoned");
        for channel in channels {
            if let Some(subs) = routing.get_mut(&channel) {
                subs.remove(&subscriber);
                if subs.is_empty() {
                    routing.remove(&channel);
                }
            }
        }
    }
}

/// A handle to a running (or not-yet-started) server. Cheap to clone: every
/// clone shares the same connection/routing/thread-pool state.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerShared>,
}

impl Server {
    pub(crate) fn new(pool: Arc<PacketPool>, threadpool: Arc<ThreadPool>) -> Server {
        Server {
            inner: Arc::new(ServerShared {
                connections: Mutex::new(HashMap::new()),
                routing: Mutex::new(HashMap::new()),
                listening: Mutex::new(HashMap::new()),
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

    /// Binds `port` and spawns the listener, receiver and sender threads.
    pub fn start_listen(&self, port: u16) -> io::Result<()> {
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;

        self.inner.quit.store(false, Ordering::SeqCst);

        let listener_thread = {
            let server = self.clone();
            std::thread::spawn(move || threads::listener_loop(server, listener))
        };
        let receiver_thread = {
            let server = self.clone();
            std::thread::spawn(move || threads::receiver_loop(server))
        };
        let sender_thread = {
            let server = self.clone();
            std::thread::spawn(move || threads::sender_loop(server))
        };

        *self.inner.threads.lock().expect("threads lock poisoned") = Some(ServerThreads {
            listener: listener_thread,
            receiver: receiver_thread,
            sender: sender_thread,
        });

        Ok(())
    }

    /// Signals shutdown, joins the three threads, and releases any packets
    /// still sitting in the outbound queue.
    pub fn stop_listen(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        self.inner.outbound_cv.notify_all();

        if let Some(threads) = self.inner.threads.lock().expect("threads lock poisoned").take() {
            let _ = threads.listener.join();
            let _ = threads.receiver.join();
            let _ = threads.sender.join();
        }

        let mut outbound = self.inner.outbound.lock().expect("outbound lock poisoned");
        while let Some(packet) = outbound.pop_front() {
            packet.release();
        }
    }

    /// Enqueues `packet` for delivery, applying the same routing tie-breaks
    /// the receive pipeline does, then releases the caller's reference.
    pub fn send(&self, packet: Packet) {
        self.inner.route(&packet);
        packet.release();
    }

    /// Adds `subscriber` to `channel`'s routing set. Returns `false` without
    /// changing any table if `subscriber` is not a known connection.
    pub fn subscribe(&self, channel: Identifier, subscriber: Identifier) -> bool {
        let known = self.inner.connections.lock().expect("connections lock poisoned").contains_key(&subscriber);
        if !known {
            return false;
        }

        let mut routing = self.inner.routing.lock().expect("routing lock poisoned");
        let mut listening = self.inner.listening.lock().expect("listening lock poisoned");

        routing.entry(channel).or_default().insert(subscriber);
        listening.entry(subscriber).or_default().insert(channel);
        true
    }

    /// Removes `subscriber` from `channel`, pruning either table's entry if
    /// it becomes empty.
    pub fn unsubscribe(&self, channel: Identifier, subscriber: Identifier) {
        let mut routing = self.inner.routing.lock().expect("routing lock poisoned");
        let mut listening = self.inner.listening.lock().expect("listening lock poisoned");

        if let Some(subs) = routing.get_mut(&channel) {
            subs.remove(&subscriber);
            if subs.is_empty() {
                routing.remove(&channel);
            }
        }

        if let Some(channels) = listening.get_mut(&subscriber) {
            channels.remove(&channel);
            if channels.is_empty() {
                listening.remove(&subscriber);
            }
        }
    }

    /// A snapshot of `channel`'s current subscribers.
    pub fn list_subscribers(&self, channel: Identifier) -> HashSet<Identifier> {
        self.inner
            .routing
            .lock()
            .expect("routing lock poisoned")
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Registers a handler for `code`. First registration wins.
    pub fn on_packet<F>(&self, code: u32, handler: F)
    where
        F: Fn(&Server, &Packet) -> bool + Send + Sync + 'static,
    {
        self.inner.registry.lock().expect("registry lock poisoned").on_packet(code, handler);
    }

    /// Registers a handler for `kind`. First registration wins.
    pub fn on_event<F>(&self, kind: ServerEvent, handler: F)
    where
        F: Fn(&Server, ServerEvent, Identifier) -> bool + Send + Sync + 'static,
    {
        self.inner.registry.lock().expect("registry lock poisoned").on_event(kind, handler);
    }

    /// Stops listening (if listening) and drops this handle's state.
    pub fn release(self) {
        self.stop_listen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threadpool::ThreadPool;

    fn new_test_server() -> Server {
        Server::new(Arc::new(PacketPool::new(4, 64)), Arc::new(ThreadPool::new(1, 0)))
    }

    #[test]
    fn subscribe_fails_for_unknown_subscriber() {
        let server = new_test_server();
        let channel = Identifier::random();
        let who = Identifier::random();

        assert!(!server.subscribe(channel, who));
        assert!(server.list_subscribers(channel).is_empty());
    }

    #[test]
    fn unsubscribe_prunes_empty_entries() {
        let server = new_test_server();
        let channel = Identifier::random();
        let who = Identifier::random();

        server.inner.connections.lock().unwrap();
        server.inner.routing.lock().unwrap().entry(channel).or_default().insert(who);
        server.inner.listening.lock().unwrap().entry(who).or_default().insert(channel);

        server.unsubscribe(channel, who);

        assert!(server.inner.routing.lock().unwrap().get(&channel).is_none());
        assert!(server.inner.listening.lock().unwrap().get(&who).is_none());
    }

    #[test]
    fn route_skips_zero_channel() {
        let server = new_test_server();
        let packet = server.inner.pool.acquire();
        packet.set_channel(Identifier::ZERO);

        server.inner.route(&packet);
        assert!(server.inner.outbound.lock().unwrap().is_empty());
        packet.release();
    }

    #[test]
    fn route_skips_channel_with_only_the_sender_subscribed() {
        let server = new_test_server();
        let a = Identifier::random();
        let channel = Identifier::random();

        server.inner.routing.lock().unwrap().entry(channel).or_default().insert(a);

        let packet = server.inner.pool.acquire();
        packet.set_channel(channel);
        packet.set_sender(a);

        server.inner.route(&packet);
        assert!(server.inner.outbound.lock().unwrap().is_empty());
        packet.release();
    }

    #[test]
    fn route_enqueues_when_another_subscriber_is_present() {
        let server = new_test_server();
        let a = Identifier::random();
        let b = Identifier::random();
        let channel = Identifier::random();

        server.inner.routing.lock().unwrap().entry(channel).or_default().insert(a);
        server.inner.routing.lock().unwrap().entry(channel).or_default().insert(b);

        let packet = server.inner.pool.acquire();
        packet.set_channel(channel);
        packet.set_sender(a);

        server.inner.route(&packet);
        assert_eq!(1, server.inner.outbound.lock().unwrap().len());

        let queued = server.inner.outbound.lock().unwrap().pop_front().unwrap();
        queued.release();
        packet.release();
    }
}
