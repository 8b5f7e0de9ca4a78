// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! An embeddable publish/subscribe packet broker over long-lived TCP
//! connections.
//!
//! A process calls [`initialize`] once to size a shared packet pool and
//! worker thread pool, then builds any number of [`server::Server`] and
//! [`client::Client`] handles from [`new_server`] and [`new_client`]. Both
//! sides exchange fixed-layout framed packets ([`packet::Packet`]) identified
//! by a 128-bit [`identifier::Identifier`] and routed by channel.

mod codes;
mod connection;
mod error;
mod handlers;
mod identifier;
mod io_util;
mod packet;
mod threadpool;
mod wire;

pub mod client;
pub mod server;

pub use client::Client;
pub use codes::{fourcc, HELO, HIYA, JOIN, PING, QUIT, TEXT};
pub use handlers::{ClientEvent, ServerEvent};
pub use identifier::Identifier;
pub use packet::Packet;
pub use server::Server;

use std::sync::{Arc, OnceLock};

use packet::PacketPool;
use threadpool::ThreadPool;

struct Globals {
    pool: Arc<PacketPool>,
    threadpool: Arc<ThreadPool>,
}

static GLOBALS: OnceLock<Globals> = OnceLock::new();

/// Sizes the process-wide packet pool and worker thread pool. Idempotent:
/// later calls are ignored and return `false` once a prior call has already
/// taken effect.
///
/// `idle_count` packets of `idle_size` bytes are pre-allocated. The worker
/// pool has `threads_per_core * max(1, available_parallelism + core_count_adjustment)`
/// threads, used for dispatching registered packet and event handlers off
/// the engines' own receiver threads.
pub fn initialize(idle_count: usize, idle_size: usize, threads_per_core: usize, core_count_adjustment: i32) -> bool {
    let pool = Arc::new(PacketPool::new(idle_count, idle_size));
    let threadpool = Arc::new(ThreadPool::new(threads_per_core, core_count_adjustment));

    GLOBALS.set(Globals { pool, threadpool }).is_ok()
}

fn globals() -> Option<&'static Globals> {
    GLOBALS.get()
}

/// Drops this process's reference to the shared pools. Existing [`Client`]
/// and [`Server`] handles keep their own `Arc` to the pools they were built
/// with, so in-flight engines are unaffected; only a later [`initialize`] is
/// unblocked... except `OnceLock` cannot be un-set, so in practice a process
/// calls `initialize` exactly once during its lifetime. Kept as a no-op for
/// symmetry with `initialize`/`new_server`/`new_client`.
pub fn close() {}

/// Acquires a packet from the process-wide pool. `None` if [`initialize`]
/// has not been called yet.
pub fn new_packet() -> Option<Packet> {
    globals().map(|g| g.pool.acquire())
}

/// Builds a new, not-yet-listening server handle sharing the process-wide
/// pools. `None` if [`initialize`] has not been called yet.
pub fn new_server() -> Option<Server> {
    globals().map(|g| Server::new(g.pool.clone(), g.threadpool.clone()))
}

/// Builds a new, not-yet-connected client handle identified by `id`, sharing
/// the process-wide pools. `None` if [`initialize`] has not been called yet.
pub fn new_client(id: Identifier) -> Option<Client> {
    globals().map(|g| Client::new(id, g.pool.clone(), g.threadpool.clone()))
}
