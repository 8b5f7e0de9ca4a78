// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Reference-counted, pool-recyclable packets.
//!
//! A [`Packet`] is a thin handle around shared header fields and a payload
//! buffer. Handing a packet to another thread (the outbound queue, a
//! thread-pool task) is done with [`Packet::retain`], which bumps the
//! reference count and returns a fresh handle; the receiving side calls
//! [`Packet::release`] exactly once when it is done. When the count reaches
//! zero the backing storage goes back to its [`PacketPool`] instead of being
//! freed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::identifier::Identifier;

struct PacketData {
    code: u32,
    sender: Identifier,
    channel: Identifier,
    payload: Vec<u8>,
}

impl PacketData {
    fn with_capacity(size: usize) -> PacketData {
        PacketData {
            code: 0,
            sender: Identifier::ZERO,
            channel: Identifier::ZERO,
            payload: Vec::with_capacity(size),
        }
    }

    fn reset(&mut self) {
        self.code = 0;
        self.sender = Identifier::ZERO;
        self.channel = Identifier::ZERO;
        self.payload.clear();
    }
}

struct PacketCore {
    data: Mutex<PacketData>,
    refcount: AtomicUsize,
    pool: Weak<PoolState>,
}

/// A reference-counted packet: header fields plus an owned payload buffer.
pub struct Packet {
    core: Arc<PacketCore>,
}

impl Packet {
    fn new(data: PacketData, pool: Weak<PoolState>) -> Packet {
        Packet {
            core: Arc::new(PacketCore {
                data: Mutex::new(data),
                refcount: AtomicUsize::new(1),
                pool,
            }),
        }
    }

    pub fn code(&self) -> u32 {
        self.core.data.lock().expect("packet lock poisoned").code
    }

    pub fn set_code(&self, code: u32) {
        self.core.data.lock().expect("packet lock poisoned").code = code;
    }

    pub fn channel(&self) -> Identifier {
        self.core.data.lock().expect("packet lock poisoned").channel
    }

    pub fn set_channel(&self, channel: Identifier) {
        self.core.data.lock().expect("packet lock poisoned").channel = channel;
    }

    pub fn sender(&self) -> Identifier {
        self.core.data.lock().expect("packet lock poisoned").sender
    }

    /// Stamps the sender identifier. Called by the engines when a packet is
    /// received (from the connection's identity) or transmitted (from the
    /// local client/server identity); application code never calls this.
    pub(crate) fn set_sender(&self, sender: Identifier) {
        self.core.data.lock().expect("packet lock poisoned").sender = sender;
    }

    /// Returns a copy of the current payload bytes.
    pub fn payload(&self) -> Vec<u8> {
        self.core.data.lock().expect("packet lock poisoned").payload.clone()
    }

    pub fn payload_len(&self) -> usize {
        self.core.data.lock().expect("packet lock poisoned").payload.len()
    }

    /// Copies `bytes` into the packet's buffer. The backing allocation grows
    /// to fit but never shrinks.
    pub fn set_payload(&self, bytes: &[u8]) {
        let mut data = self.core.data.lock().expect("packet lock poisoned");
        data.payload.clear();
        data.payload.extend_from_slice(bytes);
    }

    /// Sets the code and payload in one call, a convenience for the common
    /// case of filling a freshly-acquired packet before sending it.
    pub fn set_data(&self, code: u32, bytes: &[u8]) {
        let mut data = self.core.data.lock().expect("packet lock poisoned");
        data.code = code;
        data.payload.clear();
        data.payload.extend_from_slice(bytes);
    }

    /// Bumps the reference count and returns a new handle to the same
    /// packet. Every `retain` must be matched by exactly one `release`.
    pub fn retain(&self) -> Packet {
        self.core.refcount.fetch_add(1, Ordering::SeqCst);
        Packet { core: self.core.clone() }
    }

    /// Decrements the reference count. When it reaches zero, the packet's
    /// storage is reset and returned to its pool (or simply dropped, if the
    /// pool has since been closed).
    pub fn release(self) {
        let previous = self.core.refcount.fetch_sub(1, Ordering::SeqCst);

        if previous == 0 {
            // Refcount was already at zero: this is a double release, a
            // protocol bug. Restore the counter and drop without touching
            // the pool so the packet is not enqueued twice.
            self.core.refcount.store(0, Ordering::SeqCst);
            log::error!("double release detected on a packet, ignoring");
            return;
        }

        if previous != 1 {
            return;
        }

        if let Some(pool) = self.core.pool.upgrade() {
            {
                let mut data = self.core.data.lock().expect("packet lock poisoned");
                data.reset();
            }
            pool.enqueue_idle(self.core.clone());
        }
    }

    #[cfg(test)]
    fn refcount(&self) -> usize {
        self.core.refcount.load(Ordering::SeqCst)
    }
}

struct PoolState {
    free: Mutex<VecDeque<Arc<PacketCore>>>,
    default_size: usize,
}

impl PoolState {
    fn enqueue_idle(&self, core: Arc<PacketCore>) {
        self.free.lock().expect("pool lock poisoned").push_back(core);
    }
}

/// A bounded free-list of idle packets, shared by every connection a
/// server/client engine services.
pub struct PacketPool {
    state: Arc<PoolState>,
}

impl PacketPool {
    /// Pre-allocates `initial_count` packets, each with `initial_size` bytes
    /// of payload capacity reserved up front.
    pub fn new(initial_count: usize, initial_size: usize) -> PacketPool {
        let state = Arc::new(PoolState {
            free: Mutex::new(VecDeque::with_capacity(initial_count)),
            default_size: initial_size,
        });

        {
            let mut free = state.free.lock().expect("pool lock poisoned");
            for _ in 0..initial_count {
                let data = PacketData::with_capacity(initial_size);
                let core = Arc::new(PacketCore {
                    data: Mutex::new(data),
                    refcount: AtomicUsize::new(0),
                    pool: Arc::downgrade(&state),
                });
                free.push_back(core);
            }
        }

        PacketPool { state }
    }

    /// Pops a packet off the free list, allocating a fresh one at the
    /// default size if the pool is empty.
    pub fn acquire(&self) -> Packet {
        self.try_acquire_idle().unwrap_or_else(|| {
            let data = PacketData::with_capacity(self.state.default_size);
            Packet::new(data, Arc::downgrade(&self.state))
        })
    }

    /// Pops a packet off the free list without allocating; `None` if empty.
    pub fn try_acquire(&self) -> Option<Packet> {
        self.try_acquire_idle()
    }

    fn try_acquire_idle(&self) -> Option<Packet> {
        let core = self.state.free.lock().expect("pool lock poisoned").pop_front()?;
        core.refcount.store(1, Ordering::SeqCst);
        Some(Packet { core })
    }

    /// Number of packets currently idle in the free list.
    pub fn idle_count(&self) -> usize {
        self.state.free.lock().expect("pool lock poisoned").len()
    }
}
