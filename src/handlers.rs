// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Per-code and per-event handler registries.
//!
//! The original C API paired a raw function pointer with an opaque
//! `void*` userdata blob per registration. Here a handler is just a capturing
//! closure behind a trait object, so the userdata channel disappears
//! entirely while registration still keys on a packet code or event kind,
//! first-registration-wins.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::identifier::Identifier;
use crate::packet::Packet;

pub type PacketHandler<Endpoint> = Arc<dyn Fn(&Endpoint, &Packet) -> bool + Send + Sync>;
pub type EventHandler<Endpoint, Event> = Arc<dyn Fn(&Endpoint, Event, Identifier) -> bool + Send + Sync>;

/// Registered only before the engine starts (`start_listen`/`connect`);
/// read-only afterwards, so no lock guards these maps once an engine shares
/// this registry across its worker threads.
pub struct Registry<Endpoint, Event: Eq + Hash> {
    packets: HashMap<u32, PacketHandler<Endpoint>>,
    events: HashMap<Event, EventHandler<Endpoint, Event>>,
}

impl<Endpoint, Event: Eq + Hash + Copy> Registry<Endpoint, Event> {
    pub fn new() -> Self {
        Registry { packets: HashMap::new(), events: HashMap::new() }
    }

    /// Registers a packet handler for `code`. A second registration for the
    /// same code is a no-op: first wins.
    pub fn on_packet<F>(&mut self, code: u32, handler: F)
    where
        F: Fn(&Endpoint, &Packet) -> bool + Send + Sync + 'static,
    {
        self.packets.entry(code).or_insert_with(|| Arc::new(handler));
    }

    /// Registers an event handler for `kind`. First registration wins.
    pub fn on_event<F>(&mut self, kind: Event, handler: F)
    where
        F: Fn(&Endpoint, Event, Identifier) -> bool + Send + Sync + 'static,
    {
        self.events.entry(kind).or_insert_with(|| Arc::new(handler));
    }

    pub fn packet_handler(&self, code: u32) -> Option<PacketHandler<Endpoint>> {
        self.packets.get(&code).cloned()
    }

    pub fn event_handler(&self, kind: Event) -> Option<EventHandler<Endpoint, Event>> {
        self.events.get(&kind).cloned()
    }
}

impl<Endpoint, Event: Eq + Hash + Copy> Default for Registry<Endpoint, Event> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events a server's registered event handler may be invoked with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ServerEvent {
    Connect,
    Disconnect,
}

/// Events a client's registered event handler may be invoked with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registering_twice_for_same_code_keeps_the_first() {
        let mut registry: Registry<(), ServerEvent> = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        registry.on_packet(1, move |_e: &(), _p: &Packet| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });
        registry.on_packet(1, move |_e: &(), _p: &Packet| {
            panic!("second handler must never run");
        });

        assert!(registry.packet_handler(1).is_some());
        assert!(registry.packet_handler(2).is_none());
    }

    #[test]
    fn event_registration_is_keyed_by_kind() {
        let mut registry: Registry<(), ServerEvent> = Registry::new();
        registry.on_event(ServerEvent::Connect, |_e: &(), _k, _id| true);

        assert!(registry.event_handler(ServerEvent::Connect).is_some());
        assert!(registry.event_handler(ServerEvent::Disconnect).is_none());
    }
}
