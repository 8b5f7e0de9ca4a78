// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::is_transient_send_error;
use crate::handlers::ServerEvent;
use crate::identifier::Identifier;
use crate::io_util::{has_data_ready, read_exact_retrying, write_framed};
use crate::wire::{self, Header};

use super::Server;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub(super) fn listener_loop(server: Server, listener: TcpListener) {
    loop {
        if server.inner.quit.load(Ordering::SeqCst) {
            break;
        }

        match listener.accept() {
            Ok((stream, _addr)) => accept_connection(&server, stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                log::error!("listener accept failed, server going idle: {}", e);
                break;
            }
        }
    }
}

fn accept_connection(server: &Server, mut stream: TcpStream) {
    let mut id_bytes = [0u8; wire::HANDSHAKE_LEN];
    if let Err(e) = stream.read_exact(&mut id_bytes) {
        log::warn!("handshake read failed: {}", e);
        return;
    }
    let id = Identifier::from_bytes(id_bytes);

    let connection = match Connection::new(id, stream) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            log::warn!("failed to prepare connection {:?}: {}", id, e);
            return;
        }
    };

    log::debug!("connection accepted: {:?} from {}", id, connection.peer_addr);

    server.inner.connections.lock().expect("connections lock poisoned").insert(id, connection);
    server.inner.routing.lock().expect("routing lock poisoned").entry(id).or_default().insert(id);
    server.inner.listening.lock().expect("listening lock poisoned").entry(id).or_default().insert(id);

    let handler = server
        .inner
        .registry
        .lock()
        .expect("registry lock poisoned")
        .event_handler(ServerEvent::Connect);

    if let Some(handler) = handler {
        handler(server, ServerEvent::Connect, id);
    }
}

pub(super) fn receiver_loop(server: Server) {
    loop {
        if server.inner.quit.load(Ordering::SeqCst) {
            break;
        }

        let snapshot: Vec<Arc<Connection>> =
            server.inner.connections.lock().expect("connections lock poisoned").values().cloned().collect();

        if snapshot.is_empty() {
            thread::sleep(POLL_INTERVAL);
            continue;
        }

        for connection in snapshot {
            if server.inner.quit.load(Ordering::SeqCst) {
                break;
            }

            match try_receive_one(&server, &connection) {
                Ok(_) => {}
                Err(e) => {
                    log::debug!("connection {:?} closed: {}", connection.id, e);
                    disconnect(&server, &connection);
                }
            }
        }
    }
}

/// Reads and dispatches at most one packet from `connection`. Returns
/// `Ok(false)` if nothing was ready, `Ok(true)` if a packet was processed,
/// and `Err` if the connection should be torn down.
fn try_receive_one(server: &Server, connection: &Arc<Connection>) -> io::Result<bool> {
    let mut probe = [0u8; 1];
    if !has_data_ready((&connection.recv).peek(&mut probe))? {
        return Ok(false);
    }

    let mut recv_stream = &connection.recv;
    let mut header_bytes = [0u8; wire::HEADER_LEN];
    read_exact_retrying(&mut recv_stream, &mut header_bytes)?;
    let header = wire::read_header(&mut &header_bytes[..])?;

    let packet = server.inner.pool.acquire();
    packet.set_code(header.code);
    packet.set_channel(header.channel);
    // The connection's own identity is trusted, not whatever the header claims.
    packet.set_sender(connection.id);

    if header.payload_len > 0 {
        let mut payload = vec![0u8; header.payload_len as usize];
        read_exact_retrying(&mut recv_stream, &mut payload)?;
        packet.set_payload(&payload);
    }

    server.inner.route(&packet);

    let handler = server.inner.registry.lock().expect("registry lock poisoned").packet_handler(header.code);
    if let Some(handler) = handler {
        let claim = packet.retain();
        let server_for_task = server.clone();
        server.inner.threadpool.submit_once(move || {
            handler(&server_for_task, &claim);
            claim.release();
        });
    }

    packet.release();
    Ok(true)
}

fn disconnect(server: &Server, connection: &Arc<Connection>) {
    let id = connection.id;

    server.inner.remove_subscriber_everywhere(id);
    server.inner.connections.lock().expect("connections lock poisoned").remove(&id);

    let handler = server
        .inner
        .registry
        .lock()
        .expect("registry lock poisoned")
        .event_handler(ServerEvent::Disconnect);

    if let Some(handler) = handler {
        handler(server, ServerEvent::Disconnect, id);
    }
}

pub(super) fn sender_loop(server: Server) {
    loop {
        let packet = {
            let mut outbound = server.inner.outbound.lock().expect("outbound lock poisoned");

            loop {
                if let Some(packet) = outbound.pop_front() {
                    break Some(packet);
                }
                if server.inner.quit.load(Ordering::SeqCst) {
                    break None;
                }
                let (guard, _timed_out) = server
                    .inner
                    .outbound_cv
                    .wait_timeout(outbound, POLL_INTERVAL)
                    .expect("outbound lock poisoned");
                outbound = guard;
            }
        };

        let Some(packet) = packet else {
            if server.inner.quit.load(Ordering::SeqCst) {
                break;
            }
            continue;
        };

        deliver(&server, &packet);
        packet.release();
    }
}

fn deliver(server: &Server, packet: &crate::packet::Packet) {
    let channel = packet.channel();
    let sender = packet.sender();

    let targets: Vec<Identifier> = {
        let routing = server.inner.routing.lock().expect("routing lock poisoned");
        match routing.get(&channel) {
            Some(subs) => subs.iter().copied().filter(|s| *s != sender).collect(),
            None => return,
        }
    };

    let header = Header { code: packet.code(), sender, channel, payload_len: packet.payload_len() as u32 };
    let mut header_bytes = Vec::with_capacity(wire::HEADER_LEN);
    if wire::write_header(&mut header_bytes, &header).is_err() {
        return;
    }
    let payload = packet.payload();

    for target in targets {
        let connection = server.inner.connections.lock().expect("connections lock poisoned").get(&target).cloned();
        let Some(connection) = connection else { continue };

        let mut send_stream = &connection.send;
        match write_framed(&mut send_stream, &header_bytes, &payload) {
            Ok(()) => {}
            Err(e) if is_transient_send_error(&e) => {
                log::debug!("transient send error to {:?}: {}", target, e);
            }
            Err(e) => {
                log::warn!("send to {:?} failed: {}", target, e);
            }
        }
    }
}
