// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::is_transient_send_error;
use crate::handlers::ClientEvent;
use crate::io_util::{has_data_ready, read_exact_retrying, write_framed};
use crate::wire;

use super::Client;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn connection_of(client: &Client) -> Option<Arc<Connection>> {
    client.inner.connection.lock().expect("connection lock poisoned").clone()
}

pub(super) fn sender_loop(client: Client) {
    loop {
        let packet = {
            let mut outbound = client.inner.outbound.lock().expect("outbound lock poisoned");

            loop {
                if let Some(packet) = outbound.pop_front() {
                    break Some(packet);
                }
                if client.inner.quit.load(Ordering::SeqCst) {
                    break None;
                }
                let (guard, _timed_out) = client
                    .inner
                    .outbound_cv
                    .wait_timeout(outbound, POLL_INTERVAL)
                    .expect("outbound lock poisoned");
                outbound = guard;
            }
        };

        let Some(packet) = packet else {
            if client.inner.quit.load(Ordering::SeqCst) {
                break;
            }
            continue;
        };

        if let Some(connection) = connection_of(&client) {
            let header = wire::Header {
                code: packet.code(),
                sender: packet.sender(),
                channel: packet.channel(),
                payload_len: packet.payload_len() as u32,
            };

            let mut header_bytes = Vec::with_capacity(wire::HEADER_LEN);
            if wire::write_header(&mut header_bytes, &header).is_ok() {
                let payload = packet.payload();
                let mut send_stream = &connection.send;

                match write_framed(&mut send_stream, &header_bytes, &payload) {
                    Ok(()) => {}
                    Err(e) if is_transient_send_error(&e) => {
                        log::debug!("transient send error: {}", e);
                    }
                    Err(e) => {
                        log::warn!("send failed: {}", e);
                    }
                }
            }
        }

        packet.release();
    }
}

pub(super) fn receiver_loop(client: Client) {
    loop {
        if client.inner.quit.load(Ordering::SeqCst) {
            break;
        }

        let Some(connection) = connection_of(&client) else {
            break;
        };

        match try_receive_one(&client, &connection) {
            Ok(true) => {}
            Ok(false) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                log::debug!("connection closed: {}", e);
                disconnect(&client);
                break;
            }
        }
    }
}

fn try_receive_one(client: &Client, connection: &Arc<Connection>) -> io::Result<bool> {
    let mut probe = [0u8; 1];
    if !has_data_ready((&connection.recv).peek(&mut probe))? {
        return Ok(false);
    }

    let mut recv_stream = &connection.recv;
    let mut header_bytes = [0u8; wire::HEADER_LEN];
    read_exact_retrying(&mut recv_stream, &mut header_bytes)?;
    let header = wire::read_header(&mut &header_bytes[..])?;

    let packet = client.inner.pool.acquire();
    packet.set_code(header.code);
    packet.set_channel(header.channel);
    packet.set_sender(header.sender);

    if header.payload_len > 0 {
        let mut payload = vec![0u8; header.payload_len as usize];
        read_exact_retrying(&mut recv_stream, &mut payload)?;
        packet.set_payload(&payload);
    }

    let handler = client.inner.registry.lock().expect("registry lock poisoned").packet_handler(header.code);
    if let Some(handler) = handler {
        let claim = packet.retain();
        let client_for_task = client.clone();
        client.inner.threadpool.submit_once(move || {
            handler(&client_for_task, &claim);
            claim.release();
        });
    }

    packet.release();
    Ok(true)
}

fn disconnect(client: &Client) {
    *client.inner.connection.lock().expect("connection lock poisoned") = None;

    let handler = client
        .inner
        .registry
        .lock()
        .expect("registry lock poisoned")
        .event_handler(ClientEvent::Disconnected);

    if let Some(handler) = handler {
        handler(client, ClientEvent::Disconnected, client.inner.id);
    }
}
