// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::sync::mpsc::{channel, Receiver};
use std::thread;
use std::time::Duration;

use packetbus::{self as pb, Identifier, ServerEvent};

fn setup() {
    let _ = env_logger::try_init();
    pb::initialize(16, 256, 1, 0);
}

fn wait_for<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5)).expect("expected a message before the timeout")
}

fn settle() {
    thread::sleep(Duration::from_millis(50));
}

#[test]
fn helo_hiya_handshake() {
    setup();
    let port = 17001;

    let server = pb::new_server().unwrap();
    server.on_packet(pb::HELO, |srv, packet| {
        let reply = pb::new_packet().unwrap();
        reply.set_data(pb::HIYA, &[]);
        reply.set_channel(packet.sender());
        srv.send(reply);
        true
    });
    server.start_listen(port).unwrap();
    settle();

    let client_id = Identifier::random();
    let client = pb::new_client(client_id).unwrap();

    let (tx, rx) = channel();
    client.on_packet(pb::HIYA, move |_c, packet| {
        tx.send(packet.code()).unwrap();
        true
    });

    client.connect("127.0.0.1", port).unwrap();
    settle();

    let helo = pb::new_packet().unwrap();
    helo.set_data(pb::HELO, &[]);
    client.send(helo);

    assert_eq!(pb::HIYA, wait_for(&rx));

    client.release();
    server.release();
}

#[test]
fn join_then_broadcast() {
    setup();
    let port = 17002;
    let channel = Identifier::new(0, 0, 0, [0, 0, 0, 0, 0, 0, 0, 0x7b]);

    let server = pb::new_server().unwrap();
    server.on_packet(pb::JOIN, move |srv, packet| {
        srv.subscribe(packet.channel(), packet.sender());
        true
    });
    server.start_listen(port).unwrap();
    settle();

    let a = pb::new_client(Identifier::random()).unwrap();
    let b = pb::new_client(Identifier::random()).unwrap();

    let (tx_a, rx_a) = channel();
    a.on_packet(pb::TEXT, move |_c, packet| {
        tx_a.send(packet.payload()).unwrap();
        true
    });
    let (tx_b, rx_b) = channel();
    b.on_packet(pb::TEXT, move |_c, packet| {
        tx_b.send((packet.sender(), packet.payload())).unwrap();
        true
    });

    a.connect("127.0.0.1", port).unwrap();
    b.connect("127.0.0.1", port).unwrap();
    settle();

    let join_a = pb::new_packet().unwrap();
    join_a.set_data(pb::JOIN, &[]);
    join_a.set_channel(channel);
    a.send(join_a);

    let join_b = pb::new_packet().unwrap();
    join_b.set_data(pb::JOIN, &[]);
    join_b.set_channel(channel);
    b.send(join_b);
    settle();

    let text = pb::new_packet().unwrap();
    text.set_data(pb::TEXT, b"hi\0");
    text.set_channel(channel);
    a.send(text);

    let (sender, payload) = wait_for(&rx_b);
    assert_eq!(a.id(), sender);
    assert_eq!(b"hi\0".to_vec(), payload);
    assert!(rx_a.recv_timeout(Duration::from_millis(200)).is_err());

    a.release();
    b.release();
    server.release();
}

#[test]
fn quit_leaves_only_remaining_subscriber() {
    setup();
    let port = 17003;
    let channel = Identifier::new(0, 0, 0, [0, 0, 0, 0, 0, 0, 0, 0x7c]);

    let server = pb::new_server().unwrap();
    server.on_packet(pb::JOIN, |srv, packet| {
        srv.subscribe(packet.channel(), packet.sender());
        true
    });
    server.on_packet(pb::QUIT, |srv, packet| {
        srv.unsubscribe(packet.channel(), packet.sender());
        true
    });
    server.start_listen(port).unwrap();
    settle();

    let a = pb::new_client(Identifier::random()).unwrap();
    let b = pb::new_client(Identifier::random()).unwrap();

    let (tx_b, rx_b) = channel();
    b.on_packet(pb::TEXT, move |_c, packet| {
        tx_b.send(packet.payload()).unwrap();
        true
    });

    a.connect("127.0.0.1", port).unwrap();
    b.connect("127.0.0.1", port).unwrap();
    settle();

    for client in [&a, &b] {
        let join = pb::new_packet().unwrap();
        join.set_data(pb::JOIN, &[]);
        join.set_channel(channel);
        client.send(join);
    }
    settle();

    let quit = pb::new_packet().unwrap();
    quit.set_data(pb::QUIT, &[]);
    quit.set_channel(channel);
    a.send(quit);
    settle();

    let text = pb::new_packet().unwrap();
    text.set_data(pb::TEXT, b"late");
    text.set_channel(channel);
    b.send(text);

    assert!(rx_b.recv_timeout(Duration::from_millis(300)).is_err());

    a.release();
    b.release();
    server.release();
}

#[test]
fn reconnect_preserves_identifier() {
    setup();
    let port = 17004;

    let connects = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let disconnects = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

    let server = pb::new_server().unwrap();
    {
        let connects = connects.clone();
        server.on_event(ServerEvent::Connect, move |_srv, _kind, id| {
            connects.lock().unwrap().push(id);
            true
        });
    }
    {
        let disconnects = disconnects.clone();
        server.on_event(ServerEvent::Disconnect, move |_srv, _kind, id| {
            disconnects.lock().unwrap().push(id);
            true
        });
    }
    server.start_listen(port).unwrap();
    settle();

    let id = Identifier::random();

    let first = pb::new_client(id).unwrap();
    first.connect("127.0.0.1", port).unwrap();
    settle();
    first.disconnect();
    settle();

    let second = pb::new_client(id).unwrap();
    second.connect("127.0.0.1", port).unwrap();
    settle();

    assert_eq!(vec![id, id], *connects.lock().unwrap());
    assert_eq!(vec![id], *disconnects.lock().unwrap());

    second.release();
    server.release();
}

#[test]
fn short_payload_round_trips_as_empty() {
    setup();
    let port = 17005;

    let server = pb::new_server().unwrap();
    server.start_listen(port).unwrap();
    settle();

    let client = pb::new_client(Identifier::random()).unwrap();
    let (tx, rx) = channel();
    client.on_packet(pb::PING, move |_c, packet| {
        tx.send(packet.payload_len()).unwrap();
        true
    });
    client.connect("127.0.0.1", port).unwrap();
    settle();

    // Looped back by subscribing the client to its own singleton channel.
    let server_side = pb::new_packet().unwrap();
    server_side.set_data(pb::PING, &[]);
    server_side.set_channel(client.id());
    server.send(server_side);

    assert_eq!(0, wait_for(&rx));

    client.release();
    server.release();
}

#[test]
fn large_payload_round_trips() {
    setup();
    let port = 17006;
    let channel = Identifier::random();

    let server = pb::new_server().unwrap();
    server.on_packet(pb::JOIN, |srv, packet| {
        srv.subscribe(packet.channel(), packet.sender());
        true
    });
    server.start_listen(port).unwrap();
    settle();

    let a = pb::new_client(Identifier::random()).unwrap();
    let b = pb::new_client(Identifier::random()).unwrap();

    let (tx, rx) = channel();
    b.on_packet(pb::TEXT, move |_c, packet| {
        tx.send(packet.payload()).unwrap();
        true
    });

    a.connect("127.0.0.1", port).unwrap();
    b.connect("127.0.0.1", port).unwrap();
    settle();

    for client in [&a, &b] {
        let join = pb::new_packet().unwrap();
        join.set_data(pb::JOIN, &[]);
        join.set_channel(channel);
        client.send(join);
    }
    settle();

    use rand::Rng;
    let mut rng = rand::thread_rng();
    let big: Vec<u8> = (0..1024 * 1024).map(|_| rng.gen()).collect();
    let text = pb::new_packet().unwrap();
    text.set_data(pb::TEXT, &big);
    text.set_channel(channel);
    a.send(text);

    let received = rx.recv_timeout(Duration::from_secs(10)).expect("large payload did not arrive");
    assert_eq!(big, received);

    a.release();
    b.release();
    server.release();
}
