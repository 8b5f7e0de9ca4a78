// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;
use std::net::{SocketAddr, TcpStream};

use crate::identifier::Identifier;

/// A connected peer, keyed by its declared identifier. `recv` and `send` are
/// independent handles onto the same socket (`TcpStream::try_clone`), so the
/// single receiver thread and single sender thread never contend on one
/// `TcpStream`'s internal state.
pub(crate) struct Connection {
    pub id: Identifier,
    pub peer_addr: SocketAddr,
    pub recv: TcpStream,
    pub send: TcpStream,
}

impl Connection {
    pub fn new(id: Identifier, stream: TcpStream) -> io::Result<Connection> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        let send = stream.try_clone()?;

        Ok(Connection { id, peer_addr, recv: stream, send })
    }
}
