// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The fixed-layout wire header: reads and writes the packed, no-padding
//! frame described by the protocol (code, sender, channel, payload length).

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::identifier::Identifier;

/// Size in bytes of the on-wire header, before the payload.
pub const HEADER_LEN: usize = 4 + 16 + 16 + 4;

/// Size in bytes of the handshake identifier a client writes immediately
/// after connecting, and a server reads immediately after accepting.
pub const HANDSHAKE_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub code: u32,
    pub sender: Identifier,
    pub channel: Identifier,
    pub payload_len: u32,
}

pub fn write_header<W: Write>(w: &mut W, header: &Header) -> io::Result<()> {
    w.write_u32::<LittleEndian>(header.code)?;
    w.write_all(&header.sender.to_bytes())?;
    w.write_all(&header.channel.to_bytes())?;
    w.write_u32::<LittleEndian>(header.payload_len)?;
    Ok(())
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<Header> {
    let code = r.read_u32::<LittleEndian>()?;

    let mut sender = [0u8; 16];
    r.read_exact(&mut sender)?;

    let mut channel = [0u8; 16];
    r.read_exact(&mut channel)?;

    let payload_len = r.read_u32::<LittleEndian>()?;

    Ok(Header {
        code,
        sender: Identifier::from_bytes(sender),
        channel: Identifier::from_bytes(channel),
        payload_len,
    })
}

pub fn write_handshake<W: Write>(w: &mut W, id: &Identifier) -> io::Result<()> {
    w.write_all(&id.to_bytes())
}

pub fn read_handshake<R: Read>(r: &mut R) -> io::Result<Identifier> {
    let mut bytes = [0u8; 16];
    r.read_exact(&mut bytes)?;
    Ok(Identifier::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header {
            code: 0xdead_beef,
            sender: Identifier::random(),
            channel: Identifier::random(),
            payload_len: 1234,
        };

        let mut buf = Vec::new();
        write_header(&mut buf, &header).unwrap();
        assert_eq!(HEADER_LEN, buf.len());

        let decoded = read_header(&mut &buf[..]).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn handshake_round_trips() {
        let id = Identifier::random();
        let mut buf = Vec::new();
        write_handshake(&mut buf, &id).unwrap();
        assert_eq!(HANDSHAKE_LEN, buf.len());

        let decoded = read_handshake(&mut &buf[..]).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn short_read_is_an_error() {
        let buf = [0u8; 4];
        assert!(read_header(&mut &buf[..]).is_err());
    }
}
