// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Small helpers shared by the server and client engines for driving
//! non-blocking sockets: retrying reads/writes around `WouldBlock`, and a
//! scatter (vectored) write of a header immediately followed by a payload.

use std::io::{self, ErrorKind, IoSlice, Read, Write};
use std::thread;
use std::time::Duration;

use crate::error::other_io_error;

const RETRY_SLEEP: Duration = Duration::from_micros(200);

/// Reads exactly `buf.len()` bytes, treating a zero-byte read as a closed
/// connection and retrying on `WouldBlock` rather than propagating it.
pub fn read_exact_retrying<R: Read>(stream: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(RETRY_SLEEP),
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Writes `header` then `payload` with a vectored write, retrying on
/// `WouldBlock` and advancing past whichever buffer a partial write landed
/// in, until both are fully flushed.
pub fn write_framed<W: Write>(stream: &mut W, header: &[u8], payload: &[u8]) -> io::Result<()> {
    let mut header_off = 0usize;
    let mut payload_off = 0usize;

    while header_off < header.len() || payload_off < payload.len() {
        let slices = [
            IoSlice::new(&header[header_off..]),
            IoSlice::new(&payload[payload_off..]),
        ];

        match stream.write_vectored(&slices) {
            Ok(0) => return Err(other_io_error("write_vectored wrote zero bytes")),
            Ok(mut written) => {
                let remaining_header = header.len() - header_off;
                let take = written.min(remaining_header);
                header_off += take;
                written -= take;
                payload_off += written;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(RETRY_SLEEP),
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// True if a byte is already sitting in the socket's receive buffer,
/// without consuming it. Used to round-robin many sockets with one thread.
///
/// A non-blocking `peek` returning `Ok(0)` means the peer performed a
/// graceful close (FIN, nothing left to read), not "no data yet" — that
/// case is surfaced as an `UnexpectedEof` error so callers tear the
/// connection down the same way a short read does, instead of polling it
/// forever.
pub fn has_data_ready(peek_result: io::Result<usize>) -> io::Result<bool> {
    match peek_result {
        Ok(0) => Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed")),
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}
