// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io::{Error, ErrorKind};

pub fn other_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::Other, msg)
}

pub fn invalid_data_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

pub fn would_block_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::WouldBlock, msg)
}

pub fn invalid_input_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidInput, msg)
}

pub fn not_connected_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::NotConnected, msg)
}

/// True for the socket error kinds spec'd as transient on send: the peer
/// already went away and the next `FD_CLOSE`/read will drive cleanup, so
/// there is nothing for the sender thread to do but move on.
pub fn is_transient_send_error(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotConnected
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn transient_errors_are_recognized() {
        assert!(is_transient_send_error(&not_connected_io_error("x")));
        assert!(is_transient_send_error(&Error::new(ErrorKind::ConnectionReset, "x")));
        assert!(is_transient_send_error(&Error::new(ErrorKind::ConnectionAborted, "x")));
        assert!(is_transient_send_error(&Error::new(ErrorKind::BrokenPipe, "x")));
    }

    #[test]
    fn fatal_errors_are_not_transient() {
        assert!(!is_transient_send_error(&other_io_error("x")));
        assert!(!is_transient_send_error(&invalid_data_io_error("x")));
    }
}
