//! Operation tokens carried through io_uring user-data.
//!
//! Every submission is stamped with a token identifying what its completion
//! means: an accept on the listener, or a recv/send on a connection handle.
//! The token is packed bijectively into the 64-bit user-data field (tag in
//! the upper half, payload in the lower 32 bits) so the completion handler
//! recovers exactly the value that was submitted, with no side table of
//! in-flight operations.

use std::os::unix::io::RawFd;

const TAG_ACCEPT: u64 = 0;
const TAG_RECV: u64 = 1;
const TAG_SEND: u64 = 2;
const TAG_SHIFT: u32 = 32;

/// An in-flight operation, as seen from its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Accept on the listening socket.
    Accept { listen_sock: RawFd },
    /// Recv into a connection's ring buffer.
    Recv { conn: u32 },
    /// Send from a connection's ring buffer.
    Send { conn: u32 },
}

impl Op {
    /// Pack into a user-data value.
    pub fn encode(self) -> u64 {
        match self {
            Op::Accept { listen_sock } => TAG_ACCEPT << TAG_SHIFT | listen_sock as u32 as u64,
            Op::Recv { conn } => TAG_RECV << TAG_SHIFT | conn as u64,
            Op::Send { conn } => TAG_SEND << TAG_SHIFT | conn as u64,
        }
    }

    /// Unpack from a completion's user-data.
    ///
    /// Returns `None` for a tag this process never submits.
    pub fn decode(user_data: u64) -> Option<Op> {
        let payload = user_data as u32;
        match user_data >> TAG_SHIFT {
            TAG_ACCEPT => Some(Op::Accept {
                listen_sock: payload as RawFd,
            }),
            TAG_RECV => Some(Op::Recv { conn: payload }),
            TAG_SEND => Some(Op::Send { conn: payload }),
            _ => None,
        }
    }
}
