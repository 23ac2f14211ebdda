//! Wire frames carried on every channel.
//!
//! A frame is a fixed-size [`Header`] followed by `length` payload bytes.
//! At most one file descriptor rides along as `SCM_RIGHTS` ancillary data
//! on the `sendmsg` call that carries the header. Header fields are in
//! host byte order: both endpoints are forked from the same ancestor on
//! the same host, so nothing is ever swapped.

use crate::{error::FrameError, net::Fd};
use std::mem;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Broker tag: peer-channel hand-off from the parent. The payload is the
/// peer's name as bytes and the frame carries exactly one descriptor.
pub(crate) const CHANNEL: u32 = 1;

/// Broker tag: bootstrap complete, releases the child's ready latch.
pub(crate) const READY: u32 = 2;

/// Highest reserved message tag; embedder tags must be greater.
pub const RESERVED: u32 = 10;

/// Maximum payload length of a single frame. Bounds what a compromised
/// peer can make the receiver allocate.
pub const MAX_PAYLOAD: usize = 16384;

/// Flag bit: this frame answers the query with the same correlation id.
pub(crate) const FLAG_REPLY: u32 = 0x1;

const FLAG_MASK: u32 = FLAG_REPLY;

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Fixed-size frame header.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Header {
    /// Message-type tag.
    pub id: u32,
    /// Flag bits; only [`FLAG_REPLY`] is defined.
    pub flags: u32,
    /// Correlation id. Nonzero ties a query to its reply, zero is
    /// fire-and-forget.
    pub seq: u32,
    /// Payload length in bytes, header excluded.
    pub length: u32,
}

impl Header {
    pub(crate) fn new(id: u32, flags: u32, seq: u32, length: usize) -> Result<Self, FrameError> {
        if length > MAX_PAYLOAD {
            return Err(FrameError::TooLarge(length, MAX_PAYLOAD));
        }
        Ok(Self {
            id,
            flags,
            seq,
            length: length as u32,
        })
    }

    pub(crate) fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    /// Check a decoded header against the codec limits.
    pub(crate) fn validate(&self) -> Result<(), FrameError> {
        if self.flags & !FLAG_MASK != 0 {
            return Err(FrameError::BadFlags(self.flags));
        }
        if self.is_reply() && self.seq == 0 {
            return Err(FrameError::BadFlags(self.flags));
        }
        if self.length as usize > MAX_PAYLOAD {
            return Err(FrameError::TooLarge(self.length as usize, MAX_PAYLOAD));
        }
        Ok(())
    }
}

/// A single decoded frame.
#[derive(Debug)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
    /// The passed descriptor, if the sender attached one.
    pub fd: Option<Fd>,
}

impl Frame {
    pub(crate) fn new(
        id: u32,
        flags: u32,
        seq: u32,
        payload: Vec<u8>,
        fd: Option<Fd>,
    ) -> Result<Self, FrameError> {
        let header = Header::new(id, flags, seq, payload.len())?;
        Ok(Self {
            header,
            payload,
            fd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header::new(23, FLAG_REPLY, 7, 512).unwrap();
        let decoded = Header::read_from(header.as_bytes()).unwrap();
        assert_eq!(decoded.id, 23);
        assert_eq!(decoded.flags, FLAG_REPLY);
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.length, 512);
        decoded.validate().unwrap();
    }

    #[test]
    fn header_is_fixed_size() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(Header::default().as_bytes().len(), HEADER_SIZE);
    }

    #[test]
    fn oversized_payload_rejected() {
        assert!(matches!(
            Header::new(11, 0, 0, MAX_PAYLOAD + 1),
            Err(FrameError::TooLarge(..))
        ));

        let header = Header {
            id: 11,
            flags: 0,
            seq: 0,
            length: (MAX_PAYLOAD + 1) as u32,
        };
        assert!(matches!(header.validate(), Err(FrameError::TooLarge(..))));
    }

    #[test]
    fn unknown_flags_rejected() {
        let header = Header {
            id: 11,
            flags: 0x80,
            seq: 0,
            length: 0,
        };
        assert!(matches!(header.validate(), Err(FrameError::BadFlags(_))));
    }

    #[test]
    fn reply_without_correlation_id_rejected() {
        let header = Header {
            id: 11,
            flags: FLAG_REPLY,
            seq: 0,
            length: 0,
        };
        assert!(matches!(header.validate(), Err(FrameError::BadFlags(_))));
    }

    #[test]
    fn frame_accepts_payload_up_to_cap() {
        let frame = Frame::new(11, 0, 0, vec![0; MAX_PAYLOAD], None).unwrap();
        assert_eq!(frame.header.length as usize, MAX_PAYLOAD);
    }
}
