//! Byte-level frame format.
//!
//! Frame layout (5 bytes of overhead + parameters):
//!
//! ```text
//! +--------+--------+---------+---------------+------------+--------+
//! | sync   | length | control | order / reply | parameters | crc8   |
//! | 1 byte | 1 byte | 1 byte  | 1 byte        | length - 2 | 1 byte |
//! +--------+--------+---------+---------------+------------+--------+
//! ```
//!
//! `length` counts `control + code + parameters`. The CRC covers every byte
//! between the sync byte and the CRC byte.

use crate::crc::crc8;
use crate::error::ProtocolError;
use crate::message::{Order, ReplyCode};
use crate::MAX_PARAMS_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Sync byte that starts every host-to-client frame.
pub const HOST_SYNC: u8 = 0x23;

/// Sync byte that starts every client-to-host frame.
pub const CLIENT_SYNC: u8 = 0x42;

/// Bytes in a frame besides the parameters.
pub const FRAME_OVERHEAD: usize = 5;

/// Which way a frame travels; selects the sync byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToClient,
    ClientToHost,
}

impl Direction {
    pub fn sync_byte(&self) -> u8 {
        match self {
            Direction::HostToClient => HOST_SYNC,
            Direction::ClientToHost => CLIENT_SYNC,
        }
    }
}

/// Control byte: sequence number in the low bits, resync/event flag on top.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Control(u8);

impl Control {
    /// Sequence number bits.
    pub const SEQUENCE_MASK: u8 = 0x0F;
    /// Resync request (host to client) or new event (client to host).
    pub const RESYNC: u8 = 0x80;

    pub fn new(sequence: u8) -> Self {
        Self(sequence & Self::SEQUENCE_MASK)
    }

    pub fn with_resync(mut self) -> Self {
        self.0 |= Self::RESYNC;
        self
    }

    /// Client-side name for the same bit.
    pub fn with_event(self) -> Self {
        self.with_resync()
    }

    pub fn sequence(&self) -> u8 {
        self.0 & Self::SEQUENCE_MASK
    }

    pub fn is_resync(&self) -> bool {
        self.0 & Self::RESYNC != 0
    }

    pub fn is_event(&self) -> bool {
        self.is_resync()
    }

    /// Control for a reply: same sequence, flag cleared.
    pub fn echo(&self) -> Self {
        Self::new(self.sequence())
    }

    /// Control carrying the following sequence number.
    pub fn next(&self) -> Self {
        Self::new(self.sequence().wrapping_add(1))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub control: Control,
    /// Order code (host to client) or reply code (client to host).
    pub code: u8,
    pub params: Bytes,
}

impl Frame {
    /// Creates a host-to-client order frame.
    pub fn request(control: Control, order: Order, params: impl Into<Bytes>) -> Self {
        Self {
            direction: Direction::HostToClient,
            control,
            code: order as u8,
            params: params.into(),
        }
    }

    /// Creates a client-to-host reply frame.
    pub fn reply(control: Control, code: ReplyCode, params: impl Into<Bytes>) -> Self {
        Self {
            direction: Direction::ClientToHost,
            control,
            code: code as u8,
            params: params.into(),
        }
    }

    /// Value of the length byte: parameters plus control and code.
    pub fn length(&self) -> usize {
        self.params.len() + 2
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.params.len() > MAX_PARAMS_LEN {
            return Err(ProtocolError::ParamsTooLarge {
                size: self.params.len(),
                max: MAX_PARAMS_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(self.params.len() + FRAME_OVERHEAD);
        buf.put_u8(self.direction.sync_byte());
        buf.put_u8(self.length() as u8);
        buf.put_u8(self.control.bits());
        buf.put_u8(self.code);
        buf.put_slice(&self.params);

        let crc = crc8(&buf[1..]);
        buf.put_u8(crc);

        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on framing errors.
    /// `buf[0]` must be the sync byte of `direction`.
    pub fn decode(buf: &mut BytesMut, direction: Direction) -> Result<Option<Self>, ProtocolError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let sync = direction.sync_byte();
        if buf[0] != sync {
            return Err(ProtocolError::InvalidSync {
                expected: sync,
                actual: buf[0],
            });
        }

        if buf.len() < 2 {
            return Ok(None);
        }

        let length = buf[1];
        if length < 2 {
            buf.advance(1);
            return Err(ProtocolError::InvalidLength(length));
        }

        let total_len = length as usize + 3;
        if buf.len() < total_len {
            return Ok(None);
        }

        let crc_expected = buf[total_len - 1];
        let crc_actual = crc8(&buf[1..total_len - 1]);
        if crc_expected != crc_actual {
            let control = buf[2];
            buf.advance(total_len);
            return Err(ProtocolError::CrcMismatch {
                control,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        // Sync and length
        buf.advance(2);
        let control = Control::from_bits(buf.get_u8());
        let code = buf.get_u8();
        let params = buf.split_to(length as usize - 2).freeze();
        // CRC
        buf.advance(1);

        Ok(Some(Self {
            direction,
            control,
            code,
            params,
        }))
    }
}
