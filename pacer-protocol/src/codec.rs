//! Streaming encoder and decoder for pacer frames.

use crate::error::ProtocolError;
use crate::frame::{Control, Direction, Frame};
use crate::message::{Order, ReplyCode};
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

/// Encodes orders and replies into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a host-to-client order.
    pub fn encode_request(
        control: Control,
        order: Order,
        params: &[u8],
    ) -> Result<BytesMut, ProtocolError> {
        Frame::request(control, order, Bytes::copy_from_slice(params)).encode()
    }

    /// Encodes a client-to-host reply.
    pub fn encode_reply(
        control: Control,
        code: ReplyCode,
        params: &[u8],
    ) -> Result<BytesMut, ProtocolError> {
        Frame::reply(control, code, Bytes::copy_from_slice(params)).encode()
    }
}

/// Decodes frames travelling in one direction from a byte stream.
///
/// Bytes that cannot start a frame are discarded. Before the first good
/// frame this happens silently; once a frame has been decoded, any
/// discarded run is reported as [`ProtocolError::SyncLost`] and the
/// decoder goes back to hunting for the sync byte.
pub struct Decoder {
    buffer: BytesMut,
    direction: Direction,
    synced: bool,
}

impl Decoder {
    pub fn new(direction: Direction) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            direction,
            synced: false,
        }
    }

    /// Decoder for frames a controller receives.
    pub fn for_requests() -> Self {
        Self::new(Direction::HostToClient)
    }

    /// Decoder for frames a host receives.
    pub fn for_replies() -> Self {
        Self::new(Direction::ClientToHost)
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let sync = self.direction.sync_byte();
        loop {
            if self.buffer.is_empty() {
                return Ok(None);
            }

            if self.buffer[0] != sync {
                let discarded = self
                    .buffer
                    .iter()
                    .position(|&b| b == sync)
                    .unwrap_or(self.buffer.len());
                self.buffer.advance(discarded);
                if self.synced {
                    self.synced = false;
                    return Err(ProtocolError::SyncLost { discarded });
                }
                trace!(discarded, "Dropped bytes while hunting for sync");
                continue;
            }

            match Frame::decode(&mut self.buffer, self.direction) {
                Ok(Some(frame)) => {
                    self.synced = true;
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None),
                Err(ProtocolError::InvalidLength(length)) => {
                    if self.synced {
                        self.synced = false;
                        return Err(ProtocolError::InvalidLength(length));
                    }
                    trace!(length, "Dropped false sync byte");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns whether a frame has been decoded since the last loss of sync.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer and forgets sync.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.synced = false;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::for_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CLIENT_SYNC, HOST_SYNC};
    use proptest::prelude::*;

    #[test]
    fn test_encoder_decoder_roundtrip() {
        let encoded =
            Encoder::encode_request(Control::new(4), Order::RequestDeviceCount, &[0x04]).unwrap();

        let mut decoder = Decoder::for_requests();
        decoder.extend(&encoded);

        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.code, Order::RequestDeviceCount as u8);
        assert_eq!(&frame.params[..], &[0x04]);
        assert!(decoder.is_synced());
    }

    #[test]
    fn test_partial_frame_decoding() {
        let encoded = Encoder::encode_reply(Control::new(1), ReplyCode::Ok, b"pacer-sim").unwrap();

        let mut decoder = Decoder::for_replies();
        decoder.extend(&encoded[..6]);
        assert!(decoder.decode_frame().unwrap().is_none());

        decoder.extend(&encoded[6..]);
        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(&frame.params[..], b"pacer-sim");
    }

    #[test]
    fn test_leading_garbage_dropped_silently() {
        let encoded = Encoder::encode_reply(Control::new(2), ReplyCode::Ok, &[]).unwrap();

        let mut decoder = Decoder::for_replies();
        decoder.extend(&[0x00, 0xFF, 0x13]);
        decoder.extend(&encoded);

        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.control.sequence(), 2);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_garbage_after_sync_reports_sync_lost() {
        let first = Encoder::encode_reply(Control::new(1), ReplyCode::Ok, &[]).unwrap();
        let second = Encoder::encode_reply(Control::new(2), ReplyCode::Ok, &[]).unwrap();

        let mut decoder = Decoder::for_replies();
        decoder.extend(&first);
        decoder.extend(&[0x01, 0x02, 0x03]);
        decoder.extend(&second);

        assert!(decoder.decode_frame().unwrap().is_some());
        assert!(matches!(
            decoder.decode_frame(),
            Err(ProtocolError::SyncLost { discarded: 3 })
        ));
        assert!(!decoder.is_synced());

        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.control.sequence(), 2);
    }

    #[test]
    fn test_crc_error_surfaces_with_control() {
        let mut encoded =
            Encoder::encode_request(Control::new(9), Order::RequestTemperature, &[5, 0]).unwrap();
        encoded[4] ^= 0x01;

        let mut decoder = Decoder::for_requests();
        decoder.extend(&encoded);
        match decoder.decode_frame() {
            Err(ProtocolError::CrcMismatch { control, .. }) => assert_eq!(control, 9),
            other => panic!("expected CRC mismatch, got {:?}", other),
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_buffered() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(&[HOST_SYNC, 10, 0]);
        assert_eq!(decoder.buffered(), 3);
        assert!(decoder.decode_frame().unwrap().is_none());

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(
            sequence in 0u8..16,
            resync in any::<bool>(),
            params in prop::collection::vec(any::<u8>(), 0..=253),
        ) {
            let mut control = Control::new(sequence);
            if resync {
                control = control.with_resync();
            }
            let encoded = Encoder::encode_request(control, Order::QueueCommandBlocks, &params).unwrap();

            let mut decoder = Decoder::for_requests();
            decoder.extend(&encoded);
            let frame = decoder.decode_frame().unwrap().unwrap();

            prop_assert_eq!(frame.control, control);
            prop_assert_eq!(frame.code, Order::QueueCommandBlocks as u8);
            prop_assert_eq!(&frame.params[..], &params[..]);
        }

        #[test]
        fn prop_single_bit_flip_detected(
            params in prop::collection::vec(any::<u8>(), 0..64),
            bit in 0usize..8,
            offset in any::<prop::sample::Index>(),
        ) {
            let mut encoded = Encoder::encode_reply(Control::new(3), ReplyCode::Ok, &params).unwrap();
            // Flip a bit anywhere past the length byte
            let pos = 2 + offset.index(encoded.len() - 2);
            encoded[pos] ^= 1 << bit;

            let mut decoder = Decoder::for_replies();
            decoder.extend(&encoded);
            let is_crc_error = matches!(decoder.decode_frame(), Err(ProtocolError::CrcMismatch { .. }));
            prop_assert!(is_crc_error);
        }

        #[test]
        fn prop_resync_after_garbage(
            garbage in prop::collection::vec(any::<u8>().prop_filter("no sync", |b| *b != CLIENT_SYNC), 1..32),
            params in prop::collection::vec(any::<u8>(), 0..16),
        ) {
            let first = Encoder::encode_reply(Control::new(0), ReplyCode::Ok, &[]).unwrap();
            let second = Encoder::encode_reply(Control::new(1), ReplyCode::Ok, &params).unwrap();

            let mut decoder = Decoder::for_replies();
            decoder.extend(&garbage);
            decoder.extend(&first);
            decoder.extend(&garbage);
            decoder.extend(&second);

            prop_assert!(decoder.decode_frame().unwrap().is_some());
            let lost = matches!(decoder.decode_frame(), Err(ProtocolError::SyncLost { .. }));
            prop_assert!(lost);
            let frame = decoder.decode_frame().unwrap().unwrap();
            prop_assert_eq!(&frame.params[..], &params[..]);
        }
    }
}
