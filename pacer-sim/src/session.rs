//! Per-link session state and the retry cache.

use crate::error::SimError;
use crate::handler::OrderHandler;
use bytes::Bytes;
use pacer_protocol::{Control, Encoder, Frame, FrameReceiptCode, ReplyCode};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Last reply sent, kept so a retransmitted request is answered without
/// executing it twice.
#[derive(Debug, Clone)]
struct CachedReply {
    sequence: u8,
    encoded: Bytes,
}

/// State of one host link.
pub struct ConnectionState {
    /// Unique session ID.
    pub id: String,

    /// Peer description (socket address or transport name).
    pub peer: String,

    /// Control byte of the most recent request.
    last_control: Option<Control>,

    cache: Option<CachedReply>,

    request_count: u64,
    replay_count: u64,

    created_at: Instant,
}

impl ConnectionState {
    /// Creates a new session.
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer: peer.into(),
            last_control: None,
            cache: None,
            request_count: 0,
            replay_count: 0,
            created_at: Instant::now(),
        }
    }

    /// Answers one decoded request, from the cache when it is a retransmission.
    ///
    /// A request repeating the cached sequence number without the resync flag
    /// is a retransmission: the cached bytes go out unchanged and the order is
    /// not executed again. Anything else runs through the handler and replaces
    /// the cache.
    pub fn respond(&mut self, handler: &OrderHandler, frame: &Frame) -> Result<Bytes, SimError> {
        self.request_count += 1;
        let control = frame.control;
        self.last_control = Some(control);

        if !control.is_resync() {
            if let Some(cached) = &self.cache {
                if cached.sequence == control.sequence() {
                    self.replay_count += 1;
                    debug!(
                        session = %self.id,
                        sequence = cached.sequence,
                        "Replaying cached reply"
                    );
                    return Ok(cached.encoded.clone());
                }
            }
        }

        let response = handler.handle(frame.code, &frame.params);
        let mut reply_control = control.echo();
        if response.event {
            reply_control = reply_control.with_event();
        }
        let encoded = Encoder::encode_reply(reply_control, response.code, &response.params)?.freeze();

        self.cache = Some(CachedReply {
            sequence: control.sequence(),
            encoded: encoded.clone(),
        });
        Ok(encoded)
    }

    /// Builds a frame receipt error echoing the damaged frame's sequence.
    ///
    /// The retry cache is left untouched.
    pub fn frame_receipt_error(&self, control: u8, code: FrameReceiptCode) -> Result<Bytes, SimError> {
        let control = Control::from_bits(control).echo();
        Ok(Encoder::encode_reply(control, ReplyCode::FrameReceiptError, &[code as u8])?.freeze())
    }

    pub fn last_control(&self) -> Option<Control> {
        self.last_control
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Requests answered from the retry cache.
    pub fn replay_count(&self) -> u64 {
        self.replay_count
    }

    /// Returns the session age.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}
