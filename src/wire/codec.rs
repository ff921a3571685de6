//! Frame encoding and decoding
//!
//! Outbound messages are kept as three spans (header, control, payload) so the
//! inline send path can hand them straight to a vectored write. When a message
//! has to outlive the caller (partial write, queued behind other traffic) it is
//! flattened once into a shared buffer; every queue entry holding it clones the
//! same `Arc`, so the buffer is freed when the last connection finishes with it.

use std::io::IoSlice;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::message::MessageType;
use crate::error::{Error, Result};

/// Fixed header size: type (1) + control length (4) + payload length (4)
pub const HEADER_SIZE: usize = 9;

/// A message copied into one contiguous, shareable buffer
pub type FlatMessage = Arc<[u8]>;

/// An encoded message ready for transmission
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    msg_type: MessageType,
    header: [u8; HEADER_SIZE],
    control: Bytes,
    payload: Bytes,
    flat: Option<FlatMessage>,
}

impl OutboundMessage {
    /// Encode a message into its header/control/payload spans
    pub fn encode(msg_type: MessageType, control: Bytes, payload: Bytes) -> Self {
        let mut header = [0u8; HEADER_SIZE];
        {
            let mut buf = &mut header[..];
            buf.put_u8(msg_type as u8);
            buf.put_u32(control.len() as u32);
            buf.put_u32(payload.len() as u32);
        }

        Self {
            msg_type,
            header,
            control,
            payload,
            flat: None,
        }
    }

    /// Message type tag
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Total encoded length in bytes
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.control.len() + self.payload.len()
    }

    /// Encoded messages always carry at least a header
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The ordered byte spans of the message, zero-length spans omitted
    pub fn spans(&self) -> Vec<&[u8]> {
        [&self.header[..], &self.control[..], &self.payload[..]]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Vectored-write slices for everything past `offset`
    pub fn io_slices(&self, offset: usize) -> Vec<IoSlice<'_>> {
        let mut skip = offset;
        let mut slices = Vec::with_capacity(3);
        for span in self.spans() {
            if skip >= span.len() {
                skip -= span.len();
                continue;
            }
            slices.push(IoSlice::new(&span[skip..]));
            skip = 0;
        }
        slices
    }

    /// Copy the spans into a single shared buffer.
    ///
    /// The copy is made at most once per message; later calls (for example
    /// from the next connection of a broadcast) share the same allocation.
    pub fn flatten(&mut self) -> FlatMessage {
        if let Some(flat) = &self.flat {
            return Arc::clone(flat);
        }

        let mut buf = Vec::with_capacity(self.len());
        for span in self.spans() {
            buf.extend_from_slice(span);
        }
        let flat: FlatMessage = buf.into();
        self.flat = Some(Arc::clone(&flat));
        flat
    }

    /// Weak handle to the flattened buffer, if one has been made
    pub fn flat_weak(&self) -> Option<std::sync::Weak<[u8]>> {
        self.flat.as_ref().map(Arc::downgrade)
    }
}

/// A decoded frame. The type is kept raw so unknown types can be skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub msg_type: u8,
    pub control: Bytes,
    pub payload: Bytes,
}

impl WireFrame {
    /// The frame's message type, if recognized
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }
}

/// Streaming decoder for incoming frames.
///
/// Partially received frames stay buffered in the `FramedRead` that drives
/// this decoder until the rest of the bytes arrive.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_message_size: usize,
}

impl WireCodec {
    /// Create a decoder rejecting frames whose body exceeds `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for WireCodec {
    type Item = WireFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..HEADER_SIZE];
        let msg_type = header.get_u8();
        let control_len = header.get_u32() as usize;
        let payload_len = header.get_u32() as usize;

        let body_len = control_len.saturating_add(payload_len);
        if body_len > self.max_message_size {
            return Err(Error::Protocol(format!(
                "frame body of {} bytes exceeds limit of {}",
                body_len, self.max_message_size
            )));
        }

        let total = HEADER_SIZE + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let control = src.split_to(control_len).freeze();
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(WireFrame {
            msg_type,
            control,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    fn decode_all(bytes: &[u8]) -> Vec<WireFrame> {
        let mut codec = WireCodec::new(1 << 20);
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn test_header_layout() {
        let mut msg = OutboundMessage::encode(
            MessageType::RepMessage,
            Bytes::from_static(b"ctl"),
            Bytes::from_static(b"payload"),
        );
        let flat = msg.flatten();

        assert_eq!(flat[0], 3);
        assert_eq!(&flat[1..5], &[0, 0, 0, 3]);
        assert_eq!(&flat[5..9], &[0, 0, 0, 7]);
        assert_eq!(&flat[9..12], b"ctl");
        assert_eq!(&flat[12..], b"payload");
        assert_eq!(flat.len(), msg.len());
    }

    #[test]
    fn test_empty_sections_keep_length_fields() {
        let mut msg = OutboundMessage::encode(MessageType::Heartbeat, Bytes::new(), Bytes::new());
        assert_eq!(msg.spans().len(), 1);
        assert_eq!(&msg.flatten()[..], &[4, 0, 0, 0, 0, 0, 0, 0, 0]);

        let frames = decode_all(&msg.flatten());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), Some(MessageType::Heartbeat));
        assert!(frames[0].control.is_empty());
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_random_frames_decode_intact() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let mut control = vec![0u8; rng.gen_range(0..=64 * 1024)];
            let mut payload = vec![0u8; rng.gen_range(0..=64 * 1024)];
            rng.fill_bytes(&mut control);
            rng.fill_bytes(&mut payload);

            let mut msg = OutboundMessage::encode(
                MessageType::RepMessage,
                Bytes::from(control.clone()),
                Bytes::from(payload.clone()),
            );
            let frames = decode_all(&msg.flatten());

            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].kind(), Some(MessageType::RepMessage));
            assert_eq!(&frames[0].control[..], &control[..]);
            assert_eq!(&frames[0].payload[..], &payload[..]);
        }
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let mut msg = OutboundMessage::encode(
            MessageType::Ack,
            Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 42]),
            Bytes::new(),
        );
        let flat = msg.flatten();

        let mut codec = WireCodec::new(1024);
        let mut buf = BytesMut::new();
        for byte in &flat[..flat.len() - 1] {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(flat[flat.len() - 1]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind(), Some(MessageType::Ack));
        assert_eq!(frame.control.len(), 8);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = WireCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_u32(10);
        buf.put_u32(10);

        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_io_slices_skip_written_prefix() {
        let msg = OutboundMessage::encode(
            MessageType::RepMessage,
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"defg"),
        );

        let slices = msg.io_slices(HEADER_SIZE + 1);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"bc");
        assert_eq!(&*slices[1], b"defg");

        let slices = msg.io_slices(HEADER_SIZE + 3);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"defg");

        assert!(msg.io_slices(msg.len()).is_empty());
    }

    #[test]
    fn test_flatten_shares_one_allocation() {
        let mut msg = OutboundMessage::encode(
            MessageType::RepMessage,
            Bytes::from_static(b"c"),
            Bytes::from_static(b"p"),
        );
        let a = msg.flatten();
        let b = msg.flatten();
        assert!(Arc::ptr_eq(&a, &b));

        let weak = msg.flat_weak().unwrap();
        drop(a);
        drop(b);
        assert!(weak.upgrade().is_some());
        drop(msg);
        assert!(weak.upgrade().is_none());
    }
}
