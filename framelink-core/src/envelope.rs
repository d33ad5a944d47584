//! Protocol envelope: one discrete message on the wire.
//!
//! ## Wire format
//!
//! All integers are little-endian.
//!
//! ```text
//! kind:         u8   (1)
//! name_len:     u32  (4)
//! name:         [u8] (name_len, UTF-8)
//! payload_len:  u32  (4)
//! payload:      [u8] (payload_len)
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramelinkError;

// ── Constants ────────────────────────────────────────────────────

/// Bytes taken by the `kind` tag.
pub const KIND_SIZE: usize = 1;

/// Bytes taken by each length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Smallest possible encoded envelope (empty name, empty payload).
pub const MIN_ENVELOPE_SIZE: usize = KIND_SIZE + 2 * LENGTH_SIZE;

/// Upper bound on a frame name.
pub const MAX_NAME_LEN: usize = 64 * 1024;

/// Upper bound on an envelope payload (raw frames are a few MiB at most).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

// ── EnvelopeKind ─────────────────────────────────────────────────

/// The closed set of envelope types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// Image payload, producer → receiver.
    Image = 0x1,
    /// Receipt for an image, receiver → producer.
    Ack = 0x2,
    /// Present the named frame now.
    DisplayNow = 0x3,
    /// Reset the receiver's elapsed-time base.
    StartTimer = 0x4,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = FramelinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(EnvelopeKind::Image),
            0x2 => Ok(EnvelopeKind::Ack),
            0x3 => Ok(EnvelopeKind::DisplayNow),
            0x4 => Ok(EnvelopeKind::StartTimer),
            _ => Err(FramelinkError::UnknownType(value)),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeKind::Image => write!(f, "IMAGE"),
            EnvelopeKind::Ack => write!(f, "ACK"),
            EnvelopeKind::DisplayNow => write!(f, "DISPLAY_NOW"),
            EnvelopeKind::StartTimer => write!(f, "START_TIMER"),
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────

/// One protocol message.
///
/// The payload is a [`Bytes`] handle: cloning an envelope shares the
/// underlying buffer, so callers that need to keep a frame after
/// handing it to [`Connection::send`](crate::Connection::send) keep a
/// clone rather than a shared mutable handle.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: EnvelopeKind,
    name: String,
    payload: Bytes,
}

impl Envelope {
    /// Build an IMAGE envelope.
    pub fn image(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: EnvelopeKind::Image,
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Build an ACK for the named image.
    pub fn ack(name: impl Into<String>) -> Self {
        Self::control(EnvelopeKind::Ack, name)
    }

    /// Build a DISPLAY_NOW for the named frame.
    pub fn display_now(name: impl Into<String>) -> Self {
        Self::control(EnvelopeKind::DisplayNow, name)
    }

    /// Build a START_TIMER signal.
    pub fn start_timer() -> Self {
        Self::control(EnvelopeKind::StartTimer, String::new())
    }

    fn control(kind: EnvelopeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the envelope, returning its name and payload.
    pub fn into_parts(self) -> (String, Bytes) {
        (self.name, self.payload)
    }

    /// Size of this envelope once encoded.
    pub fn encoded_len(&self) -> usize {
        MIN_ENVELOPE_SIZE + self.name.len() + self.payload.len()
    }

    /// Check the field sizes against the codec limits.
    pub fn check_limits(&self) -> Result<(), FramelinkError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(FramelinkError::PayloadTooLarge {
                field: "name",
                size: self.name.len(),
                max: MAX_NAME_LEN,
            });
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FramelinkError::PayloadTooLarge {
                field: "payload",
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    /// Append the wire encoding to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FramelinkError> {
        self.check_limits()?;
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind as u8);
        dst.put_u32_le(self.name.len() as u32);
        dst.put_slice(self.name.as_bytes());
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Serialize to a standalone buffer.
    pub fn encode(&self) -> Result<Bytes, FramelinkError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Deserialize exactly one envelope from a complete buffer.
    ///
    /// Fails with [`FramelinkError::Framing`] if `data` is truncated or
    /// carries trailing bytes.
    pub fn decode(data: &[u8]) -> Result<Self, FramelinkError> {
        let mut buf = BytesMut::from(data);
        match Self::decode_partial(&mut buf)? {
            Some(envelope) if buf.is_empty() => Ok(envelope),
            Some(_) => Err(FramelinkError::Framing(format!(
                "{} trailing bytes after envelope",
                buf.len()
            ))),
            None => Err(FramelinkError::Framing(format!(
                "truncated envelope: {} bytes",
                data.len()
            ))),
        }
    }

    /// Incremental decode used by [`EnvelopeCodec`](crate::EnvelopeCodec).
    ///
    /// Returns `Ok(None)` without consuming anything until a whole
    /// envelope is buffered. Header fields are validated as soon as
    /// they are visible so garbage is rejected before its body arrives.
    pub(crate) fn decode_partial(src: &mut BytesMut) -> Result<Option<Self>, FramelinkError> {
        if src.is_empty() {
            return Ok(None);
        }
        let kind = EnvelopeKind::try_from(src[0])?;

        let name_at = KIND_SIZE + LENGTH_SIZE;
        if src.len() < name_at {
            return Ok(None);
        }
        let name_len = read_len(&src[KIND_SIZE..name_at]);
        if name_len > MAX_NAME_LEN {
            return Err(FramelinkError::Framing(format!(
                "declared name length {name_len} exceeds {MAX_NAME_LEN}"
            )));
        }

        let payload_len_at = name_at + name_len;
        let payload_at = payload_len_at + LENGTH_SIZE;
        if src.len() < payload_at {
            return Ok(None);
        }
        let payload_len = read_len(&src[payload_len_at..payload_at]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FramelinkError::Framing(format!(
                "declared payload length {payload_len} exceeds {MAX_PAYLOAD_SIZE}"
            )));
        }

        let total = payload_at + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(name_at);
        let name_bytes = frame.split_to(name_len);
        frame.advance(LENGTH_SIZE);
        let payload = frame.freeze();

        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|e| FramelinkError::Framing(format!("name is not valid utf-8: {e}")))?;

        Ok(Some(Self {
            kind,
            name,
            payload,
        }))
    }
}

fn read_len(bytes: &[u8]) -> usize {
    let mut raw = [0u8; LENGTH_SIZE];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw) as usize
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payloads are whole frames; print their size only.
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_try_from_rejects_unknown() {
        assert_eq!(EnvelopeKind::try_from(3).unwrap(), EnvelopeKind::DisplayNow);
        assert!(matches!(
            EnvelopeKind::try_from(0),
            Err(FramelinkError::UnknownType(0))
        ));
        assert!(matches!(
            EnvelopeKind::try_from(0xff),
            Err(FramelinkError::UnknownType(0xff))
        ));
    }

    #[test]
    fn image_roundtrip() {
        let env = Envelope::image("frame__7", vec![1u8, 2, 3, 4, 5]);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.kind(), EnvelopeKind::Image);
        assert_eq!(decoded.payload().as_ref(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn control_envelopes_have_empty_payload() {
        for env in [
            Envelope::ack("a"),
            Envelope::display_now("b"),
            Envelope::start_timer(),
        ] {
            assert!(env.payload().is_empty());
            let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
            assert_eq!(decoded, env);
        }
    }

    #[test]
    fn layout_is_little_endian() {
        let bytes = Envelope::image("ab", vec![9u8; 3]).encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0x1, 2, 0, 0, 0, b'a', b'b', 3, 0, 0, 0, 9, 9, 9]
        );
    }

    #[test]
    fn truncated_buffer_is_framing_error() {
        let bytes = Envelope::image("frame", vec![0u8; 32]).encode().unwrap();
        for cut in [1, 4, 7, bytes.len() - 1] {
            let err = Envelope::decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, FramelinkError::Framing(_)), "cut {cut}: {err}");
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = Envelope::ack("x").encode().unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(FramelinkError::Framing(_))
        ));
    }

    #[test]
    fn unknown_tag_rejected_from_first_byte() {
        let mut buf = BytesMut::from(&[0x42u8][..]);
        assert!(matches!(
            Envelope::decode_partial(&mut buf),
            Err(FramelinkError::UnknownType(0x42))
        ));
    }

    #[test]
    fn oversized_declared_payload_rejected_early() {
        let mut buf = BytesMut::new();
        buf.put_u8(EnvelopeKind::Image as u8);
        buf.put_u32_le(0);
        buf.put_u32_le(u32::MAX);
        assert!(matches!(
            Envelope::decode_partial(&mut buf),
            Err(FramelinkError::Framing(_))
        ));
    }

    #[test]
    fn invalid_utf8_name_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(EnvelopeKind::Ack as u8);
        buf.put_u32_le(2);
        buf.put_slice(&[0xff, 0xfe]);
        buf.put_u32_le(0);
        assert!(matches!(
            Envelope::decode(&buf),
            Err(FramelinkError::Framing(_))
        ));
    }

    #[test]
    fn debug_omits_payload_bytes() {
        let env = Envelope::image("big", vec![0u8; 4096]);
        let text = format!("{env:?}");
        assert!(text.contains("payload_len: 4096"));
        assert!(text.len() < 100);
    }
}
