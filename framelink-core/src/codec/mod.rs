//! Framed envelope codec for `tokio_util`.
//!
//! The receive task may see an envelope split across any number of
//! socket reads; [`EnvelopeCodec`] buffers until a whole envelope is
//! available and never consumes a partial one, so later envelope
//! boundaries stay intact.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::FramelinkError;

#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FramelinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Envelope::decode_partial(src)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(envelope) => Ok(Some(envelope)),
            None if buf.is_empty() => Ok(None),
            None => Err(FramelinkError::Framing(format!(
                "stream ended inside an envelope ({} bytes buffered)",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FramelinkError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
