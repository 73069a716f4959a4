//! tokio-util codec over the core frame model.

use bytes::BytesMut;
use nosq_core::wire::{decode_frame, Frame};
use nosq_core::DbError;
use tokio_util::codec::{Decoder, Encoder};

/// Stateless frame codec for `Framed<TcpStream, FrameCodec>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DbError> {
        decode_frame(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DbError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), DbError> {
        frame.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use nosq_core::wire::MessageType;

    use super::*;

    #[test]
    fn encoder_decoder_round_trip() {
        let mut codec = FrameCodec;
        let frame = Frame::new(MessageType::Command, Bytes::from_static(b"{}"));
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
