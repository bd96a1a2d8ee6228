// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 16;

/// Upper bound on a single frame; a peer announcing more is treated as
/// corrupt rather than allocated for.
const MAX_FRAME_LEN: u64 = 1 << 31;

/// One message on a runtime socket: `[length: u64][type: u64][payload]`,
/// little endian, where `length` counts the payload bytes only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u64, payload: impl Into<Bytes>) -> Self {
        Frame {
            message_type,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, std::io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let length = header.get_u64_le();
        let message_type = header.get_u64_le();

        if length > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {length} bytes exceeds the protocol limit"),
            ));
        }

        let length = length as usize;
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame {
            message_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u64_le(frame.payload.len() as u64);
        dst.put_u64_le(frame.message_type);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn frames_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let frame = Frame::new(7, vec![1u8, 2, 3, 4]);
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(1, vec![9u8; 32]), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(20);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u64_le(u64::MAX);
        buf.put_u64_le(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
