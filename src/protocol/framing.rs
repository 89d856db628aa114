use log::trace;

use crate::protocol::header::{FrameHeader, PROTOHEADER_LEN};
use crate::protocol::ProtocolError;

/// Where the decoder is inside the current message.
#[derive(Clone, Debug)]
enum Stage {
    ProtoHeader,
    JsonHeader { len: usize },
    Body { header: FrameHeader },
}

/// Incremental parser for `[u16 BE header length][json header][body]` frames.
///
/// Bytes are pushed as they come off the socket; a push may complete zero,
/// one or several messages, and a message may straddle any number of pushes.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    stage: Stage,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            stage: Stage::ProtoHeader,
        }
    }

    /// Bytes received but not yet consumed by a completed stage.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends every message completed by `bytes` to `out` and returns how
    /// many were added. Messages completed before a framing error stay in
    /// `out`; the decoder is unusable after the error.
    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<String>) -> Result<usize, ProtocolError> {
        self.buffer.extend_from_slice(bytes);
        let before = out.len();
        let mut cursor = 0;
        let result = self.drain_frames(&mut cursor, out);
        self.buffer.drain(..cursor);
        result.map(|()| out.len() - before)
    }

    fn drain_frames(&mut self, cursor: &mut usize, out: &mut Vec<String>) -> Result<(), ProtocolError> {
        loop {
            let available = self.buffer.len() - *cursor;
            match &self.stage {
                Stage::ProtoHeader => {
                    if available < PROTOHEADER_LEN {
                        return Ok(());
                    }
                    let at = *cursor;
                    let len = u16::from_be_bytes([self.buffer[at], self.buffer[at + 1]]) as usize;
                    *cursor += PROTOHEADER_LEN;
                    self.stage = Stage::JsonHeader { len };
                }
                Stage::JsonHeader { len } => {
                    let len = *len;
                    if available < len {
                        return Ok(());
                    }
                    let header = FrameHeader::from_json(&self.buffer[*cursor..*cursor + len])?;
                    header.encoding()?;
                    *cursor += len;
                    self.stage = Stage::Body { header };
                }
                Stage::Body { header } => {
                    let len = header.content_length as usize;
                    if available < len {
                        return Ok(());
                    }
                    let message = header.encoding()?.decode(&self.buffer[*cursor..*cursor + len])?;
                    *cursor += len;
                    trace!("frame complete: {} body bytes", len);
                    out.push(message);
                    self.stage = Stage::ProtoHeader;
                }
            }
        }
    }
}

/// Wraps a UTF-8 json body into a complete outbound frame.
pub fn encode_frame(body: &str) -> Result<Vec<u8>, ProtocolError> {
    let body = body.as_bytes();
    let header = FrameHeader::outbound(body.len()).to_string();
    let header_len = u16::try_from(header.len())
        .map_err(|_| ProtocolError::HeaderTooLarge(header.len()))?;
    let mut frame = Vec::with_capacity(PROTOHEADER_LEN + header.len() + body.len());
    frame.extend_from_slice(&header_len.to_be_bytes());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn push_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        decoder.push(bytes, &mut out).unwrap();
        out
    }

    fn frame_with(encoding: &str, body: &[u8]) -> Vec<u8> {
        let header = format!(
            r#"{{"byteorder":"little","content-type":"text/json","content-encoding":"{}","content-length":{}}}"#,
            encoding,
            body.len()
        );
        let mut frame = (header.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn decodes_a_whole_frame() {
        let frame = encode_frame(r#"{"event_type":"play"}"#).unwrap();
        let mut decoder = FrameDecoder::new();
        assert_eq!(push_all(&mut decoder, &frame), vec![r#"{"event_type":"play"}"#]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn proto_header_is_big_endian() {
        let frame = encode_frame("{}").unwrap();
        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let header = FrameHeader::from_json(&frame[2..2 + declared]).unwrap();
        assert_eq!(header.content_length, 2);
        assert_eq!(&frame[2 + declared..], b"{}");
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut stream = encode_frame(r#"{"event_type":"pause"}"#).unwrap();
        stream.extend(encode_frame(r#"{"event_type":"resume"}"#).unwrap());
        stream.extend(encode_frame(r#"{"event_type":"stop"}"#).unwrap());
        let mut decoder = FrameDecoder::new();
        let messages = push_all(&mut decoder, &stream);
        assert_eq!(messages.len(), 3);
        assert!(messages[1].contains("resume"));
    }

    #[test]
    fn byte_at_a_time_matches_whole() {
        let frame = encode_frame(r#"{"event_type":"selection","selection_coords":[0,1,2]}"#).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for b in &frame {
            out.extend(push_all(&mut decoder, std::slice::from_ref(b)));
        }
        assert_eq!(out, vec![r#"{"event_type":"selection","selection_coords":[0,1,2]}"#]);
    }

    #[test]
    fn random_splits_match_whole_stream() {
        let bodies = [
            r#"{"event_type":"play"}"#.to_string(),
            format!(r#"{{"event_type":"exception","exception":"{}"}}"#, "x".repeat(5000)),
            r#"{"event_type":"selection","selection_coords":[0,3,1]}"#.to_string(),
        ];
        let mut stream = Vec::new();
        for body in &bodies {
            stream.extend(encode_frame(body).unwrap());
        }
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let mut decoder = FrameDecoder::new();
            let mut out = Vec::new();
            let mut pos = 0;
            while pos < stream.len() {
                let take = rng.gen_range(1..=(stream.len() - pos).min(700));
                out.extend(push_all(&mut decoder, &stream[pos..pos + take]));
                pos += take;
            }
            assert_eq!(out, bodies);
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let frame = encode_frame(r#"{"event_type":"stop"}"#).unwrap();
        let mut decoder = FrameDecoder::new();
        assert!(push_all(&mut decoder, &frame[..1]).is_empty());
        assert!(push_all(&mut decoder, &frame[1..frame.len() - 1]).is_empty());
        assert_eq!(push_all(&mut decoder, &frame[frame.len() - 1..]).len(), 1);
    }

    #[test]
    fn decodes_declared_utf16_body() {
        let body: Vec<u8> = r#"{"event_type":"play"}"#
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let mut decoder = FrameDecoder::new();
        let messages = push_all(&mut decoder, &frame_with("unicode", &body));
        assert_eq!(messages, vec![r#"{"event_type":"play"}"#]);
    }

    #[test]
    fn unknown_encoding_fails_at_header() {
        let mut decoder = FrameDecoder::new();
        let frame = frame_with("ebcdic", b"{}");
        assert!(matches!(
            decoder.push(&frame, &mut Vec::new()),
            Err(ProtocolError::UnknownEncoding(_))
        ));
    }

    #[test]
    fn empty_body_is_a_message() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(push_all(&mut decoder, &frame_with("utf-8", b"")), vec![String::new()]);
    }

    #[test]
    fn messages_before_a_corrupt_frame_survive() {
        let mut stream = encode_frame(r#"{"event_type":"stop"}"#).unwrap();
        let garbage = b"{not json";
        stream.extend_from_slice(&(garbage.len() as u16).to_be_bytes());
        stream.extend_from_slice(garbage);
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        assert!(matches!(
            decoder.push(&stream, &mut out),
            Err(ProtocolError::MalformedHeader(_))
        ));
        assert_eq!(out, vec![r#"{"event_type":"stop"}"#]);
    }
}
