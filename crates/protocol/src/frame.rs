//! Stream demultiplexer: binary chunk frames and newline-terminated JSON.
//!
//! ```text
//! [2 bytes: magic][4 bytes BE: total_len]
//!   [1 byte: frame_type][2 bytes BE: id_len][id_len bytes: transfer_id]
//!   [4 bytes BE: chunk_index][rest: payload]
//! ```
//!
//! `total_len` covers everything after the length field. JSON messages start
//! with `{` and end with `\n`.

use crate::ProtocolError;
use crate::constants::{
    CHUNK_FRAME_FIXED_LEN, FRAME_MAGIC, FRAME_PREFIX_LEN, FRAME_TYPE_FILE_CHUNK, MAX_FRAME_LEN,
    MAX_JSON_LINE_LEN,
};

/// A complete binary chunk frame extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryChunk {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub frame_type: u8,
    pub data: Vec<u8>,
    /// Bytes to drop from the front of the buffer.
    pub consumed: usize,
}

/// Outcome of one [`parse_next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// Drop this many bytes and try again.
    Skip(usize),
    /// One JSON line (without the trailing newline).
    Json { text: String, consumed: usize },
    BinaryChunk(BinaryChunk),
}

impl ParseResult {
    /// Number of bytes the caller must remove from the buffer.
    pub fn consumed(&self) -> usize {
        match self {
            Self::Incomplete => 0,
            Self::Skip(n) => *n,
            Self::Json { consumed, .. } => *consumed,
            Self::BinaryChunk(chunk) => chunk.consumed,
        }
    }
}

/// Extracts the next item from the front of `buf`.
///
/// Never fails: a leading byte that opens neither a frame nor a JSON object
/// is skipped, so the stream cannot deadlock on garbage.
pub fn parse_next(buf: &[u8]) -> ParseResult {
    let Some(&first) = buf.first() else {
        return ParseResult::Incomplete;
    };

    if first == FRAME_MAGIC[0] {
        match buf.get(1) {
            None => return ParseResult::Incomplete,
            Some(&second) if second == FRAME_MAGIC[1] => return parse_frame(buf),
            Some(_) => {}
        }
    }

    if first == b'{' {
        return parse_json_line(buf);
    }

    ParseResult::Skip(1)
}

fn parse_frame(buf: &[u8]) -> ParseResult {
    if buf.len() < FRAME_PREFIX_LEN {
        return ParseResult::Incomplete;
    }

    let total_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    if total_len > MAX_FRAME_LEN {
        tracing::warn!(total_len, "frame length exceeds maximum, resynchronising");
        return ParseResult::Skip(1);
    }

    let frame_len = FRAME_PREFIX_LEN + total_len;
    if buf.len() < frame_len {
        return ParseResult::Incomplete;
    }

    let body = &buf[FRAME_PREFIX_LEN..frame_len];
    let Some(&frame_type) = body.first() else {
        return ParseResult::Skip(frame_len);
    };

    if frame_type != FRAME_TYPE_FILE_CHUNK {
        tracing::debug!(frame_type, frame_len, "skipping unknown frame type");
        return ParseResult::Skip(frame_len);
    }

    if body.len() < CHUNK_FRAME_FIXED_LEN {
        tracing::warn!(frame_len, "chunk frame shorter than its fixed header");
        return ParseResult::Skip(frame_len);
    }

    let id_len = u16::from_be_bytes([body[1], body[2]]) as usize;
    let id_end = 3 + id_len;
    if body.len() < id_end + 4 {
        tracing::warn!(id_len, frame_len, "transfer id overruns chunk frame");
        return ParseResult::Skip(frame_len);
    }

    let transfer_id = match std::str::from_utf8(&body[3..id_end]) {
        Ok(id) => id.to_owned(),
        Err(e) => {
            tracing::warn!("chunk frame transfer id is not UTF-8: {e}");
            return ParseResult::Skip(frame_len);
        }
    };

    let chunk_index = u32::from_be_bytes([
        body[id_end],
        body[id_end + 1],
        body[id_end + 2],
        body[id_end + 3],
    ]);

    ParseResult::BinaryChunk(BinaryChunk {
        transfer_id,
        chunk_index,
        frame_type,
        data: body[id_end + 4..].to_vec(),
        consumed: frame_len,
    })
}

fn parse_json_line(buf: &[u8]) -> ParseResult {
    // Only look as far as the longest legal line, so the decision does not
    // depend on how much trailing data happens to be buffered.
    let window = &buf[..buf.len().min(MAX_JSON_LINE_LEN + 1)];
    match window.iter().position(|&b| b == b'\n') {
        Some(pos) => ParseResult::Json {
            text: String::from_utf8_lossy(&buf[..pos]).into_owned(),
            consumed: pos + 1,
        },
        None if buf.len() > MAX_JSON_LINE_LEN => {
            tracing::warn!("JSON line exceeds maximum length, resynchronising");
            ParseResult::Skip(1)
        }
        None => ParseResult::Incomplete,
    }
}

/// Encodes a file chunk as a binary frame.
pub fn encode_chunk_frame(
    transfer_id: &str,
    chunk_index: u32,
    data: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let id = transfer_id.as_bytes();
    if id.len() > u16::MAX as usize {
        return Err(ProtocolError::TransferIdTooLong(id.len()));
    }

    let total_len = CHUNK_FRAME_FIXED_LEN + id.len() + data.len();
    if total_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(total_len));
    }

    let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN + total_len);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&(total_len as u32).to_be_bytes());
    buf.push(FRAME_TYPE_FILE_CHUNK);
    buf.extend_from_slice(&(id.len() as u16).to_be_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(&chunk_index.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs the parser to exhaustion the way the transport does.
    fn drain(buf: &mut Vec<u8>, out: &mut Vec<ParseResult>) {
        loop {
            let result = parse_next(buf);
            if result == ParseResult::Incomplete {
                break;
            }
            buf.drain(..result.consumed());
            out.push(result);
        }
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"{\"type\":\"ping\"}\n");
        stream.extend_from_slice(&encode_chunk_frame("t1", 0, b"abcd").unwrap());
        stream.extend_from_slice(b"\r\n");
        stream.extend_from_slice(&encode_chunk_frame("t1", 1, &[0xFD; 300]).unwrap());
        stream.extend_from_slice(b"{\"type\":\"file_end\",\"transferId\":\"t1\"}\n");
        stream
    }

    #[test]
    fn parse_chunk_frame() {
        let frame = encode_chunk_frame("transfer-1", 7, b"payload").unwrap();
        match parse_next(&frame) {
            ParseResult::BinaryChunk(chunk) => {
                assert_eq!(chunk.transfer_id, "transfer-1");
                assert_eq!(chunk.chunk_index, 7);
                assert_eq!(chunk.frame_type, FRAME_TYPE_FILE_CHUNK);
                assert_eq!(chunk.data, b"payload");
                assert_eq!(chunk.consumed, frame.len());
            }
            other => panic!("expected BinaryChunk, got {other:?}"),
        }
    }

    #[test]
    fn parse_json_line_consumes_newline() {
        let buf = b"{\"type\":\"ping\"}\n{\"type\"";
        match parse_next(buf) {
            ParseResult::Json { text, consumed } => {
                assert_eq!(text, "{\"type\":\"ping\"}");
                assert_eq!(consumed, 16);
            }
            other => panic!("expected Json, got {other:?}"),
        }
    }

    #[test]
    fn json_without_newline_is_incomplete() {
        assert_eq!(parse_next(b"{\"type\":\"pi"), ParseResult::Incomplete);
    }

    #[test]
    fn empty_buffer_is_incomplete() {
        assert_eq!(parse_next(&[]), ParseResult::Incomplete);
    }

    #[test]
    fn single_magic_byte_waits() {
        assert_eq!(parse_next(&[FRAME_MAGIC[0]]), ParseResult::Incomplete);
    }

    #[test]
    fn garbage_byte_is_skipped() {
        assert_eq!(parse_next(b"x{\"a\":1}\n"), ParseResult::Skip(1));
        assert_eq!(parse_next(&[FRAME_MAGIC[0], 0x00]), ParseResult::Skip(1));
        assert_eq!(parse_next(b"\n"), ParseResult::Skip(1));
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let frame = encode_chunk_frame("t1", 0, b"abcdef").unwrap();
        for cut in 1..frame.len() {
            assert_eq!(parse_next(&frame[..cut]), ParseResult::Incomplete, "cut at {cut}");
        }
    }

    #[test]
    fn unknown_frame_type_skips_whole_frame() {
        let mut frame = encode_chunk_frame("t1", 0, b"abc").unwrap();
        frame[FRAME_PREFIX_LEN] = 0x7F;
        assert_eq!(parse_next(&frame), ParseResult::Skip(frame.len()));
    }

    #[test]
    fn malformed_id_length_skips_whole_frame() {
        let mut frame = encode_chunk_frame("t1", 0, b"").unwrap();
        // Claim a 200-byte id inside a 9-byte body.
        frame[FRAME_PREFIX_LEN + 1] = 0;
        frame[FRAME_PREFIX_LEN + 2] = 200;
        assert_eq!(parse_next(&frame), ParseResult::Skip(frame.len()));
    }

    #[test]
    fn oversized_length_resynchronises() {
        let mut buf = FRAME_MAGIC.to_vec();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(parse_next(&buf), ParseResult::Skip(1));
    }

    #[test]
    fn overlong_json_line_is_skipped() {
        let mut buf = vec![b'{'];
        buf.resize(MAX_JSON_LINE_LEN + 1, b'a');
        assert_eq!(parse_next(&buf), ParseResult::Skip(1));
        buf.pop();
        assert_eq!(parse_next(&buf), ParseResult::Incomplete);
    }

    #[test]
    fn empty_chunk_payload() {
        let frame = encode_chunk_frame("t1", 3, &[]).unwrap();
        match parse_next(&frame) {
            ParseResult::BinaryChunk(chunk) => assert!(chunk.data.is_empty()),
            other => panic!("expected BinaryChunk, got {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_long_transfer_id() {
        let id = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            encode_chunk_frame(&id, 0, b""),
            Err(ProtocolError::TransferIdTooLong(_))
        ));
    }

    #[test]
    fn stream_parse_is_boundary_insensitive() {
        let stream = sample_stream();

        let mut whole = stream.clone();
        let mut expected = Vec::new();
        drain(&mut whole, &mut expected);
        assert!(whole.is_empty());
        assert_eq!(expected.len(), 6); // ping, chunk, \r, \n, chunk, file_end

        for step in [1, 2, 3, 5, 7, 64, 333] {
            let mut buf = Vec::new();
            let mut got = Vec::new();
            for piece in stream.chunks(step) {
                buf.extend_from_slice(piece);
                drain(&mut buf, &mut got);
            }
            assert!(buf.is_empty(), "step {step} left bytes behind");
            assert_eq!(got, expected, "step {step}");
        }
    }
}
