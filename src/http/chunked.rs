//! RFC 7230 chunked transfer-encoding codec (§4.3 "Body decoding", §6 "Chunked
//! transfer", §8 round-trip property).
//!
//! No extensions are parsed or required (§6). The trailer is accepted but its
//! contents are discarded (§6).

use bytes::{Bytes, BytesMut};

use crate::error::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ChunkSizeLine,
    ChunkData(usize),
    ChunkDataCrlf,
    TrailerOrFinalCrlf,
    TrailerLine,
    Done,
}

/// Incremental chunked-body decoder. Feed it raw bytes as they arrive off the
/// wire; it yields fully-decoded entity chunks and reports when the terminating
/// `0\r\n\r\n` (plus any trailer) has been consumed.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line_buf: BytesMut,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::ChunkSizeLine,
            line_buf: BytesMut::new(),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feeds `input` into the decoder, appending any newly-decoded entity bytes
    /// into `out` and returning how many bytes of `input` were consumed (always
    /// all of it unless a parse error is hit first).
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), HttpError> {
        let mut cursor = input;
        while !cursor.is_empty() && self.state != State::Done {
            match self.state {
                State::ChunkSizeLine => {
                    if let Some(pos) = find_crlf(cursor) {
                        self.line_buf.extend_from_slice(&cursor[..pos]);
                        cursor = &cursor[pos + 2..];
                        let line = String::from_utf8_lossy(&self.line_buf).into_owned();
                        self.line_buf.clear();
                        let size_str = line.split(';').next().unwrap_or("").trim();
                        let size = usize::from_str_radix(size_str, 16).map_err(|_| {
                            HttpError::BadResponse(format!("bad chunk size: {size_str:?}"))
                        })?;
                        self.state = if size == 0 {
                            State::TrailerOrFinalCrlf
                        } else {
                            State::ChunkData(size)
                        };
                    } else {
                        self.line_buf.extend_from_slice(cursor);
                        cursor = &[];
                    }
                }
                State::ChunkData(remaining) => {
                    let take = remaining.min(cursor.len());
                    out.extend_from_slice(&cursor[..take]);
                    cursor = &cursor[take..];
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        State::ChunkDataCrlf
                    } else {
                        State::ChunkData(remaining)
                    };
                }
                State::ChunkDataCrlf => {
                    if cursor.len() < 2 {
                        // Wait for both CRLF bytes before proceeding.
                        if cursor.len() == 1 && cursor[0] == b'\r' {
                            cursor = &cursor[1..];
                        }
                        break;
                    }
                    if &cursor[..2] != b"\r\n" {
                        return Err(HttpError::BadResponse(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    cursor = &cursor[2..];
                    self.state = State::ChunkSizeLine;
                }
                State::TrailerOrFinalCrlf | State::TrailerLine => {
                    if let Some(pos) = find_crlf(cursor) {
                        let line_empty = pos == 0 && self.line_buf.is_empty();
                        cursor = &cursor[pos + 2..];
                        if line_empty {
                            self.state = State::Done;
                        } else {
                            self.line_buf.clear();
                            self.state = State::TrailerLine;
                        }
                    } else {
                        self.line_buf.extend_from_slice(cursor);
                        cursor = &[];
                    }
                }
                State::Done => break,
            }
        }
        Ok(())
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Encodes `data` as a single RFC 7230 chunk followed by the terminating chunk
/// and empty trailer. Used by tests to exercise the encode/decode round-trip
/// (§8) and by the file-transfer upload path is not needed here since uploads
/// use `Content-Length`, not chunked encoding.
#[must_use]
pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Bytes {
    let mut out = BytesMut::new();
    if chunk_size == 0 {
        out.extend_from_slice(b"0\r\n\r\n");
        return out.freeze();
    }
    for chunk in data.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_spec_s3_example() {
        let input = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.feed(input, &mut out).unwrap();
        assert!(decoder.is_done());
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn zero_length_body_completes_without_data() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.feed(b"0\r\n\r\n", &mut out).unwrap();
        assert!(decoder.is_done());
        assert!(out.is_empty());
    }

    #[test]
    fn handles_byte_at_a_time_feeding() {
        let input = b"3\r\nabc\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        for b in input {
            decoder.feed(&[*b], &mut out).unwrap();
        }
        assert!(decoder.is_done());
        assert_eq!(out, b"abc");
    }

    #[test]
    fn trailer_is_accepted_and_discarded() {
        let input = b"3\r\nabc\r\n0\r\nX-Trailer: ignored\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.feed(input, &mut out).unwrap();
        assert!(decoder.is_done());
        assert_eq!(out, b"abc");
    }

    #[test]
    fn bad_chunk_size_is_a_parse_error() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let err = decoder.feed(b"zz\r\n", &mut out).unwrap_err();
        assert!(matches!(err, HttpError::BadResponse(_)));
    }

    #[test]
    fn round_trip_identity() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let encoded = encode_chunked(&original, 17);
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.feed(&encoded, &mut out).unwrap();
        assert!(decoder.is_done());
        assert_eq!(out, original);
    }

    proptest::proptest! {
        /// §8 "Chunked encoding round-trip (encode N bytes, decode) == identity",
        /// generalized over arbitrary bodies, chunk sizes, and feed granularity.
        #[test]
        fn round_trip_identity_for_arbitrary_bodies_and_chunk_sizes(
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2048),
            chunk_size in 1usize..256,
            feed_granularity in 1usize..64,
        ) {
            let encoded = encode_chunked(&body, chunk_size);
            let mut decoder = ChunkedDecoder::new();
            let mut out = Vec::new();
            for piece in encoded.chunks(feed_granularity) {
                decoder.feed(piece, &mut out).unwrap();
            }
            proptest::prop_assert!(decoder.is_done());
            proptest::prop_assert_eq!(out, body.to_vec());
        }
    }
}
