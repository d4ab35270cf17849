use crate::error::Error;
use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::Read;

/// The 4-byte tail every Sync-flushed raw deflate block ends with. Removed
/// before a compressed payload goes on the wire and appended back before
/// inflating, per permessage-deflate.
const DEFLATE_TRAILER: [u8; 4] = [0, 0, 255, 255];

/// Scratch buffers track the message size but stay capped, so a huge
/// message recycles one bounded buffer across passes.
const SCRATCH_MIN: usize = 1024;
const SCRATCH_MAX: usize = 32 * 1024;

/// Permessage-deflate compressor for one direction of a connection.
///
/// With context takeover (the default) the sliding window survives across
/// messages, so later messages compress against earlier ones. When the
/// negotiation carried a `no_context_takeover` option the context is reset
/// before every message instead.
pub struct Encoder {
    compressor: Compress,
    reset_context: bool,
}

impl Encoder {
    pub fn new(reset_context: bool) -> Self {
        let compressor = Compress::new(Compression::default(), false);
        Self {
            compressor,
            reset_context,
        }
    }

    /// Deflates a whole message and strips the trailing `00 00 FF FF`.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if self.reset_context {
            self.compressor.reset();
        }

        let mut deflated = Vec::with_capacity(payload.len() / 2 + 64);
        let mut scratch = Vec::with_capacity(payload.len().clamp(SCRATCH_MIN, SCRATCH_MAX));

        // total_in keeps counting across messages under context takeover;
        // what this call consumed is the per-pass delta.
        let mut consumed = 0;
        while consumed < payload.len() {
            let in_before = self.compressor.total_in();
            let status = self
                .compressor
                .compress_vec(&payload[consumed..], &mut scratch, FlushCompress::None)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (self.compressor.total_in() - in_before) as usize;
            deflated.append(&mut scratch);
            if status == Status::StreamEnd {
                break;
            }
        }

        // Terminate with a sync flush so the peer can inflate the message
        // without a stream end.
        loop {
            self.compressor
                .compress_vec(&[], &mut scratch, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            if scratch.is_empty() {
                break;
            }
            deflated.append(&mut scratch);
        }

        // rm_tail: the wire format omits the flush trailer.
        if deflated.ends_with(&DEFLATE_TRAILER) {
            deflated.truncate(deflated.len() - DEFLATE_TRAILER.len());
        }

        Ok(deflated)
    }
}

/// Permessage-deflate decompressor, the mirror of [`Encoder`].
pub struct Decoder {
    decompressor: Decompress,
    reset_context: bool,
}

impl Decoder {
    pub fn new(reset_context: bool) -> Self {
        let decompressor = Decompress::new(false);
        Self {
            decompressor,
            reset_context,
        }
    }

    /// Inflates a whole message, re-appending the flush trailer first
    /// (set_tail), since the sender stripped it.
    pub fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        if self.reset_context {
            self.decompressor.reset(false);
        }

        let mut inflated = Vec::new();
        let mut scratch = Vec::with_capacity(input.len().clamp(SCRATCH_MIN, SCRATCH_MAX));

        // Same per-pass delta accounting as the encoder: total_in is
        // cumulative over the whole context.
        let mut consumed = 0;
        while consumed < input.len() {
            let in_before = self.decompressor.total_in();
            let status = self
                .decompressor
                .decompress_vec(&input[consumed..], &mut scratch, FlushDecompress::Sync)
                .map_err(|e| Error::Decompression(e.to_string()))?;
            let step = (self.decompressor.total_in() - in_before) as usize;
            consumed += step;
            let produced = scratch.len();
            inflated.append(&mut scratch);

            match status {
                Status::StreamEnd => break,
                _ if step == 0 && produced == 0 => {
                    // Stalled with input left over: truncated or corrupt.
                    return Err(Error::Decompression("truncated deflate stream".into()));
                }
                _ => {}
            }
        }

        Ok(inflated)
    }
}

/// Application-level body transformation, orthogonal to TLS. When
/// configured, encryption runs before compression on the way out and
/// decryption after decompression on the way in.
pub trait BodyCipher: Send + Sync + std::fmt::Debug {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// `Content-Encoding` codings supported for HTTP bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Deflate,
    Gzip,
}

impl ContentCoding {
    pub fn from_token(token: &str) -> Result<Self, Error> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(ContentCoding::Identity),
            "deflate" => Ok(ContentCoding::Deflate),
            "gzip" | "x-gzip" => Ok(ContentCoding::Gzip),
            other => Err(Error::UnknownContentCoding(other.to_string())),
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            ContentCoding::Identity => "identity",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Gzip => "gzip",
        }
    }

    /// Value for the `Accept-Encoding` request header.
    pub fn accept_header() -> &'static str {
        "gzip, deflate"
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        match self {
            ContentCoding::Identity => out.extend_from_slice(data),
            ContentCoding::Deflate => {
                ZlibEncoder::new(data, Compression::default())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Compression(e.to_string()))?;
            }
            ContentCoding::Gzip => {
                GzEncoder::new(data, Compression::default())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Compression(e.to_string()))?;
            }
        }
        Ok(out)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        match self {
            ContentCoding::Identity => out.extend_from_slice(data),
            ContentCoding::Deflate => {
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Decompression(e.to_string()))?;
            }
            ContentCoding::Gzip => {
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Decompression(e.to_string()))?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_roundtrip() {
        let mut encoder = Encoder::new(false);
        let mut decoder = Decoder::new(false);

        let payload = b"a payload that deflates: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let compressed = encoder.compress(payload).unwrap();
        assert!(!compressed.ends_with(&DEFLATE_TRAILER));

        let restored = decoder.decompress(&compressed).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_context_takeover_shrinks_repeats() {
        let mut encoder = Encoder::new(false);
        let mut decoder = Decoder::new(false);

        let payload = vec![b'x'; 4096];
        let first = encoder.compress(&payload).unwrap();
        let second = encoder.compress(&payload).unwrap();
        // The second message compresses against the kept window.
        assert!(second.len() <= first.len());

        assert_eq!(decoder.decompress(&first).unwrap(), payload);
        assert_eq!(decoder.decompress(&second).unwrap(), payload);
    }

    #[test]
    fn test_no_context_takeover_is_stable() {
        let mut encoder = Encoder::new(true);
        let mut decoder = Decoder::new(true);

        let payload = b"repeated text repeated text repeated text";
        let first = encoder.compress(payload).unwrap();
        let second = encoder.compress(payload).unwrap();
        assert_eq!(first, second);

        assert_eq!(decoder.decompress(&first).unwrap(), payload.to_vec());
        assert_eq!(decoder.decompress(&second).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_content_coding_roundtrip() {
        let data = b"The quick brown fox jumps over the lazy dog".repeat(20);
        for coding in [ContentCoding::Deflate, ContentCoding::Gzip] {
            let packed = coding.compress(&data).unwrap();
            assert_ne!(packed, data);
            assert_eq!(coding.decompress(&packed).unwrap(), data);
        }
        let plain = ContentCoding::Identity.compress(&data).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn test_unknown_coding_rejected() {
        assert!(ContentCoding::from_token("br").is_err());
        assert_eq!(
            ContentCoding::from_token("GZIP").unwrap(),
            ContentCoding::Gzip
        );
    }
}
