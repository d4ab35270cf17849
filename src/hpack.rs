use crate::error::Error;

/// HPACK coding contexts (RFC 7541), one per direction of an HTTP/2 session.
/// The dynamic tables live as long as the session, so the same instance must
/// decode every header block the peer sends, in order.
pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Decoder::new(),
        }
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>, Error> {
        let pairs = self.inner.decode(block).map_err(|_| Error::H2Compression)?;
        Ok(pairs
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }
}

pub struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Encoder::new(),
        }
    }

    pub fn encode(&mut self, headers: &[(String, String)]) -> Vec<u8> {
        let pairs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
            .collect();
        self.inner.encode(pairs)
    }
}

impl std::fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder").finish()
    }
}

impl std::fmt::Debug for HpackEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackEncoder").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = HpackEncoder::new();
        let mut decoder = HpackDecoder::new();

        let headers = vec![
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), "https".to_string()),
            (":authority".to_string(), "example.com".to_string()),
            (":path".to_string(), "/".to_string()),
            ("accept".to_string(), "*/*".to_string()),
        ];
        let block = encoder.encode(&headers);
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn test_dynamic_table_survives_messages() {
        let mut encoder = HpackEncoder::new();
        let mut decoder = HpackDecoder::new();

        let headers = vec![("x-custom".to_string(), "abcdefgh".to_string())];
        let first = encoder.encode(&headers);
        let second = encoder.encode(&headers);
        // Second block references the dynamic table entry instead of
        // repeating the literal.
        assert!(second.len() < first.len());

        assert_eq!(decoder.decode(&first).unwrap(), headers);
        assert_eq!(decoder.decode(&second).unwrap(), headers);
    }

    #[test]
    fn test_garbage_block_fails() {
        let mut decoder = HpackDecoder::new();
        assert!(decoder.decode(&[0xFF, 0xFF, 0xFF, 0x00, 0x01]).is_err());
    }
}
