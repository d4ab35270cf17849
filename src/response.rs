use crate::compression::ContentCoding;
use crate::error::Error;
use crate::headers::Headers;
use crate::http1::Http1Parser;

/// A finished HTTP exchange as seen by the caller.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Content coding the body arrived with, before it was decoded.
    pub coding: ContentCoding,
}

impl Response {
    /// Collects the parsed message out of an HTTP/1.1 parser, decoding the
    /// body when the server compressed it.
    pub fn from_parser(parser: &mut Http1Parser) -> Result<Self, Error> {
        let mut response = Response {
            status: parser.status(),
            reason: parser.reason().to_string(),
            headers: parser.headers().clone(),
            body: parser.take_body(),
            coding: ContentCoding::Identity,
        };
        response.decode_body()?;
        Ok(response)
    }

    /// Assembles a response from decoded HTTP/2 headers (`:status` pseudo
    /// header) plus the accumulated stream body.
    pub fn from_h2(headers: Vec<(String, String)>, body: Vec<u8>) -> Result<Self, Error> {
        let mut response = Response {
            status: 0,
            reason: String::new(),
            headers: Headers::new(),
            body,
            coding: ContentCoding::Identity,
        };
        for (name, value) in headers {
            if name == ":status" {
                response.status = value.parse().map_err(|_| Error::MalformedStartLine)?;
            } else if !name.starts_with(':') {
                response.headers.insert(name, value);
            }
        }
        if response.status == 0 {
            return Err(Error::MalformedStartLine);
        }
        response.decode_body()?;
        Ok(response)
    }

    fn decode_body(&mut self) -> Result<(), Error> {
        if let Some(value) = self.headers.get("content-encoding") {
            let coding = ContentCoding::from_token(value)?;
            if coding != ContentCoding::Identity && !self.body.is_empty() {
                self.body = coding.decompress(&self.body)?;
            }
            self.coding = coding;
        }
        Ok(())
    }

    /// 2xx check, the `ok` flag of the data model.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Synthetic response emitted when a connection dies with a request
    /// pending, so every submitted request still sees a terminal callback.
    pub fn synthetic(status: u16, reason: &str) -> Self {
        Response {
            status,
            reason: reason.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
            coding: ContentCoding::Identity,
        }
    }

    pub fn text(&self) -> Result<String, Error> {
        Ok(String::from_utf8(self.body.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use crate::http1::MessageKind;

    #[test]
    fn test_ok_flag() {
        assert!(Response::synthetic(200, "OK").ok());
        assert!(Response::synthetic(299, "").ok());
        assert!(!Response::synthetic(301, "Moved Permanently").ok());
        assert!(!Response::synthetic(500, "Internal Server Error").ok());
    }

    #[test]
    fn test_from_parser_decodes_gzip_body() {
        let body = ContentCoding::Gzip.compress(b"payload").unwrap();
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let mut parser = Http1Parser::new(MessageKind::Response);
        let mut buf = BytesMut::from(&raw[..]);
        assert!(parser.feed(&mut buf).unwrap());

        let response = Response::from_parser(&mut parser).unwrap();
        assert_eq!(response.body, b"payload");
        assert_eq!(response.coding, ContentCoding::Gzip);
    }

    #[test]
    fn test_from_h2_extracts_status() {
        let headers = vec![
            (":status".to_string(), "301".to_string()),
            ("location".to_string(), "https://new/path".to_string()),
        ];
        let response = Response::from_h2(headers, Vec::new()).unwrap();
        assert_eq!(response.status, 301);
        assert_eq!(response.headers.get("location"), Some("https://new/path"));
        assert!(!response.ok());
    }

    #[test]
    fn test_from_h2_requires_status() {
        assert!(Response::from_h2(vec![("x".into(), "y".into())], Vec::new()).is_err());
    }
}
