use crate::error::Error;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// Negotiated permessage-deflate parameters.
///
/// The takeover options affect both sides of a compression context: when the
/// client asks `client_no_context_takeover` and the server accepts, the
/// client resets its compressor after each message and the server resets the
/// matching decompressor. The window-bits options trade memory for ratio,
/// 15 compresses best, 8 is cheapest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extensions {
    /// Dictates if compression is enabled
    pub permessage_deflate: bool,
    pub client_no_context_takeover: Option<bool>,
    pub server_no_context_takeover: Option<bool>,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

impl Extensions {
    /// Plain permessage-deflate with default parameters.
    pub fn deflate() -> Self {
        Extensions {
            permessage_deflate: true,
            ..Default::default()
        }
    }

    /// Window bits outside 8..=15 cannot be expressed on the wire.
    pub fn validate(&self) -> Result<(), Error> {
        for bits in [self.client_max_window_bits, self.server_max_window_bits]
            .into_iter()
            .flatten()
        {
            if !(8..=15).contains(&bits) {
                return Err(Error::InvalidMaxWindowBits);
            }
        }
        Ok(())
    }

    /// `Sec-WebSocket-Extensions` header value for this offer/answer.
    pub fn header_value(&self) -> Option<String> {
        if !self.permessage_deflate {
            return None;
        }
        let mut value = String::from(PERMESSAGE_DEFLATE);
        if let Some(true) = self.client_no_context_takeover {
            value.push_str("; ");
            value.push_str(CLIENT_NO_CONTEXT_TAKEOVER);
        }
        if let Some(true) = self.server_no_context_takeover {
            value.push_str("; ");
            value.push_str(SERVER_NO_CONTEXT_TAKEOVER);
        }
        if let Some(bits) = self.client_max_window_bits {
            value.push_str(&format!("; {}={}", CLIENT_MAX_WINDOW_BITS, bits));
        }
        if let Some(bits) = self.server_max_window_bits {
            value.push_str(&format!("; {}={}", SERVER_MAX_WINDOW_BITS, bits));
        }
        Some(value)
    }

    /// Checks a server answer against the client offer: the answer must not
    /// grant anything the client never asked for.
    pub fn accept_answer(&self, answer: &Extensions) -> Result<(), Error> {
        if answer.permessage_deflate && !self.permessage_deflate {
            return Err(Error::ExtensionNotOffered(PERMESSAGE_DEFLATE.into()));
        }
        if answer.client_max_window_bits.is_some() && self.client_max_window_bits.is_none() {
            return Err(Error::ExtensionNotOffered(CLIENT_MAX_WINDOW_BITS.into()));
        }
        answer.validate()
    }
}

pub fn parse_extensions(extensions_header_value: String) -> Option<Extensions> {
    let extensions_str = extensions_header_value.split(';');
    let mut extensions = Extensions::default();

    for extension_str in extensions_str.into_iter() {
        if extension_str.trim() == PERMESSAGE_DEFLATE {
            extensions.permessage_deflate = true;
        } else if extension_str.trim().starts_with(CLIENT_NO_CONTEXT_TAKEOVER) {
            extensions.client_no_context_takeover = Some(true);
        } else if extension_str.trim().starts_with(SERVER_NO_CONTEXT_TAKEOVER) {
            extensions.server_no_context_takeover = Some(true);
        } else if extension_str.trim().starts_with(CLIENT_MAX_WINDOW_BITS) {
            if !extension_str.contains('=') {
                extensions.client_max_window_bits = Some(15);
            } else {
                extensions.client_max_window_bits =
                    extension_str.trim().split('=').last()?.trim().parse::<u8>().ok();
            }
        } else if extension_str.trim().starts_with(SERVER_MAX_WINDOW_BITS) {
            if !extension_str.contains('=') {
                extensions.server_max_window_bits = Some(15);
            } else {
                extensions.server_max_window_bits =
                    extension_str.trim().split('=').last()?.trim().parse::<u8>().ok();
            }
        }
    }
    if !extensions.permessage_deflate {
        return None;
    }

    Some(extensions)
}

/// Server-side resolution: the client's offer merged with the server's own
/// preferences, picking the stricter value where both speak.
pub fn merge_extensions(
    server_extensions: Option<Extensions>,
    client_extensions: Option<Extensions>,
) -> Option<Extensions> {
    let server_ext = server_extensions?;
    let client_ext = client_extensions?;

    let merged_extensions = Extensions {
        permessage_deflate: client_ext.permessage_deflate && server_ext.permessage_deflate,
        client_no_context_takeover: server_ext
            .client_no_context_takeover
            .and(client_ext.client_no_context_takeover),
        server_no_context_takeover: server_ext
            .server_no_context_takeover
            .and(client_ext.server_no_context_takeover),
        client_max_window_bits: min_bits(
            server_ext.client_max_window_bits,
            client_ext.client_max_window_bits,
        ),
        server_max_window_bits: min_bits(
            server_ext.server_max_window_bits,
            client_ext.server_max_window_bits,
        ),
    };
    if !merged_extensions.permessage_deflate {
        return None;
    }
    Some(merged_extensions)
}

fn min_bits(server: Option<u8>, client: Option<u8>) -> Option<u8> {
    match (server, client) {
        (Some(server_bits), Some(client_bits)) => Some(std::cmp::min(server_bits, client_bits)),
        (Some(server_bits), None) => Some(server_bits),
        (None, Some(client_bits)) => Some(client_bits),
        (None, None) => None,
    }
}
