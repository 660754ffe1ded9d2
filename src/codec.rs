use crate::compression::{Decompressor, ZlibStream, ZstdStream};
use crate::config::ConfigError;
use crate::error::{Error, TransportError};
use crate::etf;
use crate::protocol::Payload;
use std::fmt;
use std::str::FromStr;
use tokio_tungstenite::tungstenite::Message;

/// Payload encoding negotiated through the connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Text JSON frames
    #[default]
    Json,
    /// Binary External Term Format frames
    Etf,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Etf => "etf",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "etf" => Ok(Encoding::Etf),
            other => Err(ConfigError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Transport-level compression negotiated through the connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    /// One zlib context for the whole connection, messages end on a sync flush
    ZlibStream,
    /// One zstd context for the whole connection, one flush per message
    ZstdStream,
}

impl Compression {
    /// Query-string value, `None` when no compression is requested.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::ZlibStream => Some("zlib-stream"),
            Compression::ZstdStream => Some("zstd-stream"),
        }
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "zlib-stream" => Ok(Compression::ZlibStream),
            "zstd-stream" => Ok(Compression::ZstdStream),
            other => Err(ConfigError::UnsupportedCompression(other.to_string())),
        }
    }
}

/// Per-connection codec: owns the decompressor for one socket.
///
/// Create a new codec for every socket; reusing one across reconnects would
/// feed a fresh server stream into a stale compression context.
pub struct TransportCodec {
    encoding: Encoding,
    decompressor: Decompressor,
}

impl TransportCodec {
    /// # Errors
    ///
    /// Returns a configuration error if the decompressor cannot be initialised.
    pub fn new(encoding: Encoding, compression: Compression) -> Result<Self, Error> {
        let decompressor = match compression {
            Compression::None => Decompressor::None,
            Compression::ZlibStream => Decompressor::Zlib(ZlibStream::new()),
            Compression::ZstdStream => Decompressor::Zstd(ZstdStream::new().map_err(|e| {
                ConfigError::UnsupportedCompression(format!("zstd-stream unavailable: {}", e))
            })?),
        };
        Ok(Self {
            encoding,
            decompressor,
        })
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Feed raw frame bytes through the decompressor.
    pub fn decompress(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        self.decompressor.push(frame)
    }

    /// Decode a complete message.
    pub fn decode(&self, bytes: &[u8]) -> Result<Payload, TransportError> {
        decode(bytes, self.encoding)
    }

    /// Encode a payload into the frame type the encoding calls for.
    pub fn encode(&self, payload: &Payload) -> Result<Message, TransportError> {
        let bytes = encode(payload, self.encoding)?;
        match self.encoding {
            Encoding::Json => String::from_utf8(bytes)
                .map(Message::Text)
                .map_err(|e| TransportError::Encode(e.to_string())),
            Encoding::Etf => Ok(Message::Binary(bytes)),
        }
    }

    /// Turn one websocket frame into a payload.
    ///
    /// Returns `Ok(None)` for frames that carry no payload (control frames, or
    /// a compressed message that is not complete yet).
    pub fn decode_message(&mut self, message: &Message) -> Result<Option<Payload>, TransportError> {
        match message {
            // Servers never compress text frames.
            Message::Text(text) => self.decode(text.as_bytes()).map(Some),
            Message::Binary(data) => match self.decompress(data)? {
                Some(bytes) => self.decode(&bytes).map(Some),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

/// Serialize a payload in the given encoding.
pub fn encode(payload: &Payload, encoding: Encoding) -> Result<Vec<u8>, TransportError> {
    match encoding {
        Encoding::Json => {
            serde_json::to_vec(payload).map_err(|e| TransportError::Encode(e.to_string()))
        }
        Encoding::Etf => {
            let value =
                serde_json::to_value(payload).map_err(|e| TransportError::Encode(e.to_string()))?;
            etf::encode(&value)
        }
    }
}

/// Parse a payload from bytes in the given encoding.
pub fn decode(bytes: &[u8], encoding: Encoding) -> Result<Payload, TransportError> {
    match encoding {
        Encoding::Json => {
            serde_json::from_slice(bytes).map_err(|e| TransportError::Decode(e.to_string()))
        }
        Encoding::Etf => {
            let value = etf::decode(bytes)?;
            serde_json::from_value(value).map_err(|e| TransportError::Decode(e.to_string()))
        }
    }
}
