//! HTTP envelopes: the application payloads the bridge replicates.
//!
//! Requests and responses captured on one side are serialized to JSON,
//! optionally zstd-compressed, and carried opaquely by the fragment and
//! replication layers. Correlation between a response and the request it
//! answers rides inside the envelope, not in the protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::constants::{
    DEFAULT_COMPRESSION_LEVEL, MAX_DECOMPRESSED_SIZE, MIN_COMPRESS_SIZE,
};
use crate::core::error::EnvelopeError;
use crate::core::id::EnvelopeId;
use crate::wire::message::ContentKind;
use crate::wire::packet::unix_now;

/// A captured HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestEnvelope {
    /// Correlation id the response will echo back.
    pub id: EnvelopeId,
    /// Request method.
    pub method: String,
    /// Request target path.
    pub uri: String,
    /// Query parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Header map, lowercased names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Cookies, kept apart from headers so the replaying side can manage
    /// its own jar.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: Vec<u8>,
    /// Budget for executing the request on the far side.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Where the far side should post the response envelope, when that
    /// differs from the default return session.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Address of the original client, for logging on the far side.
    #[serde(default)]
    pub client_addr: Option<String>,
    /// Capture time, unix seconds.
    #[serde(default)]
    pub timestamp: u64,
}

impl HttpRequestEnvelope {
    /// Envelope with a fresh id and capture timestamp; optional fields
    /// start empty.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: EnvelopeId::new(),
            method: method.into(),
            uri: uri.into(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            body: Vec::new(),
            timeout_secs: None,
            callback_url: None,
            client_addr: None,
            timestamp: unix_now(),
        }
    }
}

/// A captured HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseEnvelope {
    /// Id of the request this answers.
    pub request_id: EnvelopeId,
    /// Status code.
    pub status: u16,
    /// Header map, lowercased names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response body.
    #[serde(default)]
    pub body: Vec<u8>,
    /// Time the far side spent executing the request.
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    /// Address of the server that actually answered.
    #[serde(default)]
    pub responder_addr: Option<String>,
    /// Capture time, unix seconds.
    #[serde(default)]
    pub timestamp: u64,
}

impl HttpResponseEnvelope {
    /// Envelope answering `request_id`; optional fields start empty.
    pub fn new(request_id: EnvelopeId, status: u16) -> Self {
        Self {
            request_id,
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
            elapsed_ms: None,
            responder_addr: None,
            timestamp: unix_now(),
        }
    }
}

/// Either direction of replicated HTTP traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Request flowing toward the far side.
    Request(HttpRequestEnvelope),
    /// Response flowing back.
    Response(HttpResponseEnvelope),
}

/// Compression policy for encoded envelopes.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Compress at all.
    pub enabled: bool,
    /// Skip payloads smaller than this; tiny JSON rarely shrinks.
    pub min_size: usize,
    /// zstd level.
    pub level: i32,
    /// Refuse to inflate beyond this many bytes.
    pub max_decompressed_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(feature = "compression"),
            min_size: MIN_COMPRESS_SIZE,
            level: DEFAULT_COMPRESSION_LEVEL,
            max_decompressed_size: MAX_DECOMPRESSED_SIZE,
        }
    }
}

/// Serializes envelopes to message payload bytes and back.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    compression: CompressionConfig,
}

impl EnvelopeCodec {
    /// Codec with the default compression policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec with an explicit compression policy.
    pub fn with_compression(compression: CompressionConfig) -> Self {
        Self { compression }
    }

    /// Serialize an envelope, compressing when it pays off. The returned
    /// kind tells the decoder which path the bytes took.
    pub fn encode(&self, envelope: &Envelope) -> Result<(ContentKind, Vec<u8>), EnvelopeError> {
        let json = serde_json::to_vec(envelope)?;

        #[cfg(feature = "compression")]
        if self.compression.enabled && json.len() >= self.compression.min_size {
            let compressed = zstd::bulk::compress(&json, self.compression.level)
                .map_err(|e| EnvelopeError::Compression(e.to_string()))?;
            // Incompressible data travels as-is.
            if compressed.len() < json.len() {
                return Ok((ContentKind::Compressed, compressed));
            }
        }

        Ok((ContentKind::Json, json))
    }

    /// Decode a reassembled payload back into an envelope.
    pub fn decode(&self, kind: ContentKind, data: &[u8]) -> Result<Envelope, EnvelopeError> {
        let envelope = match kind {
            ContentKind::Json => serde_json::from_slice(data)?,
            ContentKind::Compressed => {
                let json = self.decompress(data)?;
                serde_json::from_slice(&json)?
            }
            ContentKind::Text | ContentKind::Binary => return Err(EnvelopeError::UnexpectedKind),
        };
        Ok(envelope)
    }

    #[cfg(feature = "compression")]
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        use std::io::Read;

        let limit = self.compression.max_decompressed_size;
        let decoder =
            zstd::Decoder::new(data).map_err(|e| EnvelopeError::Decompression(e.to_string()))?;
        let mut json = Vec::new();
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut json)
            .map_err(|e| EnvelopeError::Decompression(e.to_string()))?;
        if json.len() > limit {
            return Err(EnvelopeError::SizeExceeded {
                size: json.len(),
                limit,
            });
        }
        Ok(json)
    }

    #[cfg(not(feature = "compression"))]
    fn decompress(&self, _data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        Err(EnvelopeError::Decompression(
            "built without compression support".to_string(),
        ))
    }
}
