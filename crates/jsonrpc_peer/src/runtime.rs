use std::fmt;
use std::sync::Arc;

use crate::codec::{accept_encoding_value, ContentEncoding, ContentTypeCodec, JsonContentCodec};

/// Host-provided building blocks for a connection: the content-type codec
/// and any content encodings, injected explicitly rather than installed as a
/// process-wide singleton.
///
/// Timers and logging come from tokio and `tracing`; everything above this
/// layer stays host-agnostic.
#[derive(Clone)]
pub struct Runtime {
    content_codec: Arc<dyn ContentTypeCodec>,
    encodings: Vec<Arc<dyn ContentEncoding>>,
    outbound_encoding: Option<String>,
}

impl Runtime {
    /// JSON over UTF-8 with no content encodings.
    pub fn new() -> Self {
        Self {
            content_codec: Arc::new(JsonContentCodec),
            encodings: Vec::new(),
            outbound_encoding: None,
        }
    }

    pub fn with_content_codec(mut self, codec: Arc<dyn ContentTypeCodec>) -> Self {
        self.content_codec = codec;
        self
    }

    /// Registers an encoding the peer may use on inbound bodies. Order is
    /// preference order for [`Runtime::accept_encodings`].
    pub fn register_encoding(mut self, encoding: Arc<dyn ContentEncoding>) -> Self {
        self.encodings.push(encoding);
        self
    }

    /// Selects a registered encoding for outbound bodies.
    pub fn use_encoding(mut self, name: impl Into<String>) -> Self {
        self.outbound_encoding = Some(name.into());
        self
    }

    pub fn content_codec(&self) -> &Arc<dyn ContentTypeCodec> {
        &self.content_codec
    }

    /// Looks up a registered encoding by its wire name.
    pub fn encoding(&self, name: &str) -> Option<&Arc<dyn ContentEncoding>> {
        self.encodings
            .iter()
            .find(|encoding| encoding.name().eq_ignore_ascii_case(name))
    }

    pub fn outbound_encoding(&self) -> Option<&Arc<dyn ContentEncoding>> {
        self.outbound_encoding
            .as_deref()
            .and_then(|name| self.encoding(name))
    }

    /// Priority-ordered accept-encoding value, if any encodings are
    /// registered.
    pub fn accept_encodings(&self) -> Option<String> {
        if self.encodings.is_empty() {
            return None;
        }
        let names: Vec<&str> = self.encodings.iter().map(|e| e.name()).collect();
        Some(accept_encoding_value(&names))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("content_type", &self.content_codec.content_type())
            .field(
                "encodings",
                &self
                    .encodings
                    .iter()
                    .map(|e| e.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .field("outbound_encoding", &self.outbound_encoding)
            .finish()
    }
}
