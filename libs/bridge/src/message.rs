use bytes::Bytes;
use std::collections::BTreeMap;

/// Annotation key carrying the originating device identifier
pub const ANNOTATION_DEVICE_ID: &str = "device_id";

/// Annotation key carrying the tenant the device belongs to
pub const ANNOTATION_TENANT_ID: &str = "tenant_id";

/// Telemetry message travelling from an upstream link to the downstream sender
///
/// The payload is opaque to the bridge. Annotations are carried forward
/// unchanged; the bridge only ever reads the device identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryMessage {
    /// Raw message body
    pub payload: Bytes,

    /// Message annotations
    pub annotations: BTreeMap<String, String>,
}

impl TelemetryMessage {
    /// Create a message with the given payload and no annotations
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            annotations: BTreeMap::new(),
        }
    }

    /// Set the device identifier annotation
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.annotations
            .insert(ANNOTATION_DEVICE_ID.to_string(), device_id.into());
        self
    }

    /// Set the tenant identifier annotation
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.annotations
            .insert(ANNOTATION_TENANT_ID.to_string(), tenant_id.into());
        self
    }

    /// Set an arbitrary annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Device that produced this message, if annotated
    pub fn device_id(&self) -> Option<&str> {
        self.annotation(ANNOTATION_DEVICE_ID)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.annotation(ANNOTATION_TENANT_ID)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
