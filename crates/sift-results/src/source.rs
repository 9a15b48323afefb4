use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use log::debug;

/// The raw response body handed over by the transport.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An opaque failure reported by the transport.
#[derive(Debug, Clone)]
pub struct TransportError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl TransportError {
    pub fn new(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Arc::new(error))
    }

    pub fn message(message: impl Into<String>) -> Self {
        let error: Box<dyn std::error::Error + Send + Sync> = message.into().into();
        Self(Arc::from(error))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Owns a byte source until it is released.
/// Releasing more than once has no effect.
pub(crate) struct SourceGuard {
    inner: Option<ByteStream>,
}

impl SourceGuard {
    pub fn new(source: ByteStream) -> Self {
        Self {
            inner: Some(source),
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut ByteStream> {
        self.inner.as_mut()
    }

    pub fn release(&mut self) {
        if self.inner.take().is_some() {
            debug!("byte source released");
        }
    }
}
