use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sift_results::{ByteStream, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// The status and the body of a response.
/// The body is read lazily, so result retrieval can stream it.
pub struct Response {
    pub status: u16,
    pub body: ByteStream,
}

impl Response {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub async fn read_to_end(self) -> Result<Bytes, TransportError> {
        let mut body = self.body;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues requests against the REST endpoints of the search server.
///
/// Paths are relative to the server root, e.g. `services/search/jobs`.
/// Authentication, sessions and retries are the concern of the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn issue_request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Response, TransportError>;
}
