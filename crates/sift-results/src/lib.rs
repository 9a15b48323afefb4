pub mod decoder;
pub mod error;
pub mod mode;
pub mod record;
pub mod source;
pub mod stream;
pub mod xml;

pub use decoder::RecordDecoder;
pub use mode::RetrievalMode;
pub use record::{Record, ResultBatch, Schema};
pub use source::{ByteStream, TransportError};
pub use stream::{Cancellation, FnObserver, Observer, ResultStream, Subscription};
