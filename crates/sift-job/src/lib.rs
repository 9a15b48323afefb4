pub mod controller;
pub mod entity;
pub mod error;
pub mod pagination;
pub mod state;
pub mod transport;

pub use controller::{DispatchOptions, JobController, JobPages};
pub use error::{JobError, JobResult};
pub use pagination::{Page, PageSource, PaginationCursor};
pub use state::{JobHandle, JobState};
pub use transport::{Method, Response, Transport};
