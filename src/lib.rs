pub mod client;
pub mod commands;
pub mod config;
pub mod pagination;
pub mod retry;
pub mod runtime;
pub mod transport;

pub use client::{ApiClient, ApiError, FetchOptions, PageProgress, PartialFetch};
pub use config::ClientConfig;
pub use pagination::{CursorKind, PageToken, PaginationCursor, PaginationError};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use transport::{ErrorClass, HttpTransport, Request, Response, Transport, TransportError};
