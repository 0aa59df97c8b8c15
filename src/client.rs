//! Paginated fetching with per-page retry.
//!
//! One [`ApiClient::fetch_all`] call walks the cursor chain strictly in
//! server order, one page at a time:
//!
//! ```text
//! Fetching(0) ──ok, more──▶ Fetching(1) ──ok, last──▶ Succeeded
//!     │  ▲
//!  err│  │resend ok
//!     ▼  │
//! Retrying(0, k) ──exhausted / not retryable──▶ Failed
//! ```
//!
//! The result is either every item reachable through the cursor chain or a
//! typed [`ApiError`]; a fetch never ends early with a partial success.

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::pagination::PaginationCursor;
use crate::retry::{RetryPolicy, RetryState};
use crate::runtime::Runtime;
use crate::transport::{ErrorClass, Request, Response, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("page {page}: gave up after {attempts} attempts ({elapsed:?}): {last_error}")]
    RetriesExhausted {
        page: usize,
        attempts: u32,
        elapsed: Duration,
        last_error: TransportError,
    },

    #[error("page {page}, attempt {attempt} ({elapsed:?}): {classification}: {detail}")]
    TransportFailure {
        page: usize,
        attempt: u32,
        elapsed: Duration,
        classification: ErrorClass,
        status: Option<u16>,
        detail: String,
    },

    #[error("page {page}: malformed pagination: {reason} (raw value: {raw_value})")]
    MalformedPagination {
        page: usize,
        raw_value: String,
        reason: String,
    },

    #[error("pagination did not finish within {max_pages} pages")]
    PageLimitExceeded { max_pages: usize },

    #[error("page {page}: {detail}")]
    InvalidPage { page: usize, detail: String },

    #[error("cancelled while fetching page {page}")]
    Cancelled { page: usize },
}

impl ApiError {
    /// Taxonomy label of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::RetriesExhausted { .. } => "retries_exhausted",
            ApiError::TransportFailure { classification, .. } => classification.as_str(),
            ApiError::MalformedPagination { .. } => "malformed_pagination",
            ApiError::PageLimitExceeded { .. } => "page_limit_exceeded",
            ApiError::InvalidPage { .. } => "invalid_page",
            ApiError::Cancelled { .. } => "cancelled",
        }
    }

    /// Zero-based page the error happened on, when it belongs to one.
    pub fn page(&self) -> Option<usize> {
        match self {
            ApiError::RetriesExhausted { page, .. }
            | ApiError::TransportFailure { page, .. }
            | ApiError::MalformedPagination { page, .. }
            | ApiError::InvalidPage { page, .. }
            | ApiError::Cancelled { page } => Some(*page),
            ApiError::PageLimitExceeded { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled { .. })
    }
}

/// A failed fetch. `items` holds the pages fetched before the failure when
/// partial results were asked for, either through [`FetchOptions::keep_partial`]
/// or `keep_partial` in the client's [`ClientConfig`]; it is empty otherwise.
#[derive(Debug)]
pub struct PartialFetch<I> {
    pub error: ApiError,
    pub items: Vec<I>,
}

impl<I> PartialFetch<I> {
    pub fn into_error(self) -> ApiError {
        self.error
    }
}

/// Reported once per successfully fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProgress {
    pub page: usize,
    pub items_in_page: usize,
    pub total_items: usize,
    /// Transport calls it took to get this page.
    pub attempts: u32,
}

pub type ProgressCallback = Arc<dyn Fn(&PageProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct FetchOptions {
    pub cancel: CancellationToken,
    pub keep_partial: bool,
    pub on_page: Option<ProgressCallback>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn keep_partial(mut self, keep: bool) -> Self {
        self.keep_partial = keep;
        self
    }

    pub fn on_page<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PageProgress) + Send + Sync + 'static,
    {
        self.on_page = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Fetching { page: usize },
    Retrying { page: usize, attempt: u32 },
    Succeeded,
    Failed,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchState::Fetching { page } => write!(f, "Fetching({})", page),
            FetchState::Retrying { page, attempt } => write!(f, "Retrying({}, {})", page, attempt),
            FetchState::Succeeded => write!(f, "Succeeded"),
            FetchState::Failed => write!(f, "Failed"),
        }
    }
}

impl FetchState {
    fn move_to(&mut self, next: FetchState) {
        debug!("{} -> {}", self, next);
        *self = next;
    }
}

/// Fetches every page of a collection.
///
/// Holds no per-fetch state, so independent `fetch_all` calls may run
/// concurrently on one client.
pub struct ApiClient<T: Transport, R: Runtime> {
    transport: T,
    runtime: R,
    policy: RetryPolicy,
    cursor: PaginationCursor,
    max_pages: usize,
    keep_partial: bool,
    requests_sent: AtomicU64,
}

impl<T: Transport, R: Runtime> ApiClient<T, R> {
    pub fn new(transport: T, runtime: R, config: &ClientConfig) -> Self {
        Self {
            transport,
            runtime,
            policy: config.retry_policy(),
            cursor: PaginationCursor::from_config(config),
            max_pages: config.max_pages,
            keep_partial: config.keep_partial,
            requests_sent: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether failed fetches keep the items of earlier pages by default.
    pub fn keeps_partial(&self) -> bool {
        self.keep_partial
    }

    /// Transport calls made by this client so far, across all fetches.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Fetches all pages reachable from `template`.
    pub async fn fetch_all<I: DeserializeOwned>(&self, template: &Request) -> Result<Vec<I>, ApiError> {
        self.fetch_all_with(template, &FetchOptions::default())
            .await
            .map_err(PartialFetch::into_error)
    }

    /// Like [`fetch_all`](Self::fetch_all), with cancellation, progress
    /// reporting and opt-in partial results.
    #[tracing::instrument(skip(self, template, options), fields(request = %template))]
    pub async fn fetch_all_with<I: DeserializeOwned>(
        &self,
        template: &Request,
        options: &FetchOptions,
    ) -> Result<Vec<I>, PartialFetch<I>> {
        let mut items: Vec<I> = Vec::new();
        let mut request = template.clone();
        let mut page = 0;
        let mut state = FetchState::Fetching { page };

        loop {
            if page >= self.max_pages {
                let error = ApiError::PageLimitExceeded {
                    max_pages: self.max_pages,
                };
                return Err(self.fail(&mut state, error, items, options));
            }

            let (response, attempts) =
                match self.fetch_page(&request, page, &options.cancel, &mut state).await {
                    Ok(fetched) => fetched,
                    Err(error) => return Err(self.fail(&mut state, error, items, options)),
                };

            let page_items = match self.decode_items::<I>(&response, page) {
                Ok(page_items) => page_items,
                Err(error) => return Err(self.fail(&mut state, error, items, options)),
            };

            let next = match self.cursor.next_request(&request, &response) {
                Ok(next) => next,
                Err(e) => {
                    let error = ApiError::MalformedPagination {
                        page,
                        raw_value: e.raw_value,
                        reason: e.reason,
                    };
                    return Err(self.fail(&mut state, error, items, options));
                }
            };

            let items_in_page = page_items.len();
            items.extend(page_items);
            debug!("Page {}: {} items ({} total)", page, items_in_page, items.len());

            if let Some(callback) = &options.on_page {
                callback(&PageProgress {
                    page,
                    items_in_page,
                    total_items: items.len(),
                    attempts,
                });
            }

            match next {
                Some(next) => {
                    request = next;
                    page += 1;
                    state.move_to(FetchState::Fetching { page });
                }
                None => {
                    state.move_to(FetchState::Succeeded);
                    info!("Fetched {} items in {} pages", items.len(), page + 1);
                    return Ok(items);
                }
            }
        }
    }

    /// Sends one page's request, retrying per the policy.
    /// Returns the response and the number of transport calls it took.
    async fn fetch_page(
        &self,
        request: &Request,
        page: usize,
        cancel: &CancellationToken,
        state: &mut FetchState,
    ) -> Result<(Response, u32), ApiError> {
        let mut retry = RetryState::new();

        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled { page });
            }

            self.requests_sent.fetch_add(1, Ordering::Relaxed);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled { page }),
                result = self.transport.send(request) => result,
            };

            let error = match result {
                Ok(response) => {
                    if let FetchState::Retrying { .. } = state {
                        state.move_to(FetchState::Fetching { page });
                    }
                    return Ok((response, retry.attempt_count() + 1));
                }
                Err(error) => error,
            };

            let attempts = retry.attempt_count() + 1;
            let decision = self.policy.should_retry(&retry, &error);

            if !decision.retry {
                if error.is_retryable() {
                    warn!("Page {}: giving up after {} attempts: {}", page, attempts, error);
                    return Err(ApiError::RetriesExhausted {
                        page,
                        attempts,
                        elapsed: retry.elapsed(),
                        last_error: error,
                    });
                }

                debug!("Page {}: non-retryable error: {}", page, error);
                return Err(ApiError::TransportFailure {
                    page,
                    attempt: attempts,
                    elapsed: retry.elapsed(),
                    classification: error.classification,
                    status: error.status,
                    detail: error.detail,
                });
            }

            warn!(
                "Page {}: attempt {}/{} failed ({}), retrying in {:?}...",
                page,
                attempts,
                self.policy.max_retries() + 1,
                error,
                decision.backoff
            );
            self.policy.advance(&mut retry, error);
            state.move_to(FetchState::Retrying {
                page,
                attempt: retry.attempt_count(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled { page }),
                _ = self.runtime.sleep(decision.backoff) => {}
            }
        }
    }

    fn decode_items<I: DeserializeOwned>(&self, response: &Response, page: usize) -> Result<Vec<I>, ApiError> {
        let body = response.json().map_err(|e| ApiError::InvalidPage {
            page,
            detail: e.to_string(),
        })?;

        let raw_items = self.cursor.items(body).ok_or_else(|| ApiError::InvalidPage {
            page,
            detail: format!("no item array at '{}'", self.cursor.items_field_path()),
        })?;

        raw_items
            .iter()
            .enumerate()
            .map(|(i, value)| {
                I::deserialize(value).map_err(|e| ApiError::InvalidPage {
                    page,
                    detail: format!("item {}: {}", i, e),
                })
            })
            .collect()
    }

    fn fail<I>(
        &self,
        state: &mut FetchState,
        error: ApiError,
        items: Vec<I>,
        options: &FetchOptions,
    ) -> PartialFetch<I> {
        state.move_to(FetchState::Failed);
        if error.is_cancelled() {
            info!("Fetch cancelled: {}", error);
        } else {
            warn!("Fetch failed: {}", error);
        }

        let keep = options.keep_partial || self.keep_partial;
        let items = if keep { items } else { Vec::new() };
        PartialFetch { error, items }
    }
}
