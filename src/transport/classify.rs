//! Error classification for network operations.

use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;

/// How a failed round trip should be treated by the retry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The call never meaningfully reached the server (timeout, DNS, connection reset).
    TransientNetwork,
    /// HTTP 429
    RateLimited,
    /// HTTP 4xx other than 429
    ClientError,
    /// HTTP 5xx
    ServerError,
    /// Anything whose failure mode is unclear
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::ClientError => "client_error",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNetwork | ErrorClass::RateLimited | ErrorClass::ServerError
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> ErrorClass {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorClass::RateLimited,
        s if s.is_client_error() => ErrorClass::ClientError,
        s if s.is_server_error() => ErrorClass::ServerError,
        _ => ErrorClass::Unknown,
    }
}

/// Classifies an error raised by reqwest itself.
pub fn classify_reqwest(error: &reqwest::Error) -> ErrorClass {
    if let Some(status) = error.status() {
        return classify_status(status);
    }

    if error.is_builder() || error.is_redirect() {
        return ErrorClass::Unknown;
    }

    // Connect covers refused connections and DNS failures
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        return ErrorClass::TransientNetwork;
    }

    ErrorClass::Unknown
}

/// Parses a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are ignored; the computed backoff applies instead.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            ErrorClass::ClientError
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorClass::ClientError);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorClass::ClientError);
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorClass::ServerError
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            ErrorClass::ServerError
        );
        assert_eq!(classify_status(StatusCode::FOUND), ErrorClass::Unknown);
    }

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::TransientNetwork.is_retryable());
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(ErrorClass::ServerError.is_retryable());
        assert!(!ErrorClass::ClientError.is_retryable());
        assert!(!ErrorClass::Unknown.is_retryable());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[tokio::test]
    async fn test_classify_status_error_from_server() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .with_status(429)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let response = client.get(server.url()).send().await.unwrap();
        let err = response.error_for_status().unwrap_err();

        assert_eq!(classify_reqwest(&err), ErrorClass::RateLimited);
    }

    #[tokio::test]
    async fn test_classify_connection_refused() {
        // Bind then drop a listener so the port is known to be closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = reqwest::Client::new()
            .get(format!("http://{}/", addr))
            .send()
            .await
            .unwrap_err();

        assert_eq!(classify_reqwest(&err), ErrorClass::TransientNetwork);
    }

    #[tokio::test]
    async fn test_classify_timeout() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let err = reqwest::Client::new()
            .get(format!("http://{}/", addr))
            .timeout(Duration::from_millis(100))
            .send()
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(classify_reqwest(&err), ErrorClass::TransientNetwork);
    }

    #[test]
    fn test_classify_builder_error() {
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        assert_eq!(classify_reqwest(&err), ErrorClass::Unknown);
    }
}
