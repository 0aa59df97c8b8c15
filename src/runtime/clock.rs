//! Backoff sleeping.

use std::time::Duration;

use super::RealRuntime;

impl RealRuntime {
    pub(crate) async fn sleep_impl(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
