//! Remote Retry Strategy
//!
//! リモート呼び出しのリトライ戦略（一時的な障害のみ再試行）

use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::RetrySettings;
use crate::error::RemoteError;

/// リトライ戦略
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RetryPolicy {
    /// 再試行しない
    #[default]
    Never,
    /// 指数バックオフ
    ExponentialBackoff {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// デフォルトの指数バックオフ戦略
    pub fn default_exponential() -> Self {
        Self::ExponentialBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }

    /// 設定から構築（試行回数1以下はリトライなし）
    pub fn from_settings(settings: &RetrySettings) -> Self {
        if settings.max_attempts <= 1 {
            return Self::Never;
        }
        Self::ExponentialBackoff {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier.max(1.0),
            max_attempts: settings.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Never => 1,
            Self::ExponentialBackoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Never => Duration::ZERO,
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                initial_delay.mul_f64(factor).min(*max_delay)
            }
        }
    }

    /// リトライ可能な操作を実行
    ///
    /// `Rejected` is returned immediately; `Unavailable` and `Timeout` are
    /// retried until `max_attempts` is exhausted.
    pub async fn execute<F, T, Fut>(&self, mut operation: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, RemoteError>> + Send,
        T: Send,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    info!(
                        "Retrying remote call after {:?} (attempt {}/{}): {}",
                        delay, attempt, max_attempts, e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!("Remote call failed after {} attempts: {}", attempt, e);
                    } else {
                        warn!("Remote call rejected: {}", e);
                    }
                    return Err(e);
                }
            }
        }
    }
}
