//! 带退避间隔的有限次重试
//!
//! 用于读取可能早于写入生效的场景。策略在调用之间不保存状态，每次 `run` 都从第 1 次尝试开始。

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::services::registry::RegistryError;

/// 重试间隔策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// 固定间隔
    Fixed(Duration),
    /// 第 n 次失败后等待 step * n
    Linear(Duration),
    /// 第 n 次失败后等待 base * 2^(n-1)，上限 max
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// 第 `attempt` 次失败后的等待时长（从 1 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(step) => step.saturating_mul(attempt),
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// 配置文件中的退避类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// `max_attempts` 为 0 时仍会尝试一次
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self::new(max_attempts, Backoff::Linear(step))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// 所有尝试都失败时的最长等待总时长
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.backoff.delay(n)).sum()
    }

    /// 重复执行 `op` 直到得到结果
    ///
    /// `op` 接收从 1 开始的尝试序号。空结果 `Ok(None)` 与临时错误会重试，其他错误立即返回。
    /// 次数用尽时，最后一次为空则返回 `Ok(None)`，否则返回最后一次的临时错误。
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<Option<T>, RegistryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, RegistryError>>,
    {
        self.run_until_cancelled(&CancellationToken::new(), op).await
    }

    /// 与 [`run`](Self::run) 相同，`token` 取消后立即返回 [`RegistryError::Cancelled`]
    pub async fn run_until_cancelled<T, F, Fut>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<Option<T>, RegistryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, RegistryError>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(RegistryError::Cancelled),
                outcome = op(attempt) => outcome,
            };

            let exhausted = attempt >= self.max_attempts;
            match outcome {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) if exhausted => return Ok(None),
                Err(e) if !e.is_transient() || exhausted => return Err(e),
                Ok(None) => {
                    tracing::debug!(attempt, "Empty result, retrying");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Transient failure, retrying");
                }
            }

            let delay = self.backoff.delay(attempt);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(RegistryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
