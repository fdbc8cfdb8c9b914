//! 协作式取消：令牌组合与单次调用截止时间
//!
//! 顶层令牌来自入站请求；`any_of` 组合多个来源（任一触发即取消），
//! `Deadline` 把父令牌与单次调用超时合并（更严格者生效），并区分「被取消」与「超时」。

use std::future::Future;
use std::time::Duration;

use futures_util::future::select_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 调用被打断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// 上游令牌触发
    Cancelled,
    /// 单次调用超时
    TimedOut(Duration),
}

/// 组合令牌：任一来源触发即取消；组合令牌自身被取消时后台监听退出
pub fn any_of(sources: Vec<CancellationToken>) -> CancellationToken {
    let combined = CancellationToken::new();
    if sources.iter().any(|s| s.is_cancelled()) {
        combined.cancel();
        return combined;
    }
    if sources.is_empty() {
        return combined;
    }

    let guard = combined.clone();
    tokio::spawn(async move {
        let waits = sources.iter().map(|s| Box::pin(s.cancelled()));
        tokio::select! {
            _ = select_all(waits) => guard.cancel(),
            _ = guard.cancelled() => {}
        }
    });
    combined
}

/// 单次调用作用域：子令牌 = 父令牌 ∧ 超时
pub struct Deadline {
    parent: CancellationToken,
    token: CancellationToken,
    timeout: Duration,
    deadline: Instant,
}

impl Deadline {
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            parent: parent.clone(),
            token: parent.child_token(),
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// 传给下游调用的令牌：父令牌取消或超时都会触发
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 在截止时间与取消约束下运行 future；先到者胜出
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupt>
    where
        F: Future,
    {
        if self.parent.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.parent.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => {
                self.token.cancel();
                Err(Interrupt::TimedOut(self.timeout))
            }
            out = fut => Ok(out),
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        // 调用结束后释放子令牌，避免挂起的下游任务继续运行
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_of_fires_on_any_source() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let combined = any_of(vec![a.clone(), b.clone()]);
        assert!(!combined.is_cancelled());
        b.cancel();
        tokio::time::timeout(Duration::from_secs(1), combined.cancelled())
            .await
            .expect("combined token should fire");
        assert!(!a.is_cancelled());
    }

    #[tokio::test]
    async fn test_any_of_already_cancelled() {
        let a = CancellationToken::new();
        a.cancel();
        assert!(any_of(vec![a]).is_cancelled());
        assert!(!any_of(Vec::new()).is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Duration::from_millis(20));
        let result = deadline.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(result, Err(Interrupt::TimedOut(Duration::from_millis(20))));
        assert!(deadline.token().is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_parent_cancel_wins() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Duration::from_secs(5));
        let trigger = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = deadline.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(result, Err(Interrupt::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_passes_output() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Duration::from_secs(1));
        assert_eq!(deadline.run(async { 7 }).await, Ok(7));
    }
}
