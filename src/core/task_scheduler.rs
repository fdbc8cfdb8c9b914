//! 工具内部的扇出 / 扇入
//!
//! 同一工具内彼此独立的子操作（逐景点地理编码、取图）并发执行，Semaphore 限制同时进行的分支数；
//! 结果按输入顺序返回，每个分支自行处理重试与兜底，汇合后集合完整且类型统一。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

pub struct TaskScheduler {
    branch_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_branches: usize) -> Self {
        Self {
            branch_semaphore: Arc::new(Semaphore::new(max_concurrent_branches.max(1))),
        }
    }

    /// 对每个元素运行一个分支，输出顺序与输入一致
    pub async fn fan_out<I, F, Fut, T>(&self, items: I, branch: F) -> Vec<T>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = T>,
    {
        let branches = items.into_iter().map(|item| {
            let semaphore = Arc::clone(&self.branch_semaphore);
            let fut = branch(item);
            async move {
                // 信号量从不关闭；万一关闭也照常执行
                let _permit = semaphore.acquire_owned().await.ok();
                fut.await
            }
        });
        join_all(branches).await
    }

    pub fn available_permits(&self) -> usize {
        self.branch_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}
