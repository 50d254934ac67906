//! 週期性執行的排程：立即執行一次，之後每隔固定間隔執行，同一時間最多一個執行中。

use std::{future, ops::ControlFlow, time::Duration};

use async_trait::async_trait;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 排程中每一次執行的工作。
#[async_trait]
pub trait Task: Send {
    type Output: Send;
    type Error: Send;

    /// 執行一次；回傳 `Break` 代表工作完成，排程隨之停止。
    async fn run_once(&mut self) -> Result<ControlFlow<Self::Output>, Self::Error>;
}

/// 排程結束的原因。
#[derive(Debug, PartialEq, Eq)]
pub enum Finish<T> {
    /// 工作回報完成，附帶其結果。
    Done(T),
    /// 取消權杖已觸發。
    Cancelled,
    /// 超過存活時間，附帶設定的時間長度。
    Expired(Duration),
}

/// 固定間隔的執行排程，可搭配取消權杖與整體存活時間。
#[derive(Debug, Clone)]
pub struct Schedule {
    interval: Duration,
    cancel: CancellationToken,
    deadline: Option<Duration>,
}

impl Schedule {
    /// 間隔至少為 1 毫秒。
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// 取消權杖觸發時立即停止，包含正在執行中的那一次。
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 從開始驅動起算的存活時間；`None` 表示不限制。
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// 實際使用的間隔。
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 驅動工作直到完成、失敗、取消或逾時。
    ///
    /// 前一次執行尚未結束時到期的排程點會被略過而不會累積，
    /// 因此工作永遠不會重疊執行。
    pub async fn drive<T: Task>(&self, task: &mut T) -> Result<Finish<T::Output>, T::Error> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(deadline) => time::sleep(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Finish::Cancelled),
                _ = &mut expiry => return Ok(Finish::Expired(deadline.unwrap_or_default())),
                _ = ticker.tick() => {}
            }

            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Finish::Cancelled),
                _ = &mut expiry => return Ok(Finish::Expired(deadline.unwrap_or_default())),
                step = task.run_once() => step?,
            };
            if let ControlFlow::Break(output) = step {
                return Ok(Finish::Done(output));
            }
        }
    }
}
