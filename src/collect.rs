//! 訂單輪詢狀態機。
//!
//! 狀態轉換為 `Idle → Polling → Resolved`，每次呼叫只會結束一次。
//! 第一次查詢立即執行，之後依正規化後的間隔查詢；前一次查詢尚未返回時，
//! 到期的查詢會被略過。

use std::{ops::ControlFlow, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    error::{BankIdError, BoxError, Result, TransportError},
    protocol::Protocol,
    schedule::{Finish, Schedule, Task},
    status::{OrderStatus, PollOutcome},
};

/// 輪詢間隔下限。
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// 輪詢間隔上限。
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10_000);

/// 將要求的間隔夾在允許範圍內，超出範圍時不會報錯。
pub fn normalize_interval(requested: Duration) -> Duration {
    requested.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// 訂單狀態改變時的回呼。
///
/// 回呼完成後輪詢才會繼續；回呼失敗會終止輪詢並回傳 [`BankIdError::Observer`]。
///
/// 只有正規化後的 [`OrderStatus`] 改變才會觸發回呼。RPC 協定在 `PENDING` 內的
/// 子狀態變化（例如 `OUTSTANDING_TRANSACTION` 變為 `USER_SIGN`）不會另外通知。
#[async_trait]
pub trait StatusObserver: Send + Sync {
    async fn on_status_change(
        &self,
        status: OrderStatus,
        hint_code: Option<&str>,
    ) -> std::result::Result<(), BoxError>;
}

#[async_trait]
impl<F> StatusObserver for F
where
    F: Fn(OrderStatus, Option<&str>) + Send + Sync,
{
    async fn on_status_change(
        &self,
        status: OrderStatus,
        hint_code: Option<&str>,
    ) -> std::result::Result<(), BoxError> {
        self(status, hint_code);
        Ok(())
    }
}

/// 輪詢結束的方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 訂單完成。
    Success,
    /// 訂單失敗，例如使用者取消或逾期。
    Failure,
    /// 查詢、觀察者、取消或存活時間用盡等其他原因。
    Error,
}

/// 輪詢器目前所處的階段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// 尚未開始。
    Idle,
    /// 輪詢中。
    Polling,
    /// 已結束，不會再查詢。
    Resolved(Resolution),
}

/// 單一訂單的輪詢器。
pub struct OrderPoller<'a> {
    protocol: &'a dyn Protocol,
    order_ref: &'a str,
    observer: Option<&'a dyn StatusObserver>,
    last_status: Option<OrderStatus>,
    state: PollState,
}

impl<'a> OrderPoller<'a> {
    /// 建立尚未開始的輪詢器。
    pub fn new(protocol: &'a dyn Protocol, order_ref: &'a str) -> Self {
        Self {
            protocol,
            order_ref,
            observer: None,
            last_status: None,
            state: PollState::Idle,
        }
    }

    /// 設定狀態改變時要通知的觀察者。
    pub fn observer(mut self, observer: Option<&'a dyn StatusObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// 目前的階段。
    pub fn state(&self) -> PollState {
        self.state
    }

    /// 最後一次觀察到的狀態。
    pub fn last_status(&self) -> Option<OrderStatus> {
        self.last_status
    }

    /// 依排程輪詢直到訂單結束。
    ///
    /// # Errors
    ///
    /// - 訂單失敗時回傳 [`BankIdError::OrderFailed`]，保留提示代碼。
    /// - 查詢失敗時立即停止並回傳該錯誤，不會重試。
    /// - 取消時回傳 [`BankIdError::Cancelled`]，超過存活時間時回傳
    ///   [`TransportError::Timeout`]。
    pub async fn run(&mut self, schedule: &Schedule) -> Result<PollOutcome> {
        debug!(order_ref = %self.order_ref, interval = ?schedule.interval(), "Polling order");
        let finish = schedule.drive(self).await;
        let (resolution, result) = match finish {
            Ok(Finish::Done(outcome)) => (Resolution::Success, Ok(outcome)),
            Ok(Finish::Cancelled) => (Resolution::Error, Err(BankIdError::Cancelled)),
            Ok(Finish::Expired(lifetime)) => (
                Resolution::Error,
                Err(TransportError::Timeout(lifetime).into()),
            ),
            Err(err @ BankIdError::OrderFailed { .. }) => (Resolution::Failure, Err(err)),
            Err(err) => (Resolution::Error, Err(err)),
        };
        self.state = PollState::Resolved(resolution);
        info!(order_ref = %self.order_ref, ?resolution, "Order polling resolved");
        result
    }
}

#[async_trait]
impl<'a> Task for OrderPoller<'a> {
    type Output = PollOutcome;
    type Error = BankIdError;

    async fn run_once(&mut self) -> Result<ControlFlow<PollOutcome>> {
        self.state = PollState::Polling;
        let outcome = self.protocol.poll_status(self.order_ref).await?;
        debug!(order_ref = %self.order_ref, status = %outcome.status, hint_code = ?outcome.hint_code, "Order status");

        if self.last_status != Some(outcome.status) {
            if let Some(observer) = self.observer {
                observer
                    .on_status_change(outcome.status, outcome.hint_code.as_deref())
                    .await
                    .map_err(BankIdError::Observer)?;
            }
        }
        self.last_status = Some(outcome.status);

        match outcome.status {
            OrderStatus::Complete => Ok(ControlFlow::Break(outcome)),
            OrderStatus::Failed => Err(BankIdError::OrderFailed {
                hint_code: outcome.hint_code,
            }),
            OrderStatus::Pending => Ok(ControlFlow::Continue(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        protocol::{JsonProtocol, RpcProtocol},
        status::{testing::json_completion_data, CompletionData},
        transport::MockTransport,
    };

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(OrderStatus, Option<String>)>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<(OrderStatus, Option<String>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusObserver for Recorder {
        async fn on_status_change(
            &self,
            status: OrderStatus,
            hint_code: Option<&str>,
        ) -> std::result::Result<(), BoxError> {
            self.seen
                .lock()
                .unwrap()
                .push((status, hint_code.map(str::to_string)));
            Ok(())
        }
    }

    struct Rejecting;

    #[async_trait]
    impl StatusObserver for Rejecting {
        async fn on_status_change(
            &self,
            _status: OrderStatus,
            _hint_code: Option<&str>,
        ) -> std::result::Result<(), BoxError> {
            Err("observer rejected".into())
        }
    }

    fn pending(hint: &str) -> serde_json::Value {
        json!({"orderRef": "ref-1", "status": "pending", "hintCode": hint})
    }

    fn always_pending(n: usize) -> MockTransport {
        (0..n).fold(MockTransport::new(), |mock, _| mock.respond(pending("userSign")))
    }

    fn schedule() -> Schedule {
        Schedule::new(Duration::from_secs(1))
    }

    #[test]
    fn test_normalize_interval() {
        assert_eq!(normalize_interval(Duration::from_millis(50)), MIN_POLL_INTERVAL);
        assert_eq!(normalize_interval(Duration::from_millis(2000)), Duration::from_millis(2000));
        assert_eq!(normalize_interval(Duration::from_secs(60)), MAX_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_fires_only_on_change() {
        let transport = Arc::new(
            MockTransport::new()
                .respond(pending("outstandingTransaction"))
                .respond(pending("outstandingTransaction"))
                .respond(json!({"orderRef": "ref-1", "status": "complete", "completionData": json_completion_data()})),
        );
        let protocol = JsonProtocol::new(transport.clone());
        let recorder = Recorder::default();
        let start = Instant::now();

        let mut poller = OrderPoller::new(&protocol, "ref-1").observer(Some(&recorder));
        assert_eq!(poller.state(), PollState::Idle);
        let outcome = poller.run(&schedule()).await.unwrap();

        let expected: CompletionData = serde_json::from_value(json_completion_data()).unwrap();
        assert_eq!(outcome.status, OrderStatus::Complete);
        assert_eq!(outcome.completion_data, Some(expected));
        assert_eq!(
            recorder.seen(),
            vec![
                (OrderStatus::Pending, Some("outstandingTransaction".to_string())),
                (OrderStatus::Complete, None),
            ]
        );
        assert_eq!(transport.call_count(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(poller.state(), PollState::Resolved(Resolution::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_order_keeps_hint_code() {
        let transport = Arc::new(MockTransport::new().respond(
            json!({"orderRef": "ref-1", "status": "failed", "hintCode": "userCancel"}),
        ));
        let protocol = JsonProtocol::new(transport.clone());
        let recorder = Recorder::default();

        let mut poller = OrderPoller::new(&protocol, "ref-1").observer(Some(&recorder));
        let err = poller.run(&schedule()).await.unwrap_err();

        assert_eq!(err.code(), "FAILED");
        assert_eq!(err.hint_code(), Some("userCancel"));
        assert_eq!(recorder.seen(), vec![(OrderStatus::Failed, Some("userCancel".to_string()))]);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(poller.state(), PollState::Resolved(Resolution::Failure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_failure_statuses() {
        let transport = Arc::new(
            MockTransport::new()
                .respond(json!({"progressStatus": "OUTSTANDING_TRANSACTION"}))
                .respond(json!({"progressStatus": "EXPIRED_TRANSACTION"})),
        );
        let protocol = RpcProtocol::new(transport);

        let err = OrderPoller::new(&protocol, "ref-1")
            .run(&schedule())
            .await
            .unwrap_err();
        assert_eq!(err.hint_code(), Some("EXPIRED_TRANSACTION"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_sub_status_change_is_not_reported() {
        let transport = Arc::new(
            MockTransport::new()
                .respond(json!({"progressStatus": "OUTSTANDING_TRANSACTION"}))
                .respond(json!({"progressStatus": "USER_SIGN"}))
                .respond(json!({
                    "progressStatus": "COMPLETE",
                    "signature": "c2ln",
                    "ocspResponse": "b2NzcA==",
                    "userInfo": {
                        "givenName": "Karl",
                        "surname": "Karlsson",
                        "name": "Karl Karlsson",
                        "personalNumber": "190000000000",
                        "notBefore": "2017-08-17T00:00:00.000+02:00",
                        "notAfter": "2019-08-17T23:59:59.000+02:00"
                    }
                })),
        );
        let protocol = RpcProtocol::new(transport.clone());
        let recorder = Recorder::default();

        let outcome = OrderPoller::new(&protocol, "ref-1")
            .observer(Some(&recorder))
            .run(&schedule())
            .await
            .unwrap();

        assert_eq!(outcome.status, OrderStatus::Complete);
        assert_eq!(
            recorder.seen(),
            vec![
                (OrderStatus::Pending, Some("OUTSTANDING_TRANSACTION".to_string())),
                (OrderStatus::Complete, None),
            ]
        );
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_status_checks_do_not_overlap() {
        let transport = Arc::new(
            MockTransport::new()
                .respond(pending("userSign"))
                .respond(pending("userSign"))
                .respond(json!({"orderRef": "ref-1", "status": "complete", "completionData": json_completion_data()}))
                .with_delay(Duration::from_millis(2500)),
        );
        let protocol = JsonProtocol::new(transport.clone());
        let interval = normalize_interval(Duration::from_millis(200));

        let outcome = OrderPoller::new(&protocol, "ref-1")
            .run(&Schedule::new(interval))
            .await
            .unwrap();

        assert_eq!(outcome.status, OrderStatus::Complete);
        assert_eq!(transport.call_count(), 3);
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_resolution_returns_at_once() {
        let transport = Arc::new(MockTransport::new().respond(
            json!({"orderRef": "ref-1", "status": "complete", "completionData": json_completion_data()}),
        ));
        let protocol = JsonProtocol::new(transport.clone());
        let start = Instant::now();

        let outcome = OrderPoller::new(&protocol, "ref-1")
            .run(&Schedule::new(MAX_POLL_INTERVAL))
            .await
            .unwrap();

        assert_eq!(outcome.order_ref, "ref-1");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_not_retried() {
        let transport = Arc::new(
            MockTransport::new()
                .respond(pending("userSign"))
                .fail(BankIdError::remote("connection reset"))
                .respond(pending("userSign")),
        );
        let protocol = JsonProtocol::new(transport.clone());

        let mut poller = OrderPoller::new(&protocol, "ref-1");
        let err = poller.run(&schedule()).await.unwrap_err();

        assert_eq!(err.description(), "connection reset");
        assert_eq!(transport.call_count(), 2);
        assert_eq!(poller.last_status(), Some(OrderStatus::Pending));
        assert_eq!(poller.state(), PollState::Resolved(Resolution::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_error_is_fatal() {
        let transport = Arc::new(always_pending(5));
        let protocol = JsonProtocol::new(transport.clone());

        let err = OrderPoller::new(&protocol, "ref-1")
            .observer(Some(&Rejecting))
            .run(&schedule())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "OBSERVER");
        assert!(err.to_string().contains("observer rejected"));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_observer() {
        let transport = Arc::new(
            MockTransport::new()
                .respond(pending("userSign"))
                .respond(json!({"orderRef": "ref-1", "status": "failed", "hintCode": "expiredTransaction"})),
        );
        let protocol = JsonProtocol::new(transport);
        let seen = Mutex::new(Vec::new());
        let observer = |status: OrderStatus, _hint: Option<&str>| seen.lock().unwrap().push(status);

        let result = OrderPoller::new(&protocol, "ref-1")
            .observer(Some(&observer))
            .run(&schedule())
            .await;

        assert!(result.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![OrderStatus::Pending, OrderStatus::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let transport = Arc::new(always_pending(10));
        let protocol = JsonProtocol::new(transport.clone());
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let mut poller = OrderPoller::new(&protocol, "ref-1");
        let err = poller
            .run(&schedule().with_cancel(token))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(transport.call_count(), 2);
        assert_eq!(poller.state(), PollState::Resolved(Resolution::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_lifetime_elapses() {
        let transport = Arc::new(always_pending(10));
        let protocol = JsonProtocol::new(transport.clone());

        let err = OrderPoller::new(&protocol, "ref-1")
            .run(&schedule().with_deadline(Some(Duration::from_millis(3500))))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "TIMEOUT");
        assert!(matches!(
            err,
            BankIdError::Transport(TransportError::Timeout(d)) if d == Duration::from_millis(3500)
        ));
        assert_eq!(transport.call_count(), 4);
    }
}
