//! 協定能力介面：把兩種協定的差異（請求形狀、狀態字串、回應格式）封裝在同一個 trait 後面。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    config::ProtocolVersion,
    error::{BankIdError, Result},
    order::OrderHandle,
    status::PollOutcome,
    transport::{Operation, Transport},
};

/// 一種協定版本所提供的操作。
#[async_trait]
pub trait Protocol: Send + Sync {
    /// 協定版本，決定請求文字的編碼方式。
    fn version(&self) -> ProtocolVersion;

    /// 送出驗證或簽署請求，回傳訂單代號。
    async fn initiate(&self, operation: Operation, params: Map<String, Value>) -> Result<OrderHandle>;

    /// 查詢一次訂單狀態。
    async fn poll_status(&self, order_ref: &str) -> Result<PollOutcome>;

    /// 取消進行中的訂單。
    async fn cancel(&self, order_ref: &str) -> Result<()>;
}

fn parse_handle(body: Value) -> Result<OrderHandle> {
    let handle: OrderHandle = serde_json::from_value(body)
        .map_err(|e| BankIdError::remote(format!("Invalid order response: {e}")))?;
    if handle.order_ref.is_empty() {
        return Err(BankIdError::remote("Order response has an empty orderRef"));
    }
    Ok(handle)
}

/// JSON 協定（v5）。
pub struct JsonProtocol {
    transport: Arc<dyn Transport>,
}

impl JsonProtocol {
    /// 透過指定的傳輸送出請求。
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Protocol for JsonProtocol {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::Json
    }

    async fn initiate(&self, operation: Operation, params: Map<String, Value>) -> Result<OrderHandle> {
        let body = self.transport.invoke(operation, Value::Object(params)).await?;
        let handle = parse_handle(body)?;
        debug!(%operation, order_ref = %handle.order_ref, "Order created");
        Ok(handle)
    }

    async fn poll_status(&self, order_ref: &str) -> Result<PollOutcome> {
        let body = self
            .transport
            .invoke(Operation::Collect, json!({ "orderRef": order_ref }))
            .await?;
        PollOutcome::from_json(order_ref, body)
    }

    async fn cancel(&self, order_ref: &str) -> Result<()> {
        self.transport
            .invoke(Operation::Cancel, json!({ "orderRef": order_ref }))
            .await?;
        Ok(())
    }
}

/// 舊版 RPC 協定（v4）。
pub struct RpcProtocol {
    transport: Arc<dyn Transport>,
}

impl RpcProtocol {
    /// 透過指定的傳輸送出請求。
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Protocol for RpcProtocol {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::Rpc
    }

    async fn initiate(&self, operation: Operation, params: Map<String, Value>) -> Result<OrderHandle> {
        let body = self.transport.invoke(operation, Value::Object(params)).await?;
        let handle = parse_handle(body)?;
        debug!(%operation, order_ref = %handle.order_ref, "Order created");
        Ok(handle)
    }

    async fn poll_status(&self, order_ref: &str) -> Result<PollOutcome> {
        let body = self
            .transport
            .invoke(Operation::Collect, json!({ "orderRef": order_ref }))
            .await?;
        PollOutcome::from_rpc(order_ref, body)
    }

    async fn cancel(&self, _order_ref: &str) -> Result<()> {
        Err(BankIdError::Unsupported("cancel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{status::OrderStatus, transport::MockTransport};

    #[tokio::test]
    async fn test_json_poll_status() {
        let transport = Arc::new(
            MockTransport::new().respond(json!({"orderRef": "ref-1", "status": "pending", "hintCode": "outstandingTransaction"})),
        );
        let protocol = JsonProtocol::new(transport.clone());

        let outcome = protocol.poll_status("ref-1").await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Pending);
        assert_eq!(outcome.hint_code.as_deref(), Some("outstandingTransaction"));
        assert_eq!(
            transport.calls(),
            vec![(Operation::Collect, json!({"orderRef": "ref-1"}))]
        );
    }

    #[tokio::test]
    async fn test_rpc_poll_status() {
        let transport = Arc::new(MockTransport::new().respond(json!({"progressStatus": "NO_CLIENT"})));
        let protocol = RpcProtocol::new(transport);

        let outcome = protocol.poll_status("ref-2").await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Failed);
        assert_eq!(outcome.hint_code.as_deref(), Some("NO_CLIENT"));
    }

    #[tokio::test]
    async fn test_initiate_parses_handle() {
        let transport = Arc::new(
            MockTransport::new()
                .respond(json!({"orderRef": "ref-3", "autoStartToken": "token-3"}))
                .respond(json!({"autoStartToken": "token-4"})),
        );
        let protocol = JsonProtocol::new(transport);

        let handle = protocol.initiate(Operation::Authenticate, Map::new()).await.unwrap();
        assert_eq!(handle.order_ref, "ref-3");
        assert_eq!(handle.auto_start_token.as_deref(), Some("token-3"));

        let err = protocol.initiate(Operation::Authenticate, Map::new()).await.unwrap_err();
        assert_eq!(err.code(), "ERROR");
    }

    #[tokio::test]
    async fn test_cancel() {
        let transport = Arc::new(MockTransport::new().respond(json!({})));
        let json_protocol = JsonProtocol::new(transport.clone());
        json_protocol.cancel("ref-5").await.unwrap();
        assert_eq!(transport.calls()[0].0, Operation::Cancel);

        let rpc_protocol = RpcProtocol::new(transport.clone());
        let err = rpc_protocol.cancel("ref-5").await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
        assert_eq!(transport.call_count(), 1);
    }
}
