//! 安全傳輸轉接層：把一次遠端呼叫包裝成統一的 `invoke(operation, payload)`。
//!
//! 傳輸層只負責單一請求，不做任何重試；重試屬於輪詢器的責任。

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{BankIdError, Result, TransportError},
    fault::{classify, lookup, Fault, RawFault},
    tls::Connector,
    xml,
};

/// 遠端 API 提供的操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Authenticate,
    Sign,
    Collect,
    Cancel,
}

impl Operation {
    /// 操作名稱。
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Sign => "sign",
            Self::Collect => "collect",
            Self::Cancel => "cancel",
        }
    }

    /// JSON 協定中相對於基礎 URL 的路徑。
    pub fn path(&self) -> &'static str {
        match self {
            Self::Authenticate => "/auth",
            Self::Sign => "/sign",
            Self::Collect => "/collect",
            Self::Cancel => "/cancel",
        }
    }

    /// RPC 協定中的遠端程序名稱，即操作名稱的 PascalCase。
    pub fn procedure(&self) -> String {
        pascal_case(self.name())
    }

    /// RPC 請求中包裝參數的元素名稱；`collect` 直接以參數作為 Body 內容。
    fn request_element(&self) -> Option<String> {
        match self {
            Self::Collect => None,
            other => Some(format!("{}Request", other.procedure())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn pascal_case(name: &str) -> String {
    name.split(['_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// 定義單次遠端呼叫的行為。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 送出一次請求並回傳解析後的回應。
    ///
    /// # Errors
    ///
    /// 網路或 TLS 失敗時回傳 [`BankIdError::Transport`]；
    /// 伺服器回傳錯誤時回傳經分類的 [`BankIdError::RemoteFault`]。
    async fn invoke(&self, operation: Operation, payload: Value) -> Result<Value>;
}

/// JSON over HTTPS 傳輸。
#[derive(Debug)]
pub struct JsonTransport {
    base_url: String,
    connector: Connector,
}

impl JsonTransport {
    /// `base_url` 結尾的 `/` 會被移除。
    pub fn new(base_url: impl Into<String>, connector: Connector) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connector,
        }
    }
}

#[async_trait]
impl Transport for JsonTransport {
    async fn invoke(&self, operation: Operation, payload: Value) -> Result<Value> {
        let client = self.connector.client().await?;
        let url = format!("{}{}", self.base_url, operation.path());
        debug!(%operation, %url, "Sending JSON request");

        let response = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = response.status();
        let text = response.text().await.map_err(TransportError::from)?;

        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !status.is_success() => return Err(http_fault(status, text)),
            Err(e) => return Err(BankIdError::remote(format!("Invalid JSON response: {e}"))),
        };

        if body.get("errorCode").is_some() {
            let fault = classify(RawFault::Json(&body));
            warn!(%operation, %fault, "Remote fault");
            return Err(BankIdError::RemoteFault(fault));
        }
        if !status.is_success() {
            return Err(http_fault(status, text));
        }
        Ok(body)
    }
}

/// 舊版 RPC（SOAP）傳輸。
#[derive(Debug)]
pub struct RpcTransport {
    endpoint: String,
    connector: Connector,
}

impl RpcTransport {
    /// 所有操作都送到同一個 SOAP 端點。
    pub fn new(endpoint: impl Into<String>, connector: Connector) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
        }
    }
}

#[async_trait]
impl Transport for RpcTransport {
    async fn invoke(&self, operation: Operation, payload: Value) -> Result<Value> {
        let client = self.connector.client().await?;
        let params = match payload {
            Value::Object(map) => map,
            Value::Null => Default::default(),
            other => {
                return Err(BankIdError::Validation(format!(
                    "RPC parameters must be named, got {other}"
                )))
            }
        };
        let procedure = operation.procedure();
        let envelope = xml::envelope(operation.request_element().as_deref(), &params);
        debug!(%procedure, endpoint = %self.endpoint, "Sending RPC request");

        let response = client
            .post(&self.endpoint)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{procedure}\""))
            .body(envelope)
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = response.status();
        let text = response.text().await.map_err(TransportError::from)?;

        let tree = match xml::parse(&text) {
            Ok(tree) => tree,
            Err(_) if !status.is_success() => return Err(http_fault(status, text)),
            Err(e) => return Err(BankIdError::remote(e.to_string())),
        };

        if lookup(&tree, "Envelope.Body.Fault").is_some() {
            let fault = classify(RawFault::Rpc(&tree));
            warn!(%procedure, %fault, "Remote fault");
            return Err(BankIdError::RemoteFault(fault));
        }
        if !status.is_success() {
            return Err(http_fault(status, text));
        }

        match lookup(&tree, "Envelope.Body") {
            Some(Value::Object(body)) => Ok(body.values().next().cloned().unwrap_or(Value::Null)),
            _ => Err(BankIdError::RemoteFault(
                Fault::new(Fault::GENERIC_STATUS, "SOAP response has no body"),
            )),
        }
    }
}

fn http_fault(status: StatusCode, body: String) -> BankIdError {
    BankIdError::RemoteFault(Fault::new(status.as_str(), body))
}

/// 依腳本回應的傳輸實作，通常用於測試環境。
///
/// 會記錄每次呼叫，並追蹤同時進行中的呼叫數量上限。
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<Value>>>,
    calls: Mutex<Vec<(Operation, Value)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    /// 不含任何預設回應。
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一筆成功回應。
    pub fn respond(self, value: Value) -> Self {
        self.push(Ok(value))
    }

    /// 加入一筆失敗回應。
    pub fn fail(self, error: BankIdError) -> Self {
        self.push(Err(error))
    }

    /// 每次呼叫在回應前等待的時間。
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, entry: Result<Value>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
        self
    }

    /// 至今收到的所有呼叫。
    pub fn calls(&self) -> Vec<(Operation, Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 至今收到的呼叫次數。
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 觀察到的最大同時呼叫數。
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(&self, operation: Operation, payload: Value) -> Result<Value> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((operation, payload));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| Err(BankIdError::remote("no scripted response left")))
    }
}
