use std::{error::Error as StdError, time::Duration};

use thiserror::Error;

use crate::fault::Fault;

/// 觀察者回呼可能回傳的錯誤型別。
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// 傳輸層錯誤：網路、TLS 或逾時。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 單次 HTTP 請求失敗，包含連線、TLS 握手與單次請求逾時。
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// 訂單的整體存活時間已用盡。
    #[error("Order lifetime of {0:?} elapsed")]
    Timeout(Duration),
}

/// 本庫所有操作共用的錯誤列舉。
///
/// 呼叫端應只依賴 [`BankIdError::code`] 與 [`BankIdError::description`]，
/// 不同協定的錯誤格式都已被 [`crate::fault::classify`] 正規化。
#[derive(Debug, Error)]
pub enum BankIdError {
    /// 請求資料不合法，在任何網路請求之前就被拒絕。
    #[error("Validation error: {0}")]
    Validation(String),
    /// 憑證資料無法讀取或格式錯誤。
    #[error("Initialization failed: {source_name}: {source}")]
    Initialization {
        source_name: String,
        #[source]
        source: BoxError,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// 伺服器回傳協定層級的錯誤（JSON 錯誤封包或 SOAP Fault）。
    #[error("Remote fault: {0}")]
    RemoteFault(Fault),
    /// 訂單以 FAILED 狀態結束。
    #[error("Order failed: {}", .hint_code.as_deref().unwrap_or("no hint code"))]
    OrderFailed { hint_code: Option<String> },
    #[error("Order polling was cancelled")]
    Cancelled,
    /// 狀態觀察者回呼失敗，輪詢隨之終止。
    #[error("Status observer failed: {0}")]
    Observer(BoxError),
    #[error("Operation not supported by this protocol: {0}")]
    Unsupported(&'static str),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BankIdError {
    /// 建立初始化錯誤，保留底層錯誤作為 `source`。
    pub fn initialization(
        source_name: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Initialization {
            source_name: source_name.into(),
            source: source.into(),
        }
    }

    /// 以單一字串建立遠端錯誤，狀態碼為通用的 `ERROR`。
    pub fn remote(description: impl AsRef<str>) -> Self {
        Self::RemoteFault(crate::fault::classify(crate::fault::RawFault::Message(
            description.as_ref(),
        )))
    }

    /// 回傳正規化後的錯誤代碼。
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::Initialization { .. } => "INITIALIZATION",
            Self::Transport(TransportError::Http(_)) => "TRANSPORT",
            Self::Transport(TransportError::Timeout(_)) => "TIMEOUT",
            Self::RemoteFault(fault) => fault.status.as_str(),
            Self::OrderFailed { .. } => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Observer(_) => "OBSERVER",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Configuration(_) => "CONFIGURATION",
        }
    }

    /// 回傳可供記錄或顯示的錯誤描述。
    pub fn description(&self) -> String {
        match self {
            Self::RemoteFault(fault) => fault.description.clone(),
            Self::OrderFailed { hint_code } => hint_code.clone().unwrap_or_default(),
            other => other.to_string(),
        }
    }

    /// 訂單失敗時的提示代碼（例如 `userCancel`、`expiredTransaction`）。
    pub fn hint_code(&self) -> Option<&str> {
        match self {
            Self::OrderFailed { hint_code } => hint_code.as_deref(),
            _ => None,
        }
    }
}

/// 本庫的結果型別。
pub type Result<T> = std::result::Result<T, BankIdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_normalized() {
        assert_eq!(BankIdError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(BankIdError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            BankIdError::Transport(TransportError::Timeout(Duration::from_secs(1))).code(),
            "TIMEOUT"
        );
        assert_eq!(BankIdError::remote("boom").code(), "ERROR");
        assert_eq!(BankIdError::remote("boom").description(), "boom");
    }

    #[test]
    fn test_order_failed_keeps_hint_code() {
        let err = BankIdError::OrderFailed {
            hint_code: Some("userCancel".into()),
        };
        assert_eq!(err.code(), "FAILED");
        assert_eq!(err.hint_code(), Some("userCancel"));
        assert_eq!(err.to_string(), "Order failed: userCancel");
    }

    #[test]
    fn test_initialization_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = BankIdError::initialization("/tmp/client.p12", io);
        assert!(err.to_string().contains("no such file"));
        let source = StdError::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("no such file"));
    }
}
