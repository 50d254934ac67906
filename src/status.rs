//! 訂單狀態與輪詢結果。

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BankIdError, Result};

/// 正規化後的訂單狀態，兩種協定共用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Failed,
    Complete,
}

impl OrderStatus {
    /// 解析 JSON 協定的狀態字串。
    ///
    /// # Errors
    ///
    /// 遇到未知的狀態時回傳 [`BankIdError::RemoteFault`]。
    pub fn from_json(status: &str) -> Result<Self> {
        status
            .parse()
            .map_err(|_| BankIdError::remote(format!("Unknown order status: {status}")))
    }

    /// 將 RPC 協定的 `progressStatus` 正規化；未列出的值都視為進行中。
    pub fn from_rpc(progress_status: &str) -> Self {
        match progress_status {
            "COMPLETE" => Self::Complete,
            "NO_CLIENT" | "EXPIRED_TRANSACTION" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// 是否為終結狀態。
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// 小寫的狀態名稱，與 JSON 協定一致。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            "complete" => Ok(Self::Complete),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次狀態查詢的結果。
///
/// `completion_data` 只在狀態為 [`OrderStatus::Complete`] 時存在。
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub order_ref: String,
    pub status: OrderStatus,
    pub hint_code: Option<String>,
    pub completion_data: Option<CompletionData>,
}

impl PollOutcome {
    /// 建立結果並確保完成資料與狀態一致。
    ///
    /// # Errors
    ///
    /// 狀態為完成卻缺少完成資料時回傳 [`BankIdError::RemoteFault`]。
    pub fn new(
        order_ref: impl Into<String>,
        status: OrderStatus,
        hint_code: Option<String>,
        completion_data: Option<CompletionData>,
    ) -> Result<Self> {
        let completion_data = match status {
            OrderStatus::Complete => Some(completion_data.ok_or_else(|| {
                BankIdError::remote("Completed order is missing completion data")
            })?),
            _ => None,
        };
        Ok(Self {
            order_ref: order_ref.into(),
            status,
            hint_code: hint_code.filter(|h| !h.is_empty()),
            completion_data,
        })
    }

    /// 解析 JSON 協定的 `collect` 回應。
    pub fn from_json(order_ref: &str, body: Value) -> Result<Self> {
        let response: JsonCollectResponse = serde_json::from_value(body)
            .map_err(|e| BankIdError::remote(format!("Invalid collect response: {e}")))?;
        let status = OrderStatus::from_json(&response.status)?;
        Self::new(
            response.order_ref.unwrap_or_else(|| order_ref.to_string()),
            status,
            response.hint_code,
            response.completion_data,
        )
    }

    /// 解析 RPC 協定的 `Collect` 回應，原始的 `progressStatus` 保留為提示代碼。
    pub fn from_rpc(order_ref: &str, body: Value) -> Result<Self> {
        let response: RpcCollectResponse = serde_json::from_value(body)
            .map_err(|e| BankIdError::remote(format!("Invalid collect response: {e}")))?;
        let status = OrderStatus::from_rpc(&response.progress_status);
        let hint_code = (status != OrderStatus::Complete).then_some(response.progress_status);
        let completion_data = match (response.user_info, response.signature, response.ocsp_response) {
            (Some(user), Some(signature), Some(ocsp_response)) => Some(CompletionData {
                user: User {
                    personal_number: user.personal_number,
                    name: user.name,
                    given_name: user.given_name,
                    surname: user.surname,
                },
                device: user.ip_address.map(|ip_address| Device { ip_address }),
                cert: CertValidity {
                    not_before: user.not_before,
                    not_after: user.not_after,
                },
                signature,
                ocsp_response,
            }),
            _ => None,
        };
        Self::new(order_ref, status, hint_code, completion_data)
    }
}

/// 訂單成功完成時回傳的身分與密碼學證明。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionData {
    pub user: User,
    #[serde(default)]
    pub device: Option<Device>,
    pub cert: CertValidity,
    /// Base64 編碼的簽章（XML 文件）。
    pub signature: String,
    /// Base64 編碼的 OCSP 回應。
    pub ocsp_response: String,
}

impl CompletionData {
    /// 解碼簽章內容為 XML 文字。
    pub fn signature_xml(&self) -> Result<String> {
        let bytes = STANDARD
            .decode(&self.signature)
            .map_err(|e| BankIdError::remote(format!("Invalid signature encoding: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| BankIdError::remote(format!("Signature is not UTF-8: {e}")))
    }
}

/// 完成驗證或簽署的使用者。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub personal_number: String,
    pub name: String,
    pub given_name: String,
    pub surname: String,
}

/// 使用者裝置資訊。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub ip_address: String,
}

/// 使用者憑證的有效期間，以伺服器回傳的原始字串保存。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertValidity {
    pub not_before: String,
    pub not_after: String,
}

impl CertValidity {
    /// 解析後的生效時間，格式無法辨識時為 `None`。
    pub fn not_before_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.not_before)
    }

    /// 解析後的到期時間，格式無法辨識時為 `None`。
    pub fn not_after_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.not_after)
    }
}

/// JSON 協定回傳 Unix 毫秒，RPC 協定回傳 `xs:dateTime`。
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().ok().and_then(DateTime::from_timestamp_millis);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonCollectResponse {
    order_ref: Option<String>,
    status: String,
    hint_code: Option<String>,
    completion_data: Option<CompletionData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcCollectResponse {
    progress_status: String,
    signature: Option<String>,
    user_info: Option<RpcUserInfo>,
    ocsp_response: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcUserInfo {
    personal_number: String,
    name: String,
    given_name: String,
    surname: String,
    not_before: String,
    not_after: String,
    ip_address: Option<String>,
}

#[cfg(test)]
pub(crate) mod testing {
    use serde_json::{json, Value};

    /// JSON 協定中典型的完成資料。
    pub(crate) fn json_completion_data() -> Value {
        json!({
            "user": {
                "personalNumber": "190000000000",
                "name": "Karl Karlsson",
                "givenName": "Karl",
                "surname": "Karlsson"
            },
            "device": {"ipAddress": "192.168.0.1"},
            "cert": {"notBefore": "1502983274000", "notAfter": "1563549674000"},
            "signature": "PHNpZ25hdHVyZT50ZXN0PC9zaWduYXR1cmU+",
            "ocspResponse": "MIIHfgoBAKCCB3cw"
        })
    }
}
