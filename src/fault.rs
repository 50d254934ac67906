//! 錯誤分類器：把兩種協定各自的錯誤格式正規化成單一的 [`Fault`]。

use std::fmt;

use serde_json::Value;

/// RPC 協定中 SOAP Fault 細節所在的路徑。
pub const RP_FAULT_PATH: &str = "Envelope.Body.Fault.detail.RpFault";
/// SOAP Fault 的 `faultstring` 路徑，細節缺失時作為描述的後備來源。
const FAULT_STRING_PATH: &str = "Envelope.Body.Fault.faultstring";

/// 正規化後的遠端錯誤。
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// 錯誤代碼，例如 `alreadyInProgress`、`ALREADY_IN_PROGRESS` 或通用的 `ERROR`。
    pub status: String,
    /// 人類可讀的描述。
    pub description: String,
    /// 無法辨識的原始內容，僅供診斷用。
    pub payload: Option<Value>,
}

impl Fault {
    /// 無法取得更具體代碼時使用的通用代碼。
    pub const GENERIC_STATUS: &'static str = "ERROR";

    /// 以代碼與描述建立錯誤，不附帶原始內容。
    pub fn new(status: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            description: description.into(),
            payload: None,
        }
    }

    fn with_payload(mut self, payload: &Value) -> Self {
        self.payload = Some(payload.clone());
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{}: {}", self.status, self.description)
        }
    }
}

/// 尚未分類的原始錯誤。
#[derive(Debug, Clone, Copy)]
pub enum RawFault<'a> {
    /// 由 SOAP 回應轉換而來的樹狀結構，根節點為 `Envelope`。
    Rpc(&'a Value),
    /// JSON 協定的錯誤回應主體。
    Json(&'a Value),
    /// 純文字錯誤。
    Message(&'a str),
    /// 其他無法辨識的內容。
    Unknown(&'a Value),
}

/// 將原始錯誤分類為 [`Fault`]。
///
/// 任何缺少的欄位都不會造成失敗，而是退回通用代碼並保留原始內容。
pub fn classify(raw: RawFault<'_>) -> Fault {
    match raw {
        RawFault::Message(message) => Fault::new(Fault::GENERIC_STATUS, message),
        RawFault::Json(body) => {
            let Some(code) = lookup(body, "errorCode").and_then(Value::as_str) else {
                return classify(RawFault::Unknown(body));
            };
            let details = lookup(body, "details")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Fault::new(code, details)
        }
        RawFault::Rpc(tree) => {
            let detail = lookup(tree, RP_FAULT_PATH);
            let status = detail
                .and_then(|d| lookup(d, "faultStatus"))
                .and_then(Value::as_str);
            let description = detail
                .and_then(|d| lookup(d, "detailedDescription"))
                .and_then(Value::as_str)
                .or_else(|| lookup(tree, FAULT_STRING_PATH).and_then(Value::as_str))
                .unwrap_or_default();
            match status {
                Some(status) => Fault::new(status, description),
                None => Fault::new(Fault::GENERIC_STATUS, description).with_payload(tree),
            }
        }
        RawFault::Unknown(value) => match value {
            Value::String(message) => classify(RawFault::Message(message)),
            other => Fault::new(Fault::GENERIC_STATUS, "Unrecognized error response")
                .with_payload(other),
        },
    }
}

/// 依照以 `.` 分隔的路徑逐層取值。
///
/// 物件以鍵名取值，陣列以索引取值；任何一段不存在即回傳 `None`。
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
