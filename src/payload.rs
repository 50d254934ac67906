use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::ProtocolVersion,
    error::{BankIdError, Result},
};

/// 使用者可見文字編碼後的長度上限。
pub const MAX_VISIBLE_DATA_LEN: usize = 40_000;
/// 使用者不可見資料編碼後的長度上限。
pub const MAX_NON_VISIBLE_DATA_LEN: usize = 200_000;

/// 簽署文字在傳輸時的編碼方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// JSON 協定使用的標準 Base64。
    Base64,
    /// RPC 協定直接送出原文。
    Raw,
}

impl TextEncoding {
    /// 依編碼方式轉換 UTF-8 文字。
    pub fn encode(&self, text: &str) -> String {
        match self {
            Self::Base64 => STANDARD.encode(text.as_bytes()),
            Self::Raw => text.to_string(),
        }
    }
}

impl ProtocolVersion {
    /// 使用者可見文字的編碼；RPC 協定的結構描述要求原始文字。
    pub fn visible_text_encoding(&self) -> TextEncoding {
        match self {
            Self::Json => TextEncoding::Base64,
            Self::Rpc => TextEncoding::Raw,
        }
    }

    /// 使用者不可見資料在兩種協定中都以 Base64 傳送。
    pub fn non_visible_text_encoding(&self) -> TextEncoding {
        TextEncoding::Base64
    }
}

/// 定義所有 API 載荷（Payload）必須實作的功能。
///
/// 該 trait 要求實作者能夠序列化、反序列化，並在送出前驗證自身資料。
pub trait PayloadT: Serialize + for<'de> Deserialize<'de> {
    /// 驗證載荷資料是否符合預期的規範。
    ///
    /// # Errors
    ///
    /// 若驗證失敗，則回傳 [`BankIdError::Validation`]。
    fn validate(&self) -> Result<()>;

    /// 額外合併進請求的選項。
    fn options(&self) -> Option<&OrderOptions> {
        None
    }

    /// 將載荷轉換成具名參數。
    ///
    /// 選項中的鍵只會補上尚未存在的欄位，不會覆寫載荷本身計算出的值。
    fn to_params(&self) -> Result<Map<String, Value>> {
        let mut params = match to_value(self)? {
            Value::Object(params) => params,
            other => {
                return Err(BankIdError::Validation(format!(
                    "Payload must serialize to an object, got {other}"
                )))
            }
        };
        if let Some(options) = self.options() {
            if let Value::Object(extra) = to_value(options)? {
                for (key, value) in extra {
                    params.entry(key).or_insert(value);
                }
            }
        }
        Ok(params)
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BankIdError::Validation(e.to_string()))
}

/// 附加在驗證或簽署請求上的選項。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personal_number: Option<String>,
    /// JSON 協定的需求條件，內容原樣轉送。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement_alternatives: Option<Vec<RequirementAlternative>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_user_info: Option<Vec<EndUserInfo>>,
}

impl OrderOptions {
    /// 不含任何選項。
    pub fn new() -> Self {
        Self::default()
    }

    /// 限定只有此身分證號的使用者可以完成訂單。
    pub fn personal_number(mut self, personal_number: impl Into<String>) -> Self {
        self.personal_number = Some(personal_number.into());
        self
    }

    /// 設定 JSON 協定的需求條件。
    pub fn requirement(mut self, requirement: Value) -> Self {
        self.requirement = Some(requirement);
        self
    }

    /// 加入一組替代需求條件。
    pub fn requirement_alternative(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirement_alternatives
            .get_or_insert_with(Vec::new)
            .push(RequirementAlternative {
                requirement: RequirementCondition {
                    key: key.into(),
                    value: value.into(),
                },
            });
        self
    }

    /// 加入一筆 RPC 協定的終端使用者資訊。
    pub fn end_user_info(mut self, type_: impl Into<String>, value: impl Into<String>) -> Self {
        self.end_user_info.get_or_insert_with(Vec::new).push(EndUserInfo {
            type_: type_.into(),
            value: value.into(),
        });
        self
    }
}

/// RPC 協定的一組替代需求條件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementAlternative {
    pub requirement: RequirementCondition,
}

/// 單一需求條件的鍵值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementCondition {
    pub key: String,
    pub value: String,
}

/// 終端使用者的附加資訊，例如 `IP_ADDR`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndUserInfo {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

/// 將終端使用者識別值放到對應協定的欄位。
///
/// JSON 協定要求終端使用者的 IP 位址；RPC 協定則為可省略的身分證號。
fn end_user_fields(protocol: ProtocolVersion, end_user: &str) -> (Option<String>, Option<String>) {
    let end_user = (!end_user.is_empty()).then(|| end_user.to_string());
    match protocol {
        ProtocolVersion::Json => (end_user, None),
        ProtocolVersion::Rpc => (None, end_user),
    }
}

fn require_end_user_ip(end_user_ip: &Option<String>, protocol: ProtocolVersion) -> Result<()> {
    if protocol == ProtocolVersion::Json && end_user_ip.is_none() {
        return Err(BankIdError::Validation(
            "End user IP address is required".to_string(),
        ));
    }
    Ok(())
}

/// 驗證請求的載荷資料。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    end_user_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    personal_number: Option<String>,
    #[serde(skip)]
    protocol: ProtocolVersion,
    #[serde(skip)]
    options: OrderOptions,
}

impl AuthPayload {
    /// 建立一個新的 `AuthPayload` 實例。
    ///
    /// `end_user` 在 JSON 協定中為終端使用者 IP，在 RPC 協定中為身分證號。
    pub fn new(protocol: ProtocolVersion, end_user: &str, options: OrderOptions) -> Self {
        let (end_user_ip, personal_number) = end_user_fields(protocol, end_user);
        Self {
            end_user_ip,
            personal_number,
            protocol,
            options,
        }
    }
}

impl PayloadT for AuthPayload {
    fn validate(&self) -> Result<()> {
        require_end_user_ip(&self.end_user_ip, self.protocol)
    }

    fn options(&self) -> Option<&OrderOptions> {
        Some(&self.options)
    }
}

/// 簽署請求的載荷資料，文字已依協定編碼。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    end_user_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    personal_number: Option<String>,
    user_visible_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_non_visible_data: Option<String>,
    #[serde(skip)]
    protocol: ProtocolVersion,
    #[serde(skip)]
    options: OrderOptions,
}

impl SignPayload {
    /// 建立一個新的 `SignPayload` 實例，並依協定編碼可見與不可見文字；空的不可見文字視為未提供。
    pub fn new(
        protocol: ProtocolVersion,
        end_user: &str,
        visible_text: &str,
        hidden_text: Option<&str>,
        options: OrderOptions,
    ) -> Self {
        let (end_user_ip, personal_number) = end_user_fields(protocol, end_user);
        Self {
            end_user_ip,
            personal_number,
            user_visible_data: protocol.visible_text_encoding().encode(visible_text),
            user_non_visible_data: hidden_text
                .filter(|text| !text.is_empty())
                .map(|text| protocol.non_visible_text_encoding().encode(text)),
            protocol,
            options,
        }
    }
}

impl PayloadT for SignPayload {
    /// 驗證簽署載荷資料：
    ///
    /// - 可見文字不得為空，編碼後不得超過 40,000 字元。
    /// - 不可見資料編碼後不得超過 200,000 字元。
    fn validate(&self) -> Result<()> {
        require_end_user_ip(&self.end_user_ip, self.protocol)?;
        if self.user_visible_data.is_empty() {
            return Err(BankIdError::Validation(
                "User visible data is required".to_string(),
            ));
        }
        let visible_len = self.user_visible_data.chars().count();
        if visible_len > MAX_VISIBLE_DATA_LEN {
            return Err(BankIdError::Validation(format!(
                "User visible data is {visible_len} characters, limit is {MAX_VISIBLE_DATA_LEN}"
            )));
        }
        if let Some(hidden) = &self.user_non_visible_data {
            let hidden_len = hidden.chars().count();
            if hidden_len > MAX_NON_VISIBLE_DATA_LEN {
                return Err(BankIdError::Validation(format!(
                    "User non-visible data is {hidden_len} characters, limit is {MAX_NON_VISIBLE_DATA_LEN}"
                )));
            }
        }
        Ok(())
    }

    fn options(&self) -> Option<&OrderOptions> {
        Some(&self.options)
    }
}
