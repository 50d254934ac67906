use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    credential::CredentialStore,
    error::Result,
    payload::{AuthPayload, OrderOptions, PayloadT, SignPayload},
    protocol::Protocol,
    transport::Operation,
};

/// 伺服器為一筆訂單指派的代號。
///
/// 每次成功發起訂單時回傳一次，之後每次輪詢都必須原樣帶上 `order_ref`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderHandle {
    pub order_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start_token: Option<String>,
}

/// 發起驗證與簽署訂單。
///
/// 載荷會先驗證，驗證失敗時不會載入憑證，也不會送出任何請求。
pub struct OrderInitiator<'a> {
    protocol: &'a dyn Protocol,
    credentials: &'a CredentialStore,
}

impl<'a> OrderInitiator<'a> {
    /// 綁定協定與憑證存放區。
    pub fn new(protocol: &'a dyn Protocol, credentials: &'a CredentialStore) -> Self {
        Self {
            protocol,
            credentials,
        }
    }

    /// 發起身分驗證訂單。
    ///
    /// `end_user` 在 JSON 協定中為終端使用者 IP，在 RPC 協定中為身分證號（可為空）。
    pub async fn authenticate(&self, end_user: &str, options: OrderOptions) -> Result<OrderHandle> {
        let payload = AuthPayload::new(self.protocol.version(), end_user, options);
        self.initiate(Operation::Authenticate, &payload).await
    }

    /// 發起簽署訂單。
    ///
    /// # Errors
    ///
    /// 可見文字編碼後超過 40,000 字元，或不可見資料編碼後超過 200,000 字元時，
    /// 在任何網路請求之前回傳 [`crate::BankIdError::Validation`]。
    pub async fn sign(
        &self,
        end_user: &str,
        visible_text: &str,
        hidden_text: Option<&str>,
        options: OrderOptions,
    ) -> Result<OrderHandle> {
        let payload = SignPayload::new(
            self.protocol.version(),
            end_user,
            visible_text,
            hidden_text,
            options,
        );
        self.initiate(Operation::Sign, &payload).await
    }

    async fn initiate<P: PayloadT + Sync>(&self, operation: Operation, payload: &P) -> Result<OrderHandle> {
        payload.validate()?;
        let params = payload.to_params()?;
        self.credentials.load().await?;
        debug!(%operation, "Initiating order");
        self.protocol.initiate(operation, params).await
    }
}
