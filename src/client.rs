use std::{fmt, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::{
    collect::{normalize_interval, OrderPoller, StatusObserver},
    config::{BankIdConfig, ProtocolVersion},
    credential::CredentialStore,
    error::Result,
    order::{OrderHandle, OrderInitiator},
    payload::OrderOptions,
    protocol::{JsonProtocol, Protocol, RpcProtocol},
    schedule::Schedule,
    status::PollOutcome,
    tls::Connector,
    transport::{JsonTransport, RpcTransport, Transport},
};

/// BankID 依賴方用戶端。
///
/// 以 [`crate::BankIdBuilder`] 建立。憑證在第一次需要時載入一次，之後所有操作共用。
pub struct BankId {
    config: BankIdConfig,
    credentials: Arc<CredentialStore>,
    protocol: Arc<dyn Protocol>,
}

impl BankId {
    pub(crate) fn from_config(credentials: Arc<CredentialStore>, config: BankIdConfig) -> Self {
        let connector = Connector::mutual_tls(credentials.clone(), Some(config.request_timeout));
        let endpoint = config.endpoint().to_string();
        let protocol: Arc<dyn Protocol> = match config.protocol {
            ProtocolVersion::Json => {
                let transport: Arc<dyn Transport> = Arc::new(JsonTransport::new(endpoint, connector));
                Arc::new(JsonProtocol::new(transport))
            }
            ProtocolVersion::Rpc => {
                let transport: Arc<dyn Transport> = Arc::new(RpcTransport::new(endpoint, connector));
                Arc::new(RpcProtocol::new(transport))
            }
        };
        Self {
            config,
            credentials,
            protocol,
        }
    }

    /// 以自訂的協定實作建立用戶端，例如搭配 [`crate::transport::MockTransport`]。
    pub fn with_protocol(
        protocol: Arc<dyn Protocol>,
        credentials: Arc<CredentialStore>,
        config: BankIdConfig,
    ) -> Self {
        Self {
            config: BankIdConfig {
                protocol: protocol.version(),
                ..config
            },
            credentials,
            protocol,
        }
    }

    /// 建立時使用的設定。
    pub fn config(&self) -> &BankIdConfig {
        &self.config
    }

    /// 載入並驗證憑證。重複呼叫不會重新讀取。
    ///
    /// # Errors
    ///
    /// 憑證無法讀取或解析時回傳 [`crate::BankIdError::Initialization`]。
    pub async fn init(&self) -> Result<()> {
        self.credentials.load().await?;
        Ok(())
    }

    /// 發起身分驗證。
    ///
    /// `end_user` 在 JSON 協定中為終端使用者 IP，在 RPC 協定中為身分證號，
    /// RPC 協定允許空字串，由行動裝置決定使用者身分。
    #[instrument(skip(self, end_user, options), fields(protocol = %self.config.protocol))]
    pub async fn authenticate(&self, end_user: &str, options: OrderOptions) -> Result<OrderHandle> {
        OrderInitiator::new(self.protocol.as_ref(), &self.credentials)
            .authenticate(end_user, options)
            .await
    }

    /// 發起簽署。
    #[instrument(
        skip(self, end_user, visible_text, hidden_text, options),
        fields(protocol = %self.config.protocol)
    )]
    pub async fn sign(
        &self,
        end_user: &str,
        visible_text: &str,
        hidden_text: Option<&str>,
        options: OrderOptions,
    ) -> Result<OrderHandle> {
        OrderInitiator::new(self.protocol.as_ref(), &self.credentials)
            .sign(end_user, visible_text, hidden_text, options)
            .await
    }

    /// 取消進行中的訂單。
    ///
    /// # Errors
    ///
    /// RPC 協定不支援取消，回傳 [`crate::BankIdError::Unsupported`]。
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_ref: &str) -> Result<()> {
        self.init().await?;
        self.protocol.cancel(order_ref).await?;
        info!("Order cancelled");
        Ok(())
    }

    /// 輪詢訂單直到完成或失敗。
    ///
    /// `interval` 為 `None` 時使用設定的預設間隔；間隔會被夾在 1 到 10 秒之間。
    /// 狀態改變時才會呼叫 `observer`，同樣的狀態重複出現不會再次呼叫。
    pub async fn collect(
        &self,
        order_ref: &str,
        interval: Option<Duration>,
        observer: Option<&dyn StatusObserver>,
    ) -> Result<PollOutcome> {
        self.collect_until(order_ref, interval, observer, CancellationToken::new())
            .await
    }

    /// 與 [`BankId::collect`] 相同，但可由 `cancel` 權杖隨時中止，
    /// 中止時回傳 [`crate::BankIdError::Cancelled`]。
    #[instrument(skip(self, interval, observer, cancel))]
    pub async fn collect_until(
        &self,
        order_ref: &str,
        interval: Option<Duration>,
        observer: Option<&dyn StatusObserver>,
        cancel: CancellationToken,
    ) -> Result<PollOutcome> {
        self.init().await?;
        let schedule = Schedule::new(normalize_interval(
            interval.unwrap_or(self.config.poll_interval),
        ))
        .with_cancel(cancel)
        .with_deadline(self.config.order_lifetime);

        OrderPoller::new(self.protocol.as_ref(), order_ref)
            .observer(observer)
            .run(&schedule)
            .await
    }
}

impl fmt::Debug for BankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankId")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}
