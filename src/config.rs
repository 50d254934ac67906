//! 用戶端設定與建構器。

use std::{env, fmt, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use secrecy::SecretString;
use tracing::warn;

use crate::{
    client::BankId,
    credential::CredentialStore,
    error::{BankIdError, Result},
};

/// 遠端 API 的協定版本。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// JSON over HTTPS（v5）。
    #[default]
    Json,
    /// 舊版 SOAP RPC（v4）。
    Rpc,
}

impl ProtocolVersion {
    const JSON_PRODUCTION_URL: &'static str = "https://appapi2.bankid.com/rp/v5";
    const JSON_TEST_URL: &'static str = "https://appapi2.test.bankid.com/rp/v5";
    const RPC_PRODUCTION_URL: &'static str = "https://appapi2.bankid.com/rp/v4";
    const RPC_TEST_URL: &'static str = "https://appapi2.test.bankid.com/rp/v4";

    /// 依環境回傳預設端點。
    pub fn endpoint(&self, production: bool) -> &'static str {
        match (self, production) {
            (Self::Json, true) => Self::JSON_PRODUCTION_URL,
            (Self::Json, false) => Self::JSON_TEST_URL,
            (Self::Rpc, true) => Self::RPC_PRODUCTION_URL,
            (Self::Rpc, false) => Self::RPC_TEST_URL,
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = BankIdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "v5" => Ok(Self::Json),
            "rpc" | "soap" | "v4" => Ok(Self::Rpc),
            other => Err(BankIdError::Configuration(format!(
                "Unknown protocol version: {other}"
            ))),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Rpc => f.write_str("rpc"),
        }
    }
}

/// 建構完成後的用戶端設定。
#[derive(Debug, Clone)]
pub struct BankIdConfig {
    pub protocol: ProtocolVersion,
    pub production: bool,
    /// 覆寫預設端點。
    pub base_url: Option<String>,
    /// 單次 HTTP 請求的逾時。
    pub request_timeout: Duration,
    /// 訂單整體的存活時間，`None` 表示輪詢直到終結狀態。
    pub order_lifetime: Option<Duration>,
    /// 預設輪詢間隔。
    pub poll_interval: Duration,
}

impl BankIdConfig {
    /// 實際使用的端點：有覆寫時用覆寫值，否則依協定與環境選擇。
    pub fn endpoint(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.protocol.endpoint(self.production))
    }

    /// 端點是否為 HTTPS。純 HTTP 端點不會進行 TLS 握手，客戶端憑證也不會送出。
    pub fn is_mutual_tls(&self) -> bool {
        self.endpoint().starts_with("https://")
    }
}

impl Default for BankIdConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::default(),
            production: false,
            base_url: None,
            request_timeout: BankIdBuilder::DEFAULT_REQUEST_TIMEOUT,
            order_lifetime: Some(BankIdBuilder::DEFAULT_ORDER_LIFETIME),
            poll_interval: BankIdBuilder::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// [`BankId`] 的建構器。
///
/// ```no_run
/// # async fn run() -> rbankid::Result<()> {
/// use rbankid::{BankIdBuilder, ProtocolVersion};
///
/// let bankid = BankIdBuilder::new("certs/client.p12", "certs/ca.crt", "qwerty123")
///     .protocol(ProtocolVersion::Json)
///     .production(false)
///     .build()?;
/// bankid.init().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BankIdBuilder {
    credentials: CredentialStore,
    config: BankIdConfig,
}

impl BankIdBuilder {
    /// 預設的單次請求逾時。
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// 預設的訂單存活時間，與伺服器端訂單的有效期相當。
    pub const DEFAULT_ORDER_LIFETIME: Duration = Duration::from_secs(180);
    /// 預設輪詢間隔。
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

    /// 以客戶端憑證檔、根憑證檔與密碼建立建構器。
    pub fn new(
        pfx_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self::with_credentials(CredentialStore::from_files(
            pfx_path.into(),
            ca_path.into(),
            SecretString::from(passphrase.into()),
        ))
    }

    /// 使用自訂的憑證存放區。
    pub fn with_credentials(credentials: CredentialStore) -> Self {
        BankIdBuilder {
            credentials,
            config: BankIdConfig::default(),
        }
    }

    /// 從環境變數讀取設定。
    ///
    /// 必要變數為 `BANKID_PFX_PATH`、`BANKID_CA_PATH` 與 `BANKID_PASSPHRASE`；
    /// 可選變數 `BANKID_PRODUCTION`（`true` 或 `1`）與 `BANKID_PROTOCOL`（`json` 或 `rpc`）。
    ///
    /// # Errors
    ///
    /// 缺少必要變數或值不合法時回傳 [`BankIdError::Configuration`]。
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| BankIdError::Configuration(format!("{key} is not set")))
        };

        let mut builder = Self::new(
            required("BANKID_PFX_PATH")?,
            required("BANKID_CA_PATH")?,
            required("BANKID_PASSPHRASE")?,
        );
        if let Some(production) = lookup("BANKID_PRODUCTION") {
            builder = builder.production(matches!(
                production.to_ascii_lowercase().as_str(),
                "true" | "1" | "yes"
            ));
        }
        if let Some(protocol) = lookup("BANKID_PROTOCOL") {
            builder = builder.protocol(protocol.parse()?);
        }
        Ok(builder)
    }

    /// 使用正式環境端點，預設為測試環境。
    pub fn production(mut self, production: bool) -> Self {
        self.config.production = production;
        self
    }

    /// 選擇協定版本。
    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// 覆寫端點，主要用於測試伺服器。
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    /// 單次 HTTP 請求的逾時，必須大於零。
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// 設定訂單存活時間；`None` 表示不限制。
    pub fn order_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.config.order_lifetime = lifetime;
        self
    }

    /// 預設輪詢間隔，實際使用時會被夾在 1 到 10 秒之間。
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// 目前累積的設定。
    pub fn config(&self) -> &BankIdConfig {
        &self.config
    }

    /// 建立 [`BankId`] 實例。憑證在第一次呼叫遠端操作或 [`BankId::init`] 時才載入。
    ///
    /// # Errors
    ///
    /// 設定不合法時回傳 [`BankIdError::Configuration`]。
    pub fn build(self) -> Result<BankId> {
        if self.config.request_timeout.is_zero() {
            return Err(BankIdError::Configuration(
                "Request timeout must be greater than zero".to_string(),
            ));
        }
        let endpoint = self.config.endpoint();
        if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
            return Err(BankIdError::Configuration(format!(
                "Endpoint must be an HTTP(S) URL: {endpoint}"
            )));
        }
        if !self.config.is_mutual_tls() {
            warn!(endpoint, "Endpoint is not HTTPS, mutual TLS is not in effect");
        }
        Ok(BankId::from_config(Arc::new(self.credentials), self.config))
    }
}
