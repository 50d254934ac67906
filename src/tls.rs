//! 建立雙向 TLS 的 HTTP 用戶端。

use std::{sync::Arc, time::Duration};

use reqwest::{Certificate, Client, Identity};
use secrecy::ExposeSecret;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{
    credential::{CredentialBundle, CredentialStore},
    error::{BankIdError, Result, TransportError},
};

/// 依需求建立並快取 [`reqwest::Client`]。
///
/// 用戶端以憑證包中的客戶端憑證與密碼進行身分驗證，且只信任設定的根憑證，
/// 不會退回系統預設的信任清單。
#[derive(Debug)]
pub struct Connector {
    credentials: Option<Arc<CredentialStore>>,
    timeout: Option<Duration>,
    client: OnceCell<Client>,
}

impl Connector {
    /// 建立使用憑證存放區的連線器，第一次請求時才載入憑證。
    pub fn mutual_tls(credentials: Arc<CredentialStore>, timeout: Option<Duration>) -> Self {
        Self {
            credentials: Some(credentials),
            timeout,
            client: OnceCell::new(),
        }
    }

    /// 使用既有的用戶端，主要用於測試或由呼叫端自行設定 TLS 的情境。
    pub fn with_client(client: Client) -> Self {
        Self {
            credentials: None,
            timeout: None,
            client: OnceCell::new_with(Some(client)),
        }
    }

    /// 取得 HTTP 用戶端。
    ///
    /// # Errors
    ///
    /// 憑證無法載入時回傳 [`BankIdError::Initialization`]。
    pub async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let credentials = self.credentials.as_ref().ok_or_else(|| {
                    BankIdError::Configuration("connector has no credentials".into())
                })?;
                let bundle = credentials.load().await?;
                build_client(&bundle, self.timeout)
            })
            .await
    }
}

/// 依憑證資料建立雙向 TLS 用戶端。
pub fn build_client(bundle: &CredentialBundle, timeout: Option<Duration>) -> Result<Client> {
    let identity =
        Identity::from_pkcs12_der(bundle.pkcs12(), bundle.passphrase().expose_secret())
            .map_err(|e| BankIdError::initialization("client identity", e))?;
    let anchor_pem = bundle
        .trust_anchor()
        .to_pem()
        .map_err(|e| BankIdError::initialization("trust anchor", e))?;
    let anchor = Certificate::from_pem(&anchor_pem)
        .map_err(|e| BankIdError::initialization("trust anchor", e))?;

    let mut builder = Client::builder()
        .use_native_tls()
        .identity(identity)
        .tls_built_in_root_certs(false)
        .add_root_certificate(anchor);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    debug!(?timeout, "Building mutual TLS client");
    builder
        .build()
        .map_err(|e| BankIdError::Transport(TransportError::Http(e)))
}
