//! 客戶端憑證存放區。
//!
//! 憑證包（PKCS#12）、其密碼以及信任錨憑證只會在第一次使用時讀取一次，
//! 之後所有呼叫（包含同時進行的呼叫）都共用同一份快取。

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use openssl::{
    asn1::Asn1Time,
    error::ErrorStack,
    pkcs12::Pkcs12,
    x509::{X509Ref, X509},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{BankIdError, Result};

/// 客戶端憑證剩餘有效天數低於此值時記錄警告。
const EXPIRY_WARNING_DAYS: i64 = 30;

/// 定義憑證資料來源所需實現的 API。
#[async_trait]
pub trait CredentialSource: Send + Sync + fmt::Debug {
    /// 讀取來源中的完整內容。
    async fn read(&self) -> io::Result<Vec<u8>>;

    /// 用於錯誤訊息與日誌的來源名稱。
    fn name(&self) -> String;
}

/// 從檔案系統讀取的憑證來源。
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// 從指定路徑讀取。
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CredentialSource for FileSource {
    async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// 保存在記憶體中的憑證來源，適用於憑證由其他系統提供的情境。
#[derive(Clone)]
pub struct MemorySource {
    label: String,
    data: Vec<u8>,
}

impl MemorySource {
    /// `label` 只用於錯誤訊息。
    pub fn new(label: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("label", &self.label)
            .field("len", &self.data.len())
            .finish()
    }
}

#[async_trait]
impl CredentialSource for MemorySource {
    async fn read(&self) -> io::Result<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn name(&self) -> String {
        self.label.clone()
    }
}

/// 已驗證的憑證資料，建立後不可變。
pub struct CredentialBundle {
    pkcs12: Vec<u8>,
    trust_anchor: X509,
    passphrase: SecretString,
}

impl CredentialBundle {
    /// PKCS#12 格式（DER）的客戶端憑證與私鑰。
    pub fn pkcs12(&self) -> &[u8] {
        &self.pkcs12
    }

    /// 唯一信任的伺服器根憑證。
    pub fn trust_anchor(&self) -> &X509Ref {
        &self.trust_anchor
    }

    /// PKCS#12 的密碼。
    pub fn passphrase(&self) -> &SecretString {
        &self.passphrase
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("pkcs12_len", &self.pkcs12.len())
            .finish_non_exhaustive()
    }
}

/// 憑證存放區，負責一次性地載入並快取 [`CredentialBundle`]。
///
/// 內部以單一的 [`OnceCell`] 作為狀態槽：尚未載入、載入中（其他呼叫者等待同一個載入）
/// 與已就緒。載入失敗時狀態維持未載入，下一次呼叫會重新嘗試。
pub struct CredentialStore {
    pkcs12: Box<dyn CredentialSource>,
    trust_anchor: Box<dyn CredentialSource>,
    passphrase: SecretString,
    slot: OnceCell<Arc<CredentialBundle>>,
}

impl CredentialStore {
    /// 以任意來源建立存放區，此時不會讀取任何資料。
    pub fn new(
        pkcs12: impl CredentialSource + 'static,
        trust_anchor: impl CredentialSource + 'static,
        passphrase: SecretString,
    ) -> Self {
        Self {
            pkcs12: Box::new(pkcs12),
            trust_anchor: Box::new(trust_anchor),
            passphrase,
            slot: OnceCell::new(),
        }
    }

    /// 以檔案路徑建立存放區。
    pub fn from_files(
        pkcs12_path: impl AsRef<Path>,
        trust_anchor_path: impl AsRef<Path>,
        passphrase: SecretString,
    ) -> Self {
        Self::new(
            FileSource::new(pkcs12_path),
            FileSource::new(trust_anchor_path),
            passphrase,
        )
    }

    /// 取得憑證資料，第一次呼叫時才實際讀取並驗證。
    ///
    /// # Errors
    ///
    /// 任一來源無法讀取或內容格式錯誤時回傳 [`BankIdError::Initialization`]，
    /// 並保留底層錯誤。
    pub async fn load(&self) -> Result<Arc<CredentialBundle>> {
        self.slot
            .get_or_try_init(|| self.read_bundle())
            .await
            .map(Arc::clone)
    }

    /// 憑證是否已經載入完成。
    pub fn is_loaded(&self) -> bool {
        self.slot.initialized()
    }

    async fn read_bundle(&self) -> Result<Arc<CredentialBundle>> {
        debug!(
            pkcs12 = %self.pkcs12.name(),
            trust_anchor = %self.trust_anchor.name(),
            "Loading client credentials"
        );
        let (pkcs12, anchor) = tokio::try_join!(
            Self::read_source(&*self.pkcs12),
            Self::read_source(&*self.trust_anchor)
        )?;

        let name = self.pkcs12.name();
        let parsed = Pkcs12::from_der(&pkcs12)
            .and_then(|p| p.parse2(self.passphrase.expose_secret()))
            .map_err(|e| BankIdError::initialization(&name, e))?;
        let cert = parsed.cert.ok_or_else(|| {
            BankIdError::initialization(&name, "bundle contains no client certificate")
        })?;
        if parsed.pkey.is_none() {
            return Err(BankIdError::initialization(
                &name,
                "bundle contains no private key",
            ));
        }
        check_validity(&cert).map_err(|e| BankIdError::initialization(&name, e))?;

        let trust_anchor = X509::from_pem(&anchor)
            .or_else(|_| X509::from_der(&anchor))
            .map_err(|e| BankIdError::initialization(self.trust_anchor.name(), e))?;

        info!(pkcs12 = %name, "Client credentials loaded");
        Ok(Arc::new(CredentialBundle {
            pkcs12,
            trust_anchor,
            passphrase: SecretString::from(self.passphrase.expose_secret().to_owned()),
        }))
    }

    async fn read_source(source: &dyn CredentialSource) -> Result<Vec<u8>> {
        source
            .read()
            .await
            .map_err(|e| BankIdError::initialization(source.name(), e))
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("pkcs12", &self.pkcs12)
            .field("trust_anchor", &self.trust_anchor)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

/// 檢查客戶端憑證剩餘的有效時間，即將到期或已過期時記錄警告。
fn check_validity(cert: &X509Ref) -> std::result::Result<(), ErrorStack> {
    let now = Asn1Time::from_unix(Utc::now().timestamp())?;
    let diff = now.diff(cert.not_after())?;
    let remaining_seconds = diff.days as i64 * 86400 + diff.secs as i64;

    if remaining_seconds <= 0 {
        warn!(not_after = %cert.not_after(), "Client certificate has expired");
    } else if remaining_seconds < EXPIRY_WARNING_DAYS * 86400 {
        warn!(
            not_after = %cert.not_after(),
            remaining_days = remaining_seconds / 86400,
            "Client certificate expires soon"
        );
    }
    Ok(())
}
