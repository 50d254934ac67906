//! # BankID Relying Party Client
//!
//! 本庫提供與 BankID 依賴方（RP）API 互動的功能，支援 JSON（v5）與舊版 SOAP RPC（v4）兩種協定：
//!
//! - **credential / tls**: 客戶端憑證（PKCS#12）與信任錨只載入一次，並用來建立雙向 TLS 連線。
//! - **order**: 發起身分驗證與簽署訂單，送出前先驗證載荷大小。
//! - **collect**: 輪詢訂單狀態直到完成或失敗，狀態改變時通知觀察者。
//! - **fault**: 將兩種協定的錯誤格式正規化為同一種錯誤代碼與描述。
//!
//! ## 使用方式
//!
//! 使用 [`BankIdBuilder`] 建立 [`BankId`]，發起訂單後以 `collect` 等待結果：
//!
//! ```no_run
//! use rbankid::{BankIdBuilder, OrderOptions, OrderStatus};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bankid = BankIdBuilder::new("certs/client.p12", "certs/ca.crt", "qwerty123").build()?;
//!
//! // 1. 發起身分驗證
//! let order = bankid.authenticate("192.168.0.1", OrderOptions::new()).await?;
//!
//! // 2. 輪詢直到完成，狀態改變時印出
//! let observer = |status: OrderStatus, hint: Option<&str>| println!("{status} {hint:?}");
//! let outcome = bankid.collect(&order.order_ref, None, Some(&observer)).await?;
//!
//! if let Some(data) = outcome.completion_data {
//!     println!("{} signed in", data.user.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! 本庫只使用 `tracing` 輸出日誌，不會安裝任何 subscriber。

pub mod client;
pub mod collect;
pub mod config;
pub mod credential;
pub mod error;
pub mod fault;
pub mod order;
pub mod payload;
pub mod protocol;
pub mod schedule;
pub mod status;
pub mod tls;
pub mod transport;
pub mod xml;

pub use client::BankId;
pub use collect::StatusObserver;
pub use config::{BankIdBuilder, BankIdConfig, ProtocolVersion};
pub use credential::CredentialStore;
pub use error::{BankIdError, Result};
pub use order::OrderHandle;
pub use payload::OrderOptions;
pub use status::{CompletionData, OrderStatus, PollOutcome};
