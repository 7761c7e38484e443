//! Run notifications: Telegram bot delivery or plain logging

use crate::config::TelegramConfig;
use crate::error::error_chain;
use crate::proxy::transport::TransportFactory;
use crate::Result;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const SEND_ATTEMPTS: usize = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Characters Telegram MarkdownV2 treats as markup
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escape text so it renders literally under MarkdownV2
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Sink for run progress messages and report files
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn send_file(&self, path: &Path) -> Result<()>;
}

/// Echoes notifications to the debug log when no remote channel is set up
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_text(&self, text: &str) -> Result<()> {
        for line in text.lines() {
            debug!(target: "notify", "{}", line);
        }
        Ok(())
    }

    async fn send_file(&self, path: &Path) -> Result<()> {
        debug!(target: "notify", path = %path.display(), "report ready");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Delivers notifications through the Telegram Bot API.
///
/// A client is verified with `getMe` before first use, trying each preset
/// proxy and then a direct connection. The verified client is reused until
/// a send fails.
pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    preset_proxies: Vec<String>,
    transports: TransportFactory,
    api_base: String,
    retry_pause: Duration,
    client: Mutex<Option<Client>>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig, preset_proxies: Vec<String>) -> Self {
        Self {
            bot_token: config.bot_token.trim().to_string(),
            chat_id: config.chat_id.trim().to_string(),
            preset_proxies,
            transports: TransportFactory::default(),
            api_base: TELEGRAM_API_BASE.to_string(),
            retry_pause: RETRY_PAUSE,
            client: Mutex::new(None),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Strip the bot token from anything headed for the log
    fn redact(&self, text: &str) -> String {
        if self.bot_token.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.bot_token, "[REDACTED]")
        }
    }

    fn describe(&self, err: reqwest::Error) -> String {
        self.redact(&error_chain(&err.without_url()))
    }

    async fn verify(&self, proxy: Option<&str>) -> Result<Client> {
        let client = match proxy {
            Some(url) => self.transports.client(url)?,
            None => Client::builder()
                .no_proxy()
                .connect_timeout(self.transports.connect_timeout())
                .build()?,
        };

        let response = client
            .get(self.method_url("getMe"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| anyhow!(self.describe(e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("getMe returned HTTP {}: {}", status.as_u16(), self.redact(&body));
        }
        Ok(client)
    }

    /// Cached client, or a freshly verified one
    async fn client(&self) -> Option<Client> {
        let mut cached = self.client.lock().await;
        if let Some(client) = cached.as_ref() {
            return Some(client.clone());
        }

        for proxy in &self.preset_proxies {
            debug!(proxy = %proxy, "trying Telegram through preset proxy");
            match self.verify(Some(proxy)).await {
                Ok(client) => {
                    info!(proxy = %proxy, "Telegram session established through proxy");
                    *cached = Some(client.clone());
                    return Some(client);
                }
                Err(e) => warn!(proxy = %proxy, error = %e, "preset proxy cannot reach Telegram"),
            }
        }

        debug!("trying Telegram directly");
        match self.verify(None).await {
            Ok(client) => {
                info!("Telegram session established directly");
                *cached = Some(client.clone());
                Some(client)
            }
            Err(e) => {
                warn!(error = %e, "cannot reach Telegram API");
                None
            }
        }
    }

    async fn invalidate(&self) {
        self.client.lock().await.take();
    }

    async fn check_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("HTTP {}: {}", status.as_u16(), self.describe(e)))?;
        if !body.ok {
            bail!(
                "Telegram API error: {}",
                self.redact(body.description.as_deref().unwrap_or("unknown"))
            );
        }
        Ok(())
    }

    async fn send_message_once(&self, text: &str) -> Result<()> {
        let client = self
            .client()
            .await
            .ok_or_else(|| anyhow!("no working connection to Telegram"))?;

        let payload = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "MarkdownV2",
        };
        let response = client
            .post(self.method_url("sendMessage"))
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!(self.describe(e)))?;
        self.check_response(response).await
    }

    async fn send_document_once(&self, file_name: &str, content: Vec<u8>) -> Result<()> {
        let client = self
            .client()
            .await
            .ok_or_else(|| anyhow!("no working connection to Telegram"))?;

        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("document", Part::bytes(content).file_name(file_name.to_string()));
        let response = client
            .post(self.method_url("sendDocument"))
            .timeout(REQUEST_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| anyhow!(self.describe(e)))?;
        self.check_response(response).await
    }

    async fn pause_before_retry(&self, attempt: usize) {
        if attempt < SEND_ATTEMPTS && !self.retry_pause.is_zero() {
            tokio::time::sleep(self.retry_pause).await;
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    /// `text` is escaped here; callers pass plain text
    async fn send_text(&self, text: &str) -> Result<()> {
        let escaped = escape_markdown_v2(text);
        let mut last_error = None;

        for attempt in 1..=SEND_ATTEMPTS {
            match self.send_message_once(&escaped).await {
                Ok(()) => {
                    debug!(attempt, "Telegram message sent");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Telegram message failed");
                    self.invalidate().await;
                    last_error = Some(e);
                    self.pause_before_retry(attempt).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Telegram message not sent")))
    }

    async fn send_file(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        if content.is_empty() {
            bail!("{} is empty", path.display());
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.txt".to_string());

        let mut last_error = None;
        for attempt in 1..=SEND_ATTEMPTS {
            match self.send_document_once(&file_name, content.clone()).await {
                Ok(()) => {
                    info!(file = %file_name, "report pushed to Telegram");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, file = %file_name, error = %e, "Telegram upload failed");
                    self.invalidate().await;
                    last_error = Some(e);
                    self.pause_before_retry(attempt).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Telegram upload failed")))
    }
}

/// Telegram when configured, logging otherwise
pub fn from_config(config: &TelegramConfig, preset_proxies: &[String]) -> Box<dyn Notifier> {
    if config.is_configured() {
        Box::new(TelegramNotifier::new(config, preset_proxies.to_vec()))
    } else {
        info!("Telegram not configured, notifications stay local");
        Box::new(LogNotifier)
    }
}
