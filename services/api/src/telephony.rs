//! Outbound dialing through the telephony REST API and the call-setup
//! document that points the provider at `/call`.

use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::info;

pub const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("telephony request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telephony provider rejected the call ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// An outbound call to place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    pub to: String,
    pub from: String,
    /// Where the provider fetches the call-setup document once answered.
    pub setup_url: String,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Places the call and returns the provider's call id.
    async fn dial(&self, call: &OutboundCall) -> Result<String, DialError>;
}

pub struct TwilioDialer {
    http: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: SecretString,
}

#[derive(Deserialize)]
struct CallResource {
    sid: String,
}

#[derive(Deserialize)]
struct TwilioErrorBody {
    message: String,
}

impl TwilioDialer {
    pub fn new(http: reqwest::Client, account_sid: String, auth_token: SecretString) -> Self {
        Self::with_base_url(http, TWILIO_API_BASE, account_sid, auth_token)
    }

    pub fn with_base_url(
        http: reqwest::Client,
        base_url: &str,
        account_sid: String,
        auth_token: SecretString,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_sid,
            auth_token,
        }
    }
}

#[async_trait]
impl Dialer for TwilioDialer {
    async fn dial(&self, call: &OutboundCall) -> Result<String, DialError> {
        let url = format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid);
        let response = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&[
                ("To", call.to.as_str()),
                ("From", call.from.as_str()),
                ("Url", call.setup_url.as_str()),
                ("Method", "POST"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<TwilioErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or(body);
            return Err(DialError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let resource: CallResource = response.json().await?;
        info!(call_sid = %resource.sid, to = %call.to, "Outbound call placed");
        Ok(resource.sid)
    }
}

/// Builds the `/call` stream URL, carrying the call id when there is one.
pub fn stream_url(ws_base: &str, call_id: Option<&str>) -> anyhow::Result<String> {
    let mut url = Url::parse(&format!("{ws_base}/call"))?;
    if let Some(call_id) = call_id {
        url.query_pairs_mut().append_pair("callId", call_id);
    }
    Ok(url.to_string())
}

/// Renders the document that connects an answered call to the media stream.
pub fn render_twiml(ws_base: &str, call_id: Option<&str>) -> anyhow::Result<String> {
    let url = stream_url(ws_base, call_id)?;
    let parameter = call_id
        .map(|id| format!(r#"<Parameter name="callId" value="{}"/>"#, escape_xml(id)))
        .unwrap_or_default();
    Ok(format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{}">{parameter}</Stream></Connect></Response>"#,
        escape_xml(&url)
    ))
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
