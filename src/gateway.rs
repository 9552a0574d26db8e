use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::{env_or, Kind};

/// The whole outbound surface of the messaging gateway. Everything the core
/// ever asks of it fits in these three calls; endpoint and payload-shape
/// variability stays inside the adapter.
#[async_trait]
pub trait OutboundGateway: Send + Sync {
    async fn send_text(&self, phone: &str, text: &str) -> Result<(), String>;

    async fn send_media(
        &self,
        phone: &str,
        url: &str,
        caption: &str,
        kind: Kind,
    ) -> Result<(), String>;

    async fn send_menu(
        &self,
        phone: &str,
        prompt: &str,
        choices: &[String],
        footer: &str,
    ) -> Result<(), String>;
}

/// Known Uazapi payload dialects. One concrete shape per installation,
/// selected by configuration — the adapter never probes shapes at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadVariant {
    /// Current Uazapi: `number` recipient field, `token` auth header.
    Modern,
    /// Older installations: `chatId` recipient field, `apikey` auth header.
    Legacy,
}

impl PayloadVariant {
    pub fn parse(value: &str) -> PayloadVariant {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" => PayloadVariant::Legacy,
            _ => PayloadVariant::Modern,
        }
    }

    fn recipient_field(self) -> &'static str {
        match self {
            PayloadVariant::Modern => "number",
            PayloadVariant::Legacy => "chatId",
        }
    }

    fn auth_header(self) -> &'static str {
        match self {
            PayloadVariant::Modern => "token",
            PayloadVariant::Legacy => "apikey",
        }
    }
}

fn media_mime(kind: Kind) -> &'static str {
    match kind {
        Kind::Image => "image/jpeg",
        Kind::Video => "video/mp4",
        Kind::Audio => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

fn media_type_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Image => "image",
        Kind::Video => "video",
        Kind::Audio => "audio",
        _ => "document",
    }
}

fn text_payload(variant: PayloadVariant, phone: &str, text: &str) -> Value {
    let mut payload = json!({ "text": text });
    payload[variant.recipient_field()] = json!(phone);
    payload
}

fn media_payload(variant: PayloadVariant, phone: &str, url: &str, caption: &str, kind: Kind) -> Value {
    match variant {
        PayloadVariant::Modern => json!({
            "number": phone,
            "type": media_type_name(kind),
            "file": url,
            "text": caption,
        }),
        PayloadVariant::Legacy => json!({
            "chatId": phone,
            "fileUrl": url,
            "caption": caption,
            "mimeType": media_mime(kind),
        }),
    }
}

fn menu_payload(
    variant: PayloadVariant,
    phone: &str,
    prompt: &str,
    choices: &[String],
    footer: &str,
) -> Value {
    let mut payload = json!({
        "type": "button",
        "text": prompt,
        "choices": choices,
        "footerText": footer,
    });
    payload[variant.recipient_field()] = json!(phone);
    payload
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub token: String,
    pub variant: PayloadVariant,
    pub text_path: String,
    pub media_path: String,
    pub menu_path: String,
}

impl GatewayConfig {
    pub fn from_env() -> GatewayConfig {
        GatewayConfig {
            base_url: env_or("UAZAPI_BASE_URL", "")
                .trim_end_matches('/')
                .to_string(),
            token: env_or("UAZAPI_TOKEN", ""),
            variant: PayloadVariant::parse(&env_or("UAZAPI_PAYLOAD_VARIANT", "modern")),
            text_path: env_or("UAZAPI_SEND_TEXT_PATH", "/send/text"),
            media_path: env_or("UAZAPI_SEND_MEDIA_PATH", "/send/media"),
            menu_path: env_or("UAZAPI_SEND_MENU_PATH", "/send/menu"),
        }
    }
}

pub struct UazapiGateway {
    http: reqwest::Client,
    cfg: GatewayConfig,
}

impl UazapiGateway {
    pub fn new(http: reqwest::Client, cfg: GatewayConfig) -> UazapiGateway {
        UazapiGateway { http, cfg }
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<(), String> {
        if self.cfg.base_url.is_empty() || self.cfg.token.is_empty() {
            return Err("uazapi base url or token not configured".to_string());
        }
        let response = self
            .http
            .post(format!("{}{}", self.cfg.base_url, path))
            .header(self.cfg.variant.auth_header(), &self.cfg.token)
            .json(payload)
            .send()
            .await
            .map_err(|err| format!("uazapi request failed: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("uazapi returned {status}: {body}"));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundGateway for UazapiGateway {
    async fn send_text(&self, phone: &str, text: &str) -> Result<(), String> {
        let payload = text_payload(self.cfg.variant, phone, text);
        self.post(&self.cfg.text_path, &payload).await
    }

    async fn send_media(
        &self,
        phone: &str,
        url: &str,
        caption: &str,
        kind: Kind,
    ) -> Result<(), String> {
        let payload = media_payload(self.cfg.variant, phone, url, caption, kind);
        self.post(&self.cfg.media_path, &payload).await
    }

    async fn send_menu(
        &self,
        phone: &str,
        prompt: &str,
        choices: &[String],
        footer: &str,
    ) -> Result<(), String> {
        let payload = menu_payload(self.cfg.variant, phone, prompt, choices, footer);
        self.post(&self.cfg.menu_path, &payload).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum GatewayCall {
        Text { phone: String, text: String },
        Media { phone: String, url: String, kind: Kind },
        Menu { phone: String, prompt: String },
    }

    /// Recording gateway double; optionally fails every call.
    #[derive(Default)]
    pub struct RecordingGateway {
        pub calls: Mutex<Vec<GatewayCall>>,
        pub fail: bool,
    }

    impl RecordingGateway {
        pub fn new() -> RecordingGateway {
            RecordingGateway::default()
        }

        pub fn failing() -> RecordingGateway {
            RecordingGateway {
                fail: true,
                ..RecordingGateway::default()
            }
        }

        pub fn calls(&self) -> Vec<GatewayCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn texts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    GatewayCall::Text { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: GatewayCall) -> Result<(), String> {
            if self.fail {
                return Err("simulated delivery failure".to_string());
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl OutboundGateway for RecordingGateway {
        async fn send_text(&self, phone: &str, text: &str) -> Result<(), String> {
            self.record(GatewayCall::Text {
                phone: phone.to_string(),
                text: text.to_string(),
            })
        }

        async fn send_media(
            &self,
            phone: &str,
            url: &str,
            _caption: &str,
            kind: Kind,
        ) -> Result<(), String> {
            self.record(GatewayCall::Media {
                phone: phone.to_string(),
                url: url.to_string(),
                kind,
            })
        }

        async fn send_menu(
            &self,
            phone: &str,
            prompt: &str,
            _choices: &[String],
            _footer: &str,
        ) -> Result<(), String> {
            self.record(GatewayCall::Menu {
                phone: phone.to_string(),
                prompt: prompt.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_text_payload_uses_number_field() {
        let payload = text_payload(PayloadVariant::Modern, "5511999998888", "oi");
        assert_eq!(payload["number"], "5511999998888");
        assert_eq!(payload["text"], "oi");
        assert!(payload.get("chatId").is_none());
    }

    #[test]
    fn legacy_media_payload_keeps_chat_id_and_mime() {
        let payload = media_payload(
            PayloadVariant::Legacy,
            "5511999998888",
            "https://cdn.example/video.mp4",
            "olha só",
            Kind::Video,
        );
        assert_eq!(payload["chatId"], "5511999998888");
        assert_eq!(payload["fileUrl"], "https://cdn.example/video.mp4");
        assert_eq!(payload["mimeType"], "video/mp4");
    }

    #[test]
    fn menu_payload_carries_choices_and_footer() {
        let choices = vec!["Sim".to_string(), "Não".to_string()];
        let payload = menu_payload(
            PayloadVariant::Modern,
            "5511999998888",
            "Quer ver?",
            &choices,
            "Luna",
        );
        assert_eq!(payload["choices"][0], "Sim");
        assert_eq!(payload["footerText"], "Luna");
        assert_eq!(payload["type"], "button");
    }

    #[test]
    fn variant_parse_defaults_to_modern() {
        assert_eq!(PayloadVariant::parse("legacy"), PayloadVariant::Legacy);
        assert_eq!(PayloadVariant::parse("anything"), PayloadVariant::Modern);
        assert_eq!(PayloadVariant::parse("  LEGACY "), PayloadVariant::Legacy);
    }
}
