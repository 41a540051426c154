//! Outbound alert webhooks callable from scripts. These run on blocking
//! script-execution threads, so the blocking HTTP client is fine here.

use std::time::Duration;

use serde::Serialize;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Simple Discord webhook message, no embed support.
#[derive(Debug, Serialize)]
struct DiscordWebhookData<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct SlackWebhookData<'a> {
    text: &'a str,
}

pub struct WebhookSender {
    client: reqwest::blocking::Client,
}

impl WebhookSender {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::blocking::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()?,
        })
    }

    /// Returns the HTTP status code, or -1 on a transport error.
    pub fn discord(&self, url: &str, content: &str, username: Option<&str>) -> i64 {
        self.post(url, &DiscordWebhookData { username, content })
    }

    /// Returns the HTTP status code, or -1 on a transport error.
    pub fn slack(&self, url: &str, text: &str) -> i64 {
        self.post(url, &SlackWebhookData { text })
    }

    fn post<T: Serialize>(&self, url: &str, body: &T) -> i64 {
        match self.client.post(url).json(body).send() {
            Ok(response) => response.status().as_u16() as i64,
            Err(e) => {
                log::error!("Webhook POST failed: {}", e);
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_body_omits_absent_username() {
        let body = DiscordWebhookData {
            username: None,
            content: "server down",
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"content":"server down"}"#
        );

        let named = DiscordWebhookData {
            username: Some("rustcon"),
            content: "server down",
        };
        assert_eq!(
            serde_json::to_string(&named).unwrap(),
            r#"{"username":"rustcon","content":"server down"}"#
        );
    }

    #[test]
    fn slack_body_uses_text_field() {
        let body = SlackWebhookData { text: "wipe done" };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"text":"wipe done"}"#);
    }

    #[test]
    fn transport_error_returns_minus_one() {
        let sender = WebhookSender::new().unwrap();
        // Port 1 on loopback refuses the connection immediately.
        let status = sender.slack("http://127.0.0.1:1/hook", "unreachable");
        assert_eq!(status, -1);
    }
}
