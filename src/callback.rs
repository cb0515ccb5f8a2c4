//! Out-of-band HTTP notifications for operational conditions.
//!
//! Callbacks are configured at construction: method, URL and body templates,
//! headers, and a per-callback rate limit. Firing never fails the caller;
//! delivery errors and rate-limit drops are logged and swallowed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{CallbackConfig, CallbackSpec};

/// The operational callbacks the core fires. The wallet owner only sees
/// this trait; tests substitute their own recorder.
#[async_trait]
pub trait Callbacks: Send + Sync + 'static {
    async fn wallet_out_of_funds(&self, body: WalletOutOfFundsBody);
}

/// Template parameters of the `WalletOutOfFunds` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletOutOfFundsBody {
    /// Address of the drained wallet.
    pub address: String,
}

struct Callback {
    enabled: bool,
    name: &'static str,
    method: Method,
    url_template: String,
    body_template: Option<String>,
    headers: HashMap<String, String>,
    period_limit: Duration,
}

impl Callback {
    fn from_spec(name: &'static str, spec: &CallbackSpec) -> Self {
        Callback {
            enabled: spec.enabled,
            name,
            method: Method::from_str(&spec.method).unwrap_or(Method::POST),
            url_template: spec.url.clone(),
            body_template: spec.body.clone(),
            headers: spec.headers.clone(),
            period_limit: spec.period_limit,
        }
    }
}

/// Dispatches configured callbacks over HTTP, at most once per period each.
pub struct CallbackClient {
    http: reqwest::Client,
    wallet_out_of_funds: Callback,
    last_fired: Mutex<HashMap<&'static str, Instant>>,
}

impl CallbackClient {
    pub fn new(cfg: &CallbackConfig) -> Arc<Self> {
        Arc::new(CallbackClient {
            http: reqwest::Client::new(),
            wallet_out_of_funds: Callback::from_spec("WalletOutOfFunds", &cfg.wallet_out_of_funds),
            last_fired: Mutex::new(HashMap::new()),
        })
    }

    async fn fire(&self, callback: &Callback, params: &HashMap<&str, String>) {
        if !callback.enabled {
            return;
        }

        // The window is claimed before the request goes out, so concurrent
        // fires cannot both pass the check.
        {
            let mut last_fired = self.last_fired.lock().await;
            let now = Instant::now();
            if let Some(last) = last_fired.get(callback.name) {
                if now.duration_since(*last) < callback.period_limit {
                    tracing::debug!(callback = callback.name, "dropping rate-limited callback");
                    return;
                }
            }
            last_fired.insert(callback.name, now);
        }

        let url = render_template(&callback.url_template, params);
        let mut request = self.http.request(callback.method.clone(), url.clone());
        for (name, value) in &callback.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(template) = &callback.body_template {
            request = request.body(render_template(template, params));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(callback = callback.name, url, "callback delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    callback = callback.name,
                    url,
                    status = %response.status(),
                    "callback endpoint rejected the notification"
                );
            }
            Err(err) => {
                tracing::warn!(
                    callback = callback.name,
                    url,
                    error = %err,
                    "failed to deliver callback"
                );
            }
        }
    }
}

#[async_trait]
impl Callbacks for CallbackClient {
    async fn wallet_out_of_funds(&self, body: WalletOutOfFundsBody) {
        let params = HashMap::from([("address", body.address)]);
        self.fire(&self.wallet_out_of_funds, &params).await;
    }
}

/// Substitutes `{{name}}` placeholders. Unknown placeholders are left
/// verbatim so a typo shows up in the delivered payload instead of
/// vanishing.
fn render_template(template: &str, params: &HashMap<&str, String>) -> String {
    let mut rendered = template.to_string();
    for (name, value) in params {
        rendered = rendered.replace(&format!("{{{{{name}}}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(enabled: bool, period: Duration) -> CallbackSpec {
        CallbackSpec {
            enabled,
            method: "POST".to_string(),
            url: "http://127.0.0.1:1/out-of-funds".to_string(),
            body: Some(r#"{"address":"{{address}}"}"#.to_string()),
            headers: HashMap::new(),
            period_limit: period,
        }
    }

    #[test]
    fn templates_render_params() {
        let params = HashMap::from([("address", "0xabc".to_string())]);
        assert_eq!(
            render_template(r#"{"address":"{{address}}"}"#, &params),
            r#"{"address":"0xabc"}"#
        );
        assert_eq!(
            render_template("https://host/{{address}}/notify", &params),
            "https://host/0xabc/notify"
        );
        assert_eq!(render_template("{{unknown}}", &params), "{{unknown}}");
    }

    #[tokio::test]
    async fn rate_limit_claims_the_window_once() {
        let cfg = CallbackConfig {
            wallet_out_of_funds: spec(true, Duration::from_secs(3600)),
        };
        let client = CallbackClient::new(&cfg);

        // Both fires attempt delivery to a closed port; only the first may
        // claim the rate-limit window.
        let body = WalletOutOfFundsBody {
            address: "0xabc".to_string(),
        };
        client.wallet_out_of_funds(body.clone()).await;
        client.wallet_out_of_funds(body).await;

        let last_fired = client.last_fired.lock().await;
        assert_eq!(last_fired.len(), 1);
        assert!(last_fired.contains_key("WalletOutOfFunds"));
    }

    #[tokio::test]
    async fn disabled_callback_is_a_no_op() {
        let cfg = CallbackConfig {
            wallet_out_of_funds: spec(false, Duration::from_secs(1)),
        };
        let client = CallbackClient::new(&cfg);
        client
            .wallet_out_of_funds(WalletOutOfFundsBody {
                address: "0xabc".to_string(),
            })
            .await;

        assert!(client.last_fired.lock().await.is_empty());
    }
}
