#![allow(dead_code)]

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use kurve_identity::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Notify};
use url::Url;

pub const CLIENT_ID: &str = "client-1";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const TENANT_ID: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Signs `claims` with a throwaway HS256 key; nothing here verifies signatures.
pub fn mint(claims: &Value) -> String {
    encode(&Header::default(), claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
}

pub fn id_token(nonce: &str, lifetime: u64) -> String {
    mint(&json!({
        "aud": CLIENT_ID,
        "iss": format!("https://sts.windows.net/{TENANT_ID}/"),
        "sub": "subject-1",
        "oid": "object-1",
        "tid": TENANT_ID,
        "name": "Ada Lovelace",
        "preferred_username": "ada@contoso.com",
        "nonce": nonce,
        "iat": now(),
        "exp": now() + lifetime,
    }))
}

pub fn access_token(audience: &str, lifetime: u64, serial: usize) -> String {
    mint(&json!({
        "aud": audience,
        "exp": now() + lifetime,
        "serial": serial,
    }))
}

pub fn query_params(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

/// The redirect fragment the provider would return for the authorization request `url`.
pub fn login_fragment(url: &Url, lifetime: u64) -> String {
    let params = query_params(url);
    let audience = params.get("resource").or(params.get("scope")).cloned().unwrap_or_default();
    let fragment = serde_urlencoded::to_string(vec![
        ("id_token", id_token(&params["nonce"], lifetime)),
        ("access_token", access_token(&audience, lifetime, 0)),
        ("token_type", "Bearer".to_string()),
        ("expires_in", lifetime.to_string()),
        ("state", params["state"].clone()),
    ])
    .unwrap();
    format!("#{fragment}")
}

pub fn browser_config() -> ConfigBuilder {
    ConfigBuilder::new()
        .client_id(CLIENT_ID)
        .redirect_uri(REDIRECT_URI)
        .unwrap()
        .post_logout_redirect_uri("https://app.example.com/")
        .unwrap()
}

/// Forwards every top-level navigation to the test.
pub struct ChannelNavigator {
    sender: mpsc::UnboundedSender<Url>,
}

impl Navigator for ChannelNavigator {
    fn navigate(&self, url: &Url) {
        let _ = self.sender.send(url.clone());
    }
}

pub enum FrameAnswer {
    /// Tokens living this many seconds.
    Tokens(u64),
    /// An OAuth2 error code.
    Error(&'static str),
    /// An access token that is not a JWT and comes without `expires_in`.
    Malformed,
}

/// Plays the provider inside the hidden frame.
pub struct ScriptedFrame {
    answer: FrameAnswer,
    loads: AtomicUsize,
    pub started: Notify,
    gate: Option<Notify>,
}

impl ScriptedFrame {
    pub fn answering(answer: FrameAnswer) -> Self {
        Self {
            answer,
            loads: AtomicUsize::new(0),
            started: Notify::new(),
            gate: None,
        }
    }

    /// A frame that holds every load until [`release`](Self::release).
    pub fn gated(answer: FrameAnswer) -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::answering(answer)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SilentFrame for ScriptedFrame {
    async fn load(&self, url: &Url) -> Result<Url, KurveError> {
        let serial = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let params = query_params(url);
        assert_eq!(params["prompt"], "none");
        let mut answer = vec![("state", params["state"].clone())];
        match self.answer {
            FrameAnswer::Tokens(lifetime) => {
                let audience = params.get("resource").or(params.get("scope")).cloned().unwrap_or_default();
                answer.push(("access_token", access_token(&audience, lifetime, serial)));
                answer.push(("expires_in", lifetime.to_string()));
                if params["response_type"].contains("id_token") {
                    answer.push(("id_token", id_token(&params["nonce"], lifetime)));
                }
            }
            FrameAnswer::Error(code) => {
                answer.push(("error", code.to_string()));
                answer.push(("error_description", format!("AADSTS50058: {code}")));
            }
            FrameAnswer::Malformed => answer.push(("access_token", "not-a-jwt".to_string())),
        }
        let mut landed = Url::parse(REDIRECT_URI).unwrap();
        landed.set_fragment(Some(&serde_urlencoded::to_string(answer).unwrap()));
        Ok(landed)
    }
}

pub struct BrowserHarness {
    pub identity: Identity,
    pub navigations: mpsc::UnboundedReceiver<Url>,
    pub frame: Arc<ScriptedFrame>,
}

pub fn browser_harness(config: Config, frame: ScriptedFrame) -> BrowserHarness {
    init_tracing();
    let (sender, navigations) = mpsc::unbounded_channel();
    let frame = Arc::new(frame);
    let identity = Identity::browser(config, Arc::new(ChannelNavigator { sender }), frame.clone());
    BrowserHarness {
        identity,
        navigations,
        frame,
    }
}

impl BrowserHarness {
    /// Runs a complete interactive login, answering with tokens living `lifetime` seconds.
    pub async fn log_in(&mut self, lifetime: u64) -> Url {
        let identity = self.identity.clone();
        let login = tokio::spawn(async move { identity.login_async(LoginOptions::default()).await });
        let url = self.navigations.recv().await.unwrap();
        self.identity
            .handle_callback(&login_fragment(&url, lifetime))
            .await
            .unwrap();
        login.await.unwrap().unwrap();
        url
    }
}
