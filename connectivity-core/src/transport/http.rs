//! HTTP request/response as a frame transport
//!
//! Each outbound envelope is mapped by message type to an HTTP route and
//! executed on its own task. The response comes back on the inbound stream
//! as one or more envelopes carrying the request's correlation id, so the
//! correlation engine treats REST replies exactly like FIX replies:
//!
//! - a JSON object becomes one envelope of the route's response type
//! - a JSON array becomes one envelope per element, each declaring the
//!   array length as total (an empty array yields one envelope, total 0)
//! - a non-2xx status becomes a business reject (`j`) with the body as text
//! - a failed request becomes a session reject (`3`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use super::{FrameSink, FrameStream, Transport};
use crate::auth::RequestSigner;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::message::{msg_type, Envelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }

    fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

/// How one outbound message type maps onto an HTTP call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRoute {
    /// Outbound `msg_type` this route serves
    pub msg_type: String,
    pub method: HttpMethod,
    /// Path below the base URL; `{tag}` is replaced by that field's value
    pub path: String,
    /// `msg_type` given to reply envelopes
    pub response_type: String,
    /// JSON member name → field tag for reply members
    #[serde(default)]
    pub field_map: BTreeMap<String, String>,
}

impl HttpRoute {
    pub fn new(msg_type: &str, method: HttpMethod, path: &str, response_type: &str) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            method,
            path: path.to_string(),
            response_type: response_type.to_string(),
            field_map: BTreeMap::new(),
        }
    }

    pub fn map_field(mut self, member: &str, tag: &str) -> Self {
        self.field_map.insert(member.to_string(), tag.to_string());
        self
    }

    /// Path with `{tag}` placeholders filled from `envelope`
    pub fn render_path(&self, envelope: &Envelope) -> ConnectivityResult<String> {
        let mut path = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();
        while let Some(start) = rest.find('{') {
            let end = rest[start..].find('}').map(|i| start + i).ok_or_else(|| {
                ConnectivityError::Protocol(format!("unterminated placeholder in {}", self.path))
            })?;
            path.push_str(&rest[..start]);
            path.push_str(envelope.require(&rest[start + 1..end])?);
            rest = &rest[end + 1..];
        }
        path.push_str(rest);
        Ok(path)
    }

    /// Reply envelopes for a successful response body
    pub fn replies(&self, correlation_id: Option<&str>, body: &str) -> Vec<Envelope> {
        let base = || {
            let mut envelope = Envelope::new(self.response_type.clone());
            envelope.correlation_id = correlation_id.map(str::to_string);
            envelope
        };

        if body.trim().is_empty() {
            return vec![base()];
        }
        let value: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                return vec![reject(
                    msg_type::REJECT,
                    correlation_id,
                    format!("unparseable HTTP response: {}", e),
                )];
            }
        };

        match value {
            Value::Array(items) if items.is_empty() => vec![base().with_total(0)],
            Value::Array(items) => {
                let total = items.len();
                items
                    .into_iter()
                    .map(|item| self.fill(base().with_total(total), item))
                    .collect()
            }
            other => vec![self.fill(base(), other)],
        }
    }

    fn fill(&self, mut envelope: Envelope, value: Value) -> Envelope {
        match value {
            Value::Object(members) => {
                for (name, member) in members {
                    let Some(text) = scalar_text(member) else {
                        continue;
                    };
                    let key = self.field_map.get(&name).cloned().unwrap_or(name);
                    envelope.fields.insert(key, text);
                }
                envelope
            }
            other => match scalar_text(other) {
                Some(text) => envelope.with_text(text),
                None => envelope,
            },
        }
    }
}

fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

struct HttpShared {
    client: reqwest::Client,
    base_url: String,
    routes: HashMap<String, HttpRoute>,
    signer: Option<Arc<RequestSigner>>,
}

/// REST client exposed as a frame transport carrying JSON envelopes
pub struct HttpTransport {
    shared: Arc<HttpShared>,
}

impl HttpTransport {
    pub fn new(base_url: &str, routes: Vec<HttpRoute>) -> ConnectivityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Self::with_client(client, base_url, routes, None)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        routes: Vec<HttpRoute>,
        signer: Option<Arc<RequestSigner>>,
    ) -> ConnectivityResult<Self> {
        Url::parse(base_url)
            .map_err(|e| ConnectivityError::Transport(format!("Invalid base URL: {}", e)))?;

        Ok(Self {
            shared: Arc::new(HttpShared {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                routes: routes.into_iter().map(|r| (r.msg_type.clone(), r)).collect(),
                signer,
            }),
        })
    }

    pub fn with_signer(self, signer: Arc<RequestSigner>) -> Self {
        let shared = &self.shared;
        Self {
            shared: Arc::new(HttpShared {
                client: shared.client.clone(),
                base_url: shared.base_url.clone(),
                routes: shared.routes.clone(),
                signer: Some(signer),
            }),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn connect(&self) -> ConnectivityResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: Box<dyn FrameSink> = Box::new(HttpSink {
            shared: self.shared.clone(),
            replies: Some(tx),
            in_flight: Vec::new(),
        });
        let frames: Box<dyn FrameStream> = Box::new(HttpFrames { replies: rx });
        Ok((sink, frames))
    }
}

struct HttpSink {
    shared: Arc<HttpShared>,
    replies: Option<mpsc::UnboundedSender<String>>,
    in_flight: Vec<JoinHandle<()>>,
}

#[async_trait]
impl FrameSink for HttpSink {
    async fn send(&mut self, frame: String) -> ConnectivityResult<()> {
        let Some(replies) = self.replies.clone() else {
            return Err(ConnectivityError::NotConnected("HTTP transport closed".into()));
        };
        let envelope: Envelope = serde_json::from_str(&frame)?;

        let Some(route) = self.shared.routes.get(&envelope.msg_type).cloned() else {
            if envelope.correlation_id.is_none() {
                debug!(msg_type = %envelope.msg_type, "No HTTP route; dropping message");
                return Ok(());
            }
            return Err(ConnectivityError::Protocol(format!(
                "no HTTP route for message type {}",
                envelope.msg_type
            )));
        };

        // sign before spawning; nonces must follow send order
        let correlation_id = envelope.correlation_id.clone();
        let request = match prepare(&self.shared, &route, &envelope) {
            Ok(request) => request,
            Err(e) => {
                let reply = reject(msg_type::REJECT, correlation_id.as_deref(), e.to_string());
                if replies.send(serde_json::to_string(&reply)?).is_err() {
                    return Err(ConnectivityError::NotConnected("HTTP transport closed".into()));
                }
                return Ok(());
            }
        };

        self.in_flight.retain(|task| !task.is_finished());
        let client = self.shared.client.clone();
        self.in_flight.push(tokio::spawn(async move {
            for reply in execute(&client, &route, correlation_id.as_deref(), request).await {
                match serde_json::to_string(&reply) {
                    Ok(frame) => {
                        if replies.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode HTTP reply"),
                }
            }
        }));
        Ok(())
    }

    async fn close(&mut self) -> ConnectivityResult<()> {
        self.replies = None;
        for task in self.in_flight.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

fn reject(kind: &str, correlation_id: Option<&str>, text: String) -> Envelope {
    let mut reject = Envelope::new(kind).with_text(text);
    reject.correlation_id = correlation_id.map(str::to_string);
    reject
}

/// Build and sign the request for `envelope`.
///
/// The signed path carries the query exactly as it goes on the wire.
fn prepare(
    shared: &HttpShared,
    route: &HttpRoute,
    envelope: &Envelope,
) -> ConnectivityResult<reqwest::Request> {
    let path = route.render_path(envelope)?;

    // the correlation id travels as an ordinary field so the venue can echo it
    let mut params = envelope.fields.clone();
    if let Some(id) = &envelope.correlation_id {
        params.insert(envelope.correlation_tag().to_string(), id.clone());
    }

    let (target, body) = if route.method.has_body() {
        (path, serde_json::to_string(&params)?)
    } else if params.is_empty() {
        (path, String::new())
    } else {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        (format!("{}?{}", path, query), String::new())
    };

    let mut builder = shared
        .client
        .request(route.method.to_reqwest(), format!("{}{}", shared.base_url, target));
    if route.method.has_body() {
        builder = builder
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone());
    }
    if let Some(signer) = &shared.signer {
        for (name, value) in signer.sign_request(route.method.as_str(), &target, &body)?.pairs() {
            builder = builder.header(name, value);
        }
    }
    Ok(builder.build()?)
}

async fn execute(
    client: &reqwest::Client,
    route: &HttpRoute,
    correlation_id: Option<&str>,
    request: reqwest::Request,
) -> Vec<Envelope> {
    debug!(method = %request.method(), url = %request.url(), "HTTP request");
    let response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => {
            return vec![reject(
                msg_type::REJECT,
                correlation_id,
                format!("HTTP request failed: {}", e),
            )]
        }
    };

    let status = response.status();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            return vec![reject(
                msg_type::REJECT,
                correlation_id,
                format!("HTTP body read failed: {}", e),
            )]
        }
    };

    if status.is_success() {
        route.replies(correlation_id, &text)
    } else {
        vec![reject(
            msg_type::BUSINESS_REJECT,
            correlation_id,
            format!("HTTP {}: {}", status.as_u16(), text),
        )]
    }
}

struct HttpFrames {
    replies: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for HttpFrames {
    async fn next_frame(&mut self) -> Option<ConnectivityResult<String>> {
        self.replies.recv().await.map(Ok)
    }
}
