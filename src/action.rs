//! Scripted actions and how they execute.
//!
//! An [`Action`] is one HTTP, HTTPS or TCP exchange. Before it executes, every `${key}`
//! placeholder in its url, address, headers, body and payload is replaced with the
//! matching value from the [`SessionState`] of the virtual user. Every execution produces
//! exactly one [`OutcomeRecord`], or a [`StampedeError`] if a configuration problem was
//! detected that should stop the load test.
//!
//! All actions of a load test share one [`ActionContext`], which owns the HTTP clients
//! and the persistent TCP connections.

use http::header::{ACCEPT, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::{fmt, io, time};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::extract::{Extractor, ResponseExtractor};
use crate::metrics::OutcomeRecord;
use crate::session::SessionState;
use crate::test_plan::{ActionSpec, HttpActionSpec, TcpActionSpec};
use crate::StampedeError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The protocol an [`OutcomeRecord`] was produced by. HTTPS actions report as `HTTP`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ActionKind {
    Http,
    Tcp,
}

/// One executable action.
#[derive(Debug, Clone)]
pub enum Action {
    Http(HttpAction),
    /// Like `Http`, but certificates aren't validated.
    Https(HttpAction),
    Tcp(TcpAction),
}

#[derive(Debug, Clone)]
pub struct HttpAction {
    pub title: String,
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub accept: Option<String>,
    pub content_type: Option<String>,
    /// Request body template.
    pub body: Option<String>,
    pub extractor: Option<ResponseExtractor>,
    /// Name of the cookie to capture from responses.
    pub store_cookie: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TcpAction {
    pub title: String,
    pub address: String,
    pub payload: String,
    pub read_response: bool,
}

impl Action {
    /// Build an executable action, compiling any extraction expression.
    pub fn from_spec(spec: &ActionSpec) -> Result<Action, StampedeError> {
        if let Some(http) = spec.http.as_ref() {
            Ok(Action::Http(HttpAction::from_spec(http)?))
        } else if let Some(https) = spec.https.as_ref() {
            Ok(Action::Https(HttpAction::from_spec(https)?))
        } else if let Some(tcp) = spec.tcp.as_ref() {
            Ok(Action::Tcp(TcpAction::from_spec(tcp)))
        } else {
            Err(StampedeError::InvalidPlan {
                detail: format!("action {} defines no protocol", spec.title()),
            })
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Action::Http(action) | Action::Https(action) => &action.title,
            Action::Tcp(action) => &action.title,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Http(_) | Action::Https(_) => ActionKind::Http,
            Action::Tcp(_) => ActionKind::Tcp,
        }
    }

    /// Execute the action with the session of virtual `user` during `iteration`.
    ///
    /// Transport failures are logged and recorded with a status code of 0. Only
    /// extraction failures are returned as errors.
    pub async fn execute(
        &self,
        session: &mut SessionState,
        context: &ActionContext,
        user: usize,
        iteration: usize,
    ) -> Result<OutcomeRecord, StampedeError> {
        match self {
            Action::Http(action) => {
                action
                    .execute(&context.http, session, context, user, iteration)
                    .await
            }
            Action::Https(action) => {
                action
                    .execute(&context.https, session, context, user, iteration)
                    .await
            }
            Action::Tcp(action) => Ok(action.execute(session, context, user, iteration).await),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::Http(action) => write!(f, "{} {} {}", action.title, action.method, action.url),
            Action::Https(action) => {
                write!(f, "{} {} {}", action.title, action.method, action.url)
            }
            Action::Tcp(action) => write!(f, "{} tcp://{}", action.title, action.address),
        }
    }
}

impl HttpAction {
    fn from_spec(spec: &HttpActionSpec) -> Result<HttpAction, StampedeError> {
        let method = Method::from_bytes(spec.method.to_uppercase().as_bytes()).map_err(|_| {
            StampedeError::InvalidPlan {
                detail: format!("invalid method {} in action {}", spec.method, spec.title),
            }
        })?;
        let extractor = match spec.response.as_ref() {
            Some(response) => match response.expression() {
                Some((kind, expression)) => Some(ResponseExtractor {
                    extractor: Extractor::compile(kind, expression)?,
                    variable: response.variable.to_string(),
                    selection: response.index,
                }),
                None => {
                    return Err(StampedeError::InvalidPlan {
                        detail: format!(
                            "response handler of action {} must define exactly one of jsonpath or xmlpath",
                            spec.title
                        ),
                    })
                }
            },
            None => None,
        };
        Ok(HttpAction {
            title: spec.title.to_string(),
            method,
            url: spec.url.to_string(),
            headers: spec.headers.clone(),
            accept: spec.accept.clone(),
            content_type: spec.content_type.clone(),
            body: spec.body.clone().or_else(|| spec.template.clone()),
            extractor,
            store_cookie: spec.store_cookie.clone(),
        })
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        session: &mut SessionState,
        context: &ActionContext,
        user: usize,
        iteration: usize,
    ) -> Result<OutcomeRecord, StampedeError> {
        let url = session.substitute(&self.url);
        let mut request = client.request(self.method.clone(), &url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), session.substitute(value));
        }
        if let Some(accept) = self.accept.as_ref() {
            request = request.header(ACCEPT, session.substitute(accept));
        }
        if let Some(content_type) = self.content_type.as_ref() {
            request = request.header(CONTENT_TYPE, session.substitute(content_type));
        }
        if let Some(cookies) = session.cookie_header() {
            request = request.header(COOKIE, cookies);
        }
        if let Some(body) = self.body.as_ref() {
            request = request.body(session.substitute(body));
        }

        let mut record = OutcomeRecord::new(
            ActionKind::Http,
            &self.title,
            user,
            iteration,
            context.started.elapsed(),
        );
        debug!("user {} iteration {}: {} {}", user, iteration, self.method, url);

        let started = time::Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                record.set_latency(started.elapsed());
                warn!("{} {} failed: {}", self.method, url, e);
                return Ok(record);
            }
        };
        // Latency covers the round trip up to the response head, not reading the body.
        record.set_latency(started.elapsed());
        let status = response.status();
        let set_cookies = match self.store_cookie.as_ref() {
            Some(name) => response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .filter_map(|value| parse_set_cookie(value, name))
                .collect(),
            None => Vec::new(),
        };
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!("{} {} failed reading body: {}", self.method, url, e);
                return Ok(record);
            }
        };
        record.set_status_code(status.as_u16());
        record.set_size(body.len());

        if let Some(name) = self.store_cookie.as_ref() {
            for value in set_cookies {
                trace!("user {} storing cookie {}={}", user, name, value);
                session.store_cookie(name, &value);
            }
        }

        if status.is_success() {
            if let Some(extractor) = self.extractor.as_ref() {
                extractor.apply(&body, session)?;
            }
        } else {
            debug!("{} {} returned {}", self.method, url, status);
        }

        Ok(record)
    }
}

/// Return the value of cookie `name` if `header` (a `Set-Cookie` value) sets it.
pub(crate) fn parse_set_cookie(header: &str, name: &str) -> Option<String> {
    let pair = header.split(';').next()?;
    let (cookie_name, value) = pair.split_once('=')?;
    if cookie_name.trim() == name {
        Some(value.trim().to_string())
    } else {
        None
    }
}

impl TcpAction {
    fn from_spec(spec: &TcpActionSpec) -> TcpAction {
        TcpAction {
            title: spec.title.to_string(),
            address: spec.address.to_string(),
            payload: spec.payload.to_string(),
            read_response: spec.read_response,
        }
    }

    async fn execute(
        &self,
        session: &mut SessionState,
        context: &ActionContext,
        user: usize,
        iteration: usize,
    ) -> OutcomeRecord {
        let address = session.substitute(&self.address);
        let payload = session.substitute(&self.payload);

        // Exchanges with one address are serialized over its connection.
        let slot = context.tcp.slot(&address);
        let mut connection = slot.lock().await;

        let mut record = OutcomeRecord::new(
            ActionKind::Tcp,
            &self.title,
            user,
            iteration,
            context.started.elapsed(),
        );

        // Connecting isn't part of the measured latency.
        if connection.is_none() {
            match tokio::time::timeout(context.timeout, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => {
                    debug!("connected to {}", address);
                    *connection = Some(BufReader::new(stream));
                }
                Ok(Err(e)) => {
                    warn!("failed to connect to {}: {}", address, e);
                    return record;
                }
                Err(_) => {
                    warn!("timed out connecting to {}", address);
                    return record;
                }
            }
        }

        let started = time::Instant::now();
        let result = match connection.as_mut() {
            Some(stream) => {
                match tokio::time::timeout(
                    context.timeout,
                    exchange(stream, &payload, self.read_response),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "exchange timed out")),
                }
            }
            None => return record,
        };
        record.set_latency(started.elapsed());

        match result {
            Ok(size) => {
                record.set_status_code(200);
                record.set_size(size);
            }
            Err(e) => {
                warn!("tcp exchange with {} failed: {}", address, e);
                // Reconnect on next use.
                *connection = None;
            }
        }
        record
    }
}

// Write the payload and optionally read one line back, returning the bytes read.
async fn exchange(
    stream: &mut BufReader<TcpStream>,
    payload: &str,
    read_response: bool,
) -> io::Result<usize> {
    let message = format!("{}\r\n", payload);
    stream.get_mut().write_all(message.as_bytes()).await?;
    stream.get_mut().flush().await?;
    if !read_response {
        return Ok(0);
    }
    let mut line = String::new();
    match stream.read_line(&mut line).await? {
        0 => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a response was read",
        )),
        read => Ok(read),
    }
}

type TcpSlot = Arc<tokio::sync::Mutex<Option<BufReader<TcpStream>>>>;

/// Persistent TCP connections, one per address, created lazily.
#[derive(Default)]
pub struct TcpConnections {
    slots: Mutex<HashMap<String, TcpSlot>>,
}
impl TcpConnections {
    fn slot(&self, address: &str) -> TcpSlot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// How many addresses have been used.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resources shared by every action of one load test.
pub struct ActionContext {
    http: reqwest::Client,
    https: reqwest::Client,
    tcp: TcpConnections,
    timeout: time::Duration,
    started: time::Instant,
}
impl ActionContext {
    /// Build the HTTP clients. `timeout` bounds every request, connect and exchange.
    pub fn new(timeout: time::Duration) -> Result<ActionContext, StampedeError> {
        let http = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        let https = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(ActionContext {
            http,
            https,
            tcp: TcpConnections::default(),
            timeout,
            started: time::Instant::now(),
        })
    }

    /// When the load test started, offsets in outcome records are relative to this.
    pub fn started(&self) -> time::Instant {
        self.started
    }

    pub fn tcp_connections(&self) -> &TcpConnections {
        &self.tcp
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_plan::ResponseSpec;
    use httpmock::prelude::*;
    use tokio::net::TcpListener;

    fn http_spec(url: &str) -> ActionSpec {
        ActionSpec {
            http: Some(HttpActionSpec {
                title: "Test".to_string(),
                method: "get".to_string(),
                url: url.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn set_cookie() {
        assert_eq!(
            parse_set_cookie("SESSION=abc123; Path=/; HttpOnly", "SESSION"),
            Some("abc123".to_string())
        );
        assert_eq!(parse_set_cookie("OTHER=1; Path=/", "SESSION"), None);
        assert_eq!(parse_set_cookie("garbage", "SESSION"), None);
        assert_eq!(
            parse_set_cookie(" SESSION = spaced ", "SESSION"),
            Some("spaced".to_string())
        );
    }

    #[test]
    fn kind_display() {
        assert_eq!(ActionKind::Http.to_string(), "HTTP");
        assert_eq!(ActionKind::Tcp.to_string(), "TCP");
        let action = Action::from_spec(&http_spec("http://localhost/")).unwrap();
        assert_eq!(action.kind(), ActionKind::Http);
        assert_eq!(action.title(), "Test");
        assert_eq!(action.to_string(), "Test GET http://localhost/");
    }

    #[tokio::test]
    async fn http_substitutes_and_extracts() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/items/7")
                    .header("x-user", "10001")
                    .header("content-type", "application/json")
                    .body(r#"{"id": "7"}"#);
                then.status(201)
                    .header("Set-Cookie", "SESSION=s3cr3t; Path=/")
                    .body(r#"{"token": "abc"}"#);
            })
            .await;

        let mut spec = http_spec(&server.url("/items/${id}"));
        {
            let http = spec.http.as_mut().unwrap();
            http.method = "POST".to_string();
            http.headers.insert("X-User".to_string(), "${UID}".to_string());
            http.content_type = Some("application/json".to_string());
            http.template = Some(r#"{"id": "${id}"}"#.to_string());
            http.store_cookie = Some("SESSION".to_string());
            http.response = Some(ResponseSpec {
                jsonpath: Some("$.token".to_string()),
                variable: "token".to_string(),
                ..Default::default()
            });
        }
        let action = Action::from_spec(&spec).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("10001");
        session.insert("id", "7");

        let record = action.execute(&mut session, &context, 1, 1).await.unwrap();
        mock.assert_async().await;
        assert_eq!(record.status_code, 201);
        assert_eq!(record.size_bytes, r#"{"token": "abc"}"#.len());
        assert_eq!(record.kind, ActionKind::Http);
        assert!(record.latency_nanos > 0);
        assert_eq!(session.get("token"), Some("abc"));
        assert_eq!(session.cookie_header(), Some("SESSION=s3cr3t".to_string()));
    }

    #[tokio::test]
    async fn http_replays_cookies_and_skips_extraction_on_failure() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/private")
                    .cookie("SESSION", "s3cr3t");
                then.status(500).body(r#"{"token": "nope"}"#);
            })
            .await;

        let mut spec = http_spec(&server.url("/private"));
        spec.http.as_mut().unwrap().response = Some(ResponseSpec {
            jsonpath: Some("$.token".to_string()),
            variable: "token".to_string(),
            ..Default::default()
        });
        let action = Action::from_spec(&spec).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("10001");
        session.store_cookie("SESSION", "s3cr3t");

        let record = action.execute(&mut session, &context, 1, 1).await.unwrap();
        mock.assert_async().await;
        assert_eq!(record.status_code, 500);
        assert!(record.is_error());
        assert_eq!(session.get("token"), None);
    }

    #[tokio::test]
    async fn http_undecodable_body_is_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/");
                then.status(200).body("<html>not json</html>");
            })
            .await;
        let mut spec = http_spec(&server.url("/"));
        spec.http.as_mut().unwrap().response = Some(ResponseSpec {
            jsonpath: Some("$.id".to_string()),
            variable: "id".to_string(),
            ..Default::default()
        });
        let action = Action::from_spec(&spec).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("1");
        assert!(matches!(
            action.execute(&mut session, &context, 1, 1).await,
            Err(StampedeError::Extraction { .. })
        ));
    }

    #[tokio::test]
    async fn http_error_pages_are_not_decoded() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/missing");
                then.status(404).body("<html>not found</html>");
            })
            .await;
        let mut spec = http_spec(&server.url("/missing"));
        spec.http.as_mut().unwrap().response = Some(ResponseSpec {
            jsonpath: Some("$.id".to_string()),
            variable: "id".to_string(),
            ..Default::default()
        });
        let action = Action::from_spec(&spec).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("10001");

        // Extraction only applies to 2xx responses, so this isn't fatal.
        let record = action.execute(&mut session, &context, 1, 1).await.unwrap();
        mock.assert_async().await;
        assert_eq!(record.status_code, 404);
        assert_eq!(session.get("id"), None);
    }

    #[tokio::test]
    async fn http_latency_excludes_body() {
        // Sends the response head right away and the body half a second later.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            loop {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let stream = stream.get_mut();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(time::Duration::from_millis(500)).await;
            stream.write_all(b"ok").await.unwrap();
            stream.flush().await.unwrap();
        });

        let action = Action::from_spec(&http_spec(&format!("http://{}/", address))).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("10001");
        let started = time::Instant::now();
        let record = action.execute(&mut session, &context, 1, 1).await.unwrap();
        server.await.unwrap();

        assert_eq!(record.status_code, 200);
        assert_eq!(record.size_bytes, 2);
        // The body was still read before execute returned.
        assert!(started.elapsed() >= time::Duration::from_millis(500));
        assert!(
            record.latency_nanos < 400_000_000,
            "latency {}ns",
            record.latency_nanos
        );
    }

    #[tokio::test]
    async fn http_connection_refused() {
        // Bind then drop a listener to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let action = Action::from_spec(&http_spec(&format!("http://{}/", address))).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("1");
        let record = action.execute(&mut session, &context, 1, 1).await.unwrap();
        assert_eq!(record.status_code, 0);
        assert_eq!(record.size_bytes, 0);
    }

    #[tokio::test]
    async fn tcp_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // Only one connection is ever accepted.
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut lines = Vec::new();
            for _ in 0..2 {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                stream.get_mut().write_all(b"PONG\n").await.unwrap();
                lines.push(line);
            }
            lines
        });

        let spec = ActionSpec {
            tcp: Some(TcpActionSpec {
                title: "Ping".to_string(),
                address: address.to_string(),
                payload: "PING ${UID}".to_string(),
                read_response: true,
            }),
            ..Default::default()
        };
        let action = Action::from_spec(&spec).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("10001");

        for iteration in 1..=2 {
            let record = action
                .execute(&mut session, &context, 1, iteration)
                .await
                .unwrap();
            assert_eq!(record.kind, ActionKind::Tcp);
            assert_eq!(record.status_code, 200);
            assert_eq!(record.size_bytes, 5);
        }
        assert_eq!(context.tcp_connections().len(), 1);
        let lines = server.await.unwrap();
        assert_eq!(lines, vec!["PING 10001\r\n", "PING 10001\r\n"]);
    }

    #[tokio::test]
    async fn tcp_failure_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Close the first connection without answering, answer the second.
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            stream.get_mut().write_all(b"OK\n").await.unwrap();
            // Hold the connection open until the client is done.
            let _ = stream.read_line(&mut line).await;
        });

        let spec = ActionSpec {
            tcp: Some(TcpActionSpec {
                title: "Echo".to_string(),
                address: address.to_string(),
                payload: "HELLO".to_string(),
                read_response: true,
            }),
            ..Default::default()
        };
        let action = Action::from_spec(&spec).unwrap();
        let context = ActionContext::new(time::Duration::from_secs(5)).unwrap();
        let mut session = SessionState::new("1");

        let failed = action.execute(&mut session, &context, 1, 1).await.unwrap();
        assert_eq!(failed.status_code, 0);
        assert_eq!(failed.size_bytes, 0);

        let recovered = action.execute(&mut session, &context, 1, 2).await.unwrap();
        assert_eq!(recovered.status_code, 200);
        assert_eq!(recovered.size_bytes, 3);
    }
}
