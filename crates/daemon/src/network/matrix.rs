//! Matrix client-server API transport.
//!
//! Implements [`ChatTransport`] over plain HTTP long-polling with `reqwest`:
//! password login (or a pre-issued access token), `/sync` for inbound events,
//! `PUT /send` for output and `POST /join` for invitations.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chat_protocol::{BoxFuture, ChatTransport, InboundEvent, Result, TransportError, TransportSession};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::config::TransportConfig;

/// Filter for the first sync: only the position matters, not the history.
const INITIAL_SYNC_FILTER: &str = r#"{"room":{"timeline":{"limit":1}}}"#;

/// Matrix transport.
pub struct MatrixTransport {
    client: Client,
    homeserver: Url,
    user_id: String,
    password: Option<String>,
    device_name: String,
    sync_timeout: Duration,
    request_timeout: Duration,
    state: Mutex<SyncState>,
}

#[derive(Debug, Default)]
struct SyncState {
    access_token: Option<String>,
    /// Account resolved at login; invites are matched against it.
    user_id: String,
    /// `next_batch` of the last sync; `None` until the first connect.
    since: Option<String>,
    /// Invites found while skipping the backlog, delivered by the next poll.
    pending: Vec<InboundEvent>,
    /// Last message whose send failed transiently.
    unsent: Option<UnsentMessage>,
}

/// A retry of the same message reuses its transaction id, so the homeserver
/// drops the duplicate if the first attempt did reach it.
#[derive(Debug)]
struct UnsentMessage {
    room_id: String,
    body: String,
    html: Option<String>,
    txn_id: String,
}

impl UnsentMessage {
    fn matches(&self, room_id: &str, body: &str, html: Option<&str>) -> bool {
        self.room_id == room_id && self.body == body && self.html.as_deref() == html
    }
}

// Wire types. Only the fields the bridge reads are modelled.

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinedRoomsResponse {
    joined_rooms: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    invite: BTreeMap<String, InvitedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: EventList,
}

#[derive(Debug, Default, Deserialize)]
struct InvitedRoom {
    #[serde(default)]
    invite_state: EventList,
}

#[derive(Debug, Default, Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<RoomEvent>,
}

#[derive(Debug, Deserialize)]
struct RoomEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    content: Value,
}

impl MatrixTransport {
    /// Creates a transport from configuration. No request is made until
    /// [`ChatTransport::connect`].
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let homeserver = Url::parse(&config.homeserver).map_err(|e| {
            TransportError::Connection(format!("invalid homeserver URL {}: {}", config.homeserver, e))
        })?;
        let request_timeout = Duration::from_secs(config.request_timeout_secs);

        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("shellbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            homeserver,
            user_id: config.user_id.clone(),
            password: config.password.clone(),
            device_name: config.device_name.clone(),
            sync_timeout: Duration::from_secs(config.sync_timeout_secs),
            request_timeout,
            state: Mutex::new(SyncState {
                access_token: config.access_token.clone(),
                ..SyncState::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builds `<homeserver>/_matrix/client/v3/<segments...>`, escaping each
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Connection(format!("invalid homeserver URL {}", self.homeserver)))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .state()
            .access_token
            .clone()
            .ok_or_else(|| TransportError::Auth("not logged in".to_string()))?;
        Ok(request.bearer_auth(token))
    }

    async fn login(&self) -> Result<String> {
        let password = self
            .password
            .as_deref()
            .ok_or_else(|| TransportError::Auth("no password or access token configured".to_string()))?;

        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": self.user_id },
            "password": password,
            "initial_device_display_name": self.device_name,
        });
        let response = self
            .client
            .post(self.endpoint(&["login"])?)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let login: LoginResponse = decode(check_status(response).await?).await?;

        tracing::info!(user_id = %login.user_id, "Logged in to homeserver");
        self.state().access_token = Some(login.access_token);
        Ok(login.user_id)
    }

    async fn whoami(&self) -> Result<String> {
        let request = self.authorized(self.client.get(self.endpoint(&["account", "whoami"])?))?;
        let response = request.send().await.map_err(map_reqwest_error)?;
        let whoami: WhoAmIResponse = decode(check_status(response).await?).await?;
        Ok(whoami.user_id)
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        let request = self.authorized(self.client.get(self.endpoint(&["joined_rooms"])?))?;
        let response = request.send().await.map_err(map_reqwest_error)?;
        let rooms: JoinedRoomsResponse = decode(check_status(response).await?).await?;
        Ok(rooms.joined_rooms)
    }

    async fn sync(&self, since: Option<&str>, timeout: Duration, filter: Option<&str>) -> Result<SyncResponse> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout.as_millis().to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
            if let Some(filter) = filter {
                query.append_pair("filter", filter);
            }
        }

        let request = self
            .authorized(self.client.get(url))?
            .timeout(timeout + self.request_timeout);
        let response = request.send().await.map_err(map_reqwest_error)?;
        decode(check_status(response).await?).await
    }

    async fn connect_inner(&self) -> Result<TransportSession> {
        let has_token = self.state().access_token.is_some();
        let user_id = if has_token {
            self.whoami().await?
        } else {
            self.login().await?
        };

        self.state().user_id = user_id.clone();

        let since = self.state().since.clone();
        if since.is_none() {
            // Skip history so old commands are not replayed into the shell.
            let initial = self
                .sync(None, Duration::ZERO, Some(INITIAL_SYNC_FILTER))
                .await?;
            let invites: Vec<InboundEvent> = parse_sync(&initial, &user_id)
                .into_iter()
                .filter(|event| matches!(event, InboundEvent::Invite(_)))
                .collect();

            let mut state = self.state();
            state.since = Some(initial.next_batch);
            state.pending = invites;
            tracing::debug!(pending_invites = state.pending.len(), "Skipped sync backlog");
        } else {
            tracing::debug!("Resuming sync from stored position");
        }

        let joined_rooms = self.joined_rooms().await?;
        Ok(TransportSession {
            user_id,
            joined_rooms,
        })
    }

    async fn next_events_inner(&self) -> Result<Vec<InboundEvent>> {
        let (since, user_id, pending) = {
            let mut state = self.state();
            (
                state.since.clone(),
                state.user_id.clone(),
                std::mem::take(&mut state.pending),
            )
        };
        if !pending.is_empty() {
            return Ok(pending);
        }

        let response = self.sync(since.as_deref(), self.sync_timeout, None).await?;
        let events = parse_sync(&response, &user_id);
        self.state().since = Some(response.next_batch);

        tracing::trace!(events = events.len(), "Sync completed");
        Ok(events)
    }

    fn txn_id_for(&self, room_id: &str, body: &str, html: Option<&str>) -> String {
        match self.state().unsent {
            Some(ref unsent) if unsent.matches(room_id, body, html) => unsent.txn_id.clone(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    async fn send_inner(&self, room_id: &str, body: &str, html: Option<&str>) -> Result<()> {
        let txn_id = self.txn_id_for(room_id, body, html);
        let result = self.put_message(room_id, &txn_id, body, html).await;

        self.state().unsent = match result {
            Err(ref e) if e.is_transient() => Some(UnsentMessage {
                room_id: room_id.to_string(),
                body: body.to_string(),
                html: html.map(str::to_string),
                txn_id,
            }),
            _ => None,
        };
        result
    }

    async fn put_message(&self, room_id: &str, txn_id: &str, body: &str, html: Option<&str>) -> Result<()> {
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", txn_id])?;
        let content = message_content(body, html);

        let response = self
            .authorized(self.client.put(url))?
            .json(&content)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await?;

        tracing::debug!(room_id, txn_id, bytes = body.len(), "Sent message");
        Ok(())
    }

    async fn join_inner(&self, room_id: &str) -> Result<()> {
        let response = self
            .authorized(self.client.post(self.endpoint(&["join", room_id])?))?
            .json(&json!({}))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await?;

        tracing::info!(room_id, "Joined room");
        Ok(())
    }
}

impl ChatTransport for MatrixTransport {
    fn connect(&self) -> BoxFuture<'_, Result<TransportSession>> {
        Box::pin(self.connect_inner())
    }

    fn next_events(&self) -> BoxFuture<'_, Result<Vec<InboundEvent>>> {
        Box::pin(self.next_events_inner())
    }

    fn send<'a>(&'a self, room_id: &'a str, body: &'a str, html: Option<&'a str>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_inner(room_id, body, html))
    }

    fn join<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.join_inner(room_id))
    }
}

/// Builds an `m.room.message` body. Output goes out as `m.notice` so other
/// bots (and this bridge) do not treat it as a command.
fn message_content(body: &str, html: Option<&str>) -> Value {
    let mut content = json!({
        "msgtype": "m.notice",
        "body": body,
    });
    if let Some(html) = html {
        content["format"] = json!("org.matrix.custom.html");
        content["formatted_body"] = json!(html);
    }
    content
}

/// Extracts text messages and invitations addressed to `user_id`.
///
/// Rooms are visited in id order; events within a room keep timeline order.
fn parse_sync(response: &SyncResponse, user_id: &str) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    for (room_id, room) in &response.rooms.join {
        for event in &room.timeline.events {
            if event.kind != "m.room.message" {
                continue;
            }
            if event.content.get("msgtype").and_then(Value::as_str) != Some("m.text") {
                continue;
            }
            if let Some(body) = event.content.get("body").and_then(Value::as_str) {
                events.push(InboundEvent::message(&event.sender, room_id, body));
            }
        }
    }

    for (room_id, room) in &response.rooms.invite {
        let invite = room.invite_state.events.iter().find(|event| {
            event.kind == "m.room.member"
                && event.state_key.as_deref() == Some(user_id)
                && event.content.get("membership").and_then(Value::as_str) == Some("invite")
        });
        if let Some(event) = invite {
            events.push(InboundEvent::invite(&event.sender, room_id));
        }
    }

    events
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_decode() {
        TransportError::Decode(error.to_string())
    } else {
        TransportError::Connection(error.to_string())
    }
}

/// Maps an HTTP error status to a transport error. Rate limiting and server
/// errors are retried like connection failures.
fn status_error(status: u16, message: String) -> TransportError {
    match status {
        401 | 403 => TransportError::Auth(message),
        429 | 500..=599 => TransportError::Connection(format!("HTTP {}: {}", status, message)),
        _ => TransportError::Api { status, message },
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            let errcode = value.get("errcode")?.as_str()?.to_string();
            let error = value.get("error").and_then(Value::as_str).unwrap_or("");
            Some(format!("{}: {}", errcode, error))
        })
        .unwrap_or(body);

    tracing::debug!(status = status.as_u16(), message = %message, "Homeserver returned an error");
    Err(status_error(status.as_u16(), message))
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response.bytes().await.map_err(map_reqwest_error)?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
}
