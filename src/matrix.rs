//! Minimal Matrix client-server v3 REST client.
//!
//! Only the slice of the protocol the chat channel needs: password login,
//! long-poll sync, room membership, text/image messages.

use crate::error::{ChannelError, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Authenticated Matrix client bound to one homeserver account.
pub struct MatrixClient {
    http: reqwest::Client,
    homeserver: String,
    access_token: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    user_id: String,
}

/// One `/sync` response, reduced to the parts the bot consumes.
#[derive(Debug, Default, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: RoomUpdates,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomUpdates {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    pub invite: HashMap<String, Value>,
    #[serde(default)]
    pub leave: HashMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

/// A timeline event. Only message and membership events are interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl RoomEvent {
    /// Body of an `m.text` room message, if that's what this event is.
    pub fn message_text(&self) -> Option<&str> {
        if self.kind != "m.room.message" || self.content["msgtype"].as_str() != Some("m.text") {
            return None;
        }
        self.content["body"].as_str()
    }

    /// Membership value of an `m.room.member` event.
    pub fn membership(&self) -> Option<&str> {
        if self.kind != "m.room.member" {
            return None;
        }
        self.content["membership"].as_str()
    }
}

impl MatrixClient {
    /// Password login; returns a client carrying the access token.
    pub async fn login(homeserver: &str, user: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::new();
        let homeserver = homeserver.trim_end_matches('/').to_string();
        let body = json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": user},
            "password": password,
        });
        let response = http
            .post(format!("{homeserver}/_matrix/client/v3/login"))
            .json(&body)
            .send()
            .await
            .map_err(ChannelError::Http)?;
        let login: LoginResponse = check(response).await?.json().await.map_err(ChannelError::Http)?;
        Ok(Self {
            http,
            homeserver,
            access_token: login.access_token,
            user_id: login.user_id,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{path}", self.homeserver)
    }

    /// Long-poll sync. `since` is the previous `next_batch`.
    pub async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse> {
        let mut request = self
            .http
            .get(self.api("/sync"))
            .bearer_auth(&self.access_token)
            .query(&[("timeout", timeout_ms.to_string())]);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        let response = request.send().await.map_err(ChannelError::Http)?;
        Ok(check(response).await?.json().await.map_err(ChannelError::Http)?)
    }

    pub async fn join(&self, room_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.api(&format!("/join/{}", urlencoding::encode(room_id))))
            .bearer_auth(&self.access_token)
            .json(&json!({}))
            .send()
            .await
            .map_err(ChannelError::Http)?;
        check(response).await?;
        Ok(())
    }

    pub async fn leave(&self, room_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.api(&format!("/rooms/{}/leave", urlencoding::encode(room_id))))
            .bearer_auth(&self.access_token)
            .json(&json!({}))
            .send()
            .await
            .map_err(ChannelError::Http)?;
        check(response).await?;
        Ok(())
    }

    /// Send a plain-text room message.
    pub async fn send_text(&self, room_id: &str, body: &str) -> Result<()> {
        self.send_event(room_id, json!({"msgtype": "m.text", "body": body}))
            .await
    }

    /// Upload a PNG and send it as an image message.
    pub async fn send_image(&self, room_id: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/_matrix/media/v3/upload", self.homeserver))
            .bearer_auth(&self.access_token)
            .query(&[("filename", filename)])
            .header("Content-Type", "image/png")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(ChannelError::Http)?;
        let uploaded: Value = check(response).await?.json().await.map_err(ChannelError::Http)?;
        let Some(content_uri) = uploaded["content_uri"].as_str() else {
            return Err(ChannelError::Matrix("upload returned no content_uri".into()).into());
        };

        self.send_event(
            room_id,
            json!({
                "msgtype": "m.image",
                "body": filename,
                "url": content_uri,
                "info": {"mimetype": "image/png", "size": bytes.len()},
            }),
        )
        .await
    }

    /// Users currently joined to a room.
    pub async fn joined_members(&self, room_id: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.api(&format!(
                "/rooms/{}/joined_members",
                urlencoding::encode(room_id)
            )))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(ChannelError::Http)?;
        let parsed: Value = check(response).await?.json().await.map_err(ChannelError::Http)?;
        Ok(parsed["joined"]
            .as_object()
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn send_event(&self, room_id: &str, content: Value) -> Result<()> {
        let txn_id = uuid::Uuid::new_v4();
        let response = self
            .http
            .put(self.api(&format!(
                "/rooms/{}/send/m.room.message/{txn_id}",
                urlencoding::encode(room_id)
            )))
            .bearer_auth(&self.access_token)
            .json(&content)
            .send()
            .await
            .map_err(ChannelError::Http)?;
        check(response).await?;
        Ok(())
    }
}

/// Turn non-2xx responses into channel errors carrying the server's body.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::Matrix(format!("{status}: {body}")).into())
}
