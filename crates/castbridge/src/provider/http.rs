use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use super::crypto::{
    challenge_proof, decrypt_token_data, derive_session_key, encrypt_auth_blob,
    parse_token_payload,
};
use super::{AuthGrant, LineupEntry, StreamLocator, UpstreamProvider};
use crate::session::{Credentials, Session};
use crate::{BridgeError, UpstreamConfig};

static CONFIG_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"flashvars\.configURL = '(.+?)'").expect("valid config url pattern")
});
static CONFIG_ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<config\b([^>]*)>").expect("valid config entry pattern"));
static ATTRIBUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("valid attribute pattern"));

/// Service endpoints announced by the player configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub auth_url: String,
    pub token_url: String,
    pub lineup_url: String,
}

impl Endpoints {
    fn from_config_xml(xml: &str) -> Result<Self, BridgeError> {
        let mut entries = HashMap::new();
        for entry in CONFIG_ENTRY_RE.captures_iter(xml) {
            let attributes: HashMap<&str, &str> = ATTRIBUTE_RE
                .captures_iter(&entry[1])
                .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
                .collect();
            if let (Some(name), Some(value)) = (attributes.get("name"), attributes.get("value")) {
                entries.insert(name.to_string(), value.trim_end_matches('/').to_string());
            }
        }

        let mut take = |name: &str| {
            entries.remove(name).ok_or_else(|| {
                BridgeError::Transport(format!("Player configuration lacks {name}"))
            })
        };
        Ok(Endpoints {
            auth_url: take("AuthenticationBaseUrl")?,
            token_url: take("TokenBaseUrl")?,
            lineup_url: take("ChannelLineUpBaseUrl")?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthEnvelope<T> {
    authentication_response: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthChallenge {
    authentication_challenge: String,
    salt: String,
    iterations_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResult {
    status: i64,
    #[serde(default)]
    messages: Value,
    #[serde(default)]
    session_id: Option<String>,
}

impl AuthResult {
    fn message_code(&self) -> Option<i64> {
        match &self.messages {
            Value::Array(items) => items.first().and_then(|m| m["code"].as_i64()),
            other => other["code"].as_i64(),
        }
    }
}

/// Upstream provider speaking the service's HTTP protocol
pub struct HttpProvider {
    client: Client,
    config: UpstreamConfig,
    endpoints: OnceCell<Endpoints>,
}

impl HttpProvider {
    /// Endpoints are discovered from the player page on first use
    pub fn new(client: Client, config: UpstreamConfig) -> Self {
        Self {
            client,
            config,
            endpoints: OnceCell::new(),
        }
    }

    pub fn with_endpoints(client: Client, config: UpstreamConfig, endpoints: Endpoints) -> Self {
        Self {
            client,
            config,
            endpoints: OnceCell::new_with(Some(endpoints)),
        }
    }

    async fn endpoints(&self) -> Result<&Endpoints, BridgeError> {
        self.endpoints.get_or_try_init(|| self.discover()).await
    }

    async fn discover(&self) -> Result<Endpoints, BridgeError> {
        let player_page = self.get_text(&self.config.player_url).await?;
        let config_url = CONFIG_URL_RE
            .captures(&player_page)
            .map(|c| c[1].to_string())
            .ok_or_else(|| {
                BridgeError::Transport(format!(
                    "Could not find flashvars.configURL at {}",
                    self.config.player_url
                ))
            })?;

        let config_xml = self.get_text(&config_url).await?;
        let endpoints = Endpoints::from_config_xml(&config_xml)?;
        info!(
            auth = %endpoints.auth_url,
            token = %endpoints.token_url,
            lineup = %endpoints.lineup_url,
            "Discovered upstream endpoints"
        );
        Ok(endpoints)
    }

    async fn get_text(&self, url: &str) -> Result<String, BridgeError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Transport(format!(
                "Failed to fetch {url}: HTTP {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }

    async fn post_auth<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<T, BridgeError> {
        let response = self.client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Auth(format!(
                "Login endpoint answered HTTP {}",
                response.status()
            )));
        }
        let envelope: AuthEnvelope<T> = response.json().await?;
        Ok(envelope.authentication_response)
    }

    /// GET a token protected resource below the stream base
    async fn get_resource(&self, locator: &StreamLocator, uri: &str) -> Result<Bytes, BridgeError> {
        let mut url = resolve(&locator.base_url, uri)?;
        url.query_pairs_mut().append_pair("token", &locator.token);

        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?),
            StatusCode::NOT_FOUND => Err(BridgeError::NotFound(uri.to_string())),
            status => {
                warn!(%status, uri, "Stream token rejected");
                Err(BridgeError::TokenRejected {
                    status: status.as_u16(),
                })
            }
        }
    }
}

fn resolve(base: &str, uri: &str) -> Result<Url, BridgeError> {
    if let Ok(url) = Url::parse(uri) {
        return Ok(url);
    }
    Url::parse(base)
        .and_then(|base| base.join(uri))
        .map_err(|e| BridgeError::Transport(format!("Invalid resource URI {uri}: {e}")))
}

/// Flatten `lineup-response.lineup.categories[].genres[].channels[]`
fn parse_lineup(lineup: &Value) -> Result<Vec<LineupEntry>, BridgeError> {
    let categories = lineup["lineup-response"]["lineup"]["categories"]
        .as_array()
        .ok_or_else(|| BridgeError::Transport("Lineup has no categories".to_string()))?;

    let mut channels = Vec::new();
    for category in categories {
        // A category with a single genre is sent as an object
        let genres = match &category["genres"] {
            Value::Array(genres) => genres.iter().collect::<Vec<_>>(),
            genre @ Value::Object(_) => vec![genre],
            _ => continue,
        };
        for genre in genres {
            let genre_name = genre["name"].as_str().unwrap_or_default();
            for channel in genre["channels"].as_array().into_iter().flatten() {
                let number = match &channel["siriusChannelNo"] {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                let (Some(number), Some(key)) = (number, channel["channelKey"].as_str()) else {
                    debug!(?channel, "Skipping lineup entry without number or key");
                    continue;
                };
                channels.push(LineupEntry {
                    number: number as u32,
                    key: key.to_string(),
                    name: channel["name"].as_str().unwrap_or(key).to_string(),
                    genre: genre_name.to_string(),
                });
            }
        }
    }
    channels.sort_by_key(|c| c.number);
    channels.dedup_by_key(|c| c.number);
    Ok(channels)
}

#[async_trait]
impl UpstreamProvider for HttpProvider {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant, BridgeError> {
        let endpoints = self.endpoints().await?;
        let consumer = &self.config.consumer_type;

        let challenge: AuthChallenge = self
            .post_auth(
                &format!("{}/en-us/json/user/login/v3/initiate", endpoints.auth_url),
                &json!({
                    "AuthenticationRequest": {
                        "userName": credentials.username,
                        "consumerType": consumer,
                    }
                }),
            )
            .await?;

        let proof = challenge_proof(
            &self.config.hardware_id,
            &self.config.ethernet_mac,
            &challenge.authentication_challenge,
        )?;
        let key = derive_session_key(
            &credentials.password,
            &challenge.salt,
            challenge.iterations_count,
        )?;
        let blob = encrypt_auth_blob(&key, &proof)?;

        let result: AuthResult = self
            .post_auth(
                &format!("{}/en-us/json/user/login/v3/complete", endpoints.auth_url),
                &json!({
                    "AuthenticationRequest": {
                        "userName": credentials.username,
                        "consumerType": consumer,
                        "currency": 840,
                        "playerIdentification": {
                            "hardwareIdentification": self.config.hardware_id,
                            "ethernetMac": self.config.ethernet_mac,
                        },
                        "authenticationData": hex::encode(blob),
                    }
                }),
            )
            .await?;

        if result.status == 0 {
            return Err(match result.message_code() {
                Some(401) => BridgeError::CredentialsRejected("Invalid password".to_string()),
                code => BridgeError::Auth(format!("Unknown login error (code {code:?})")),
            });
        }
        let token = result
            .session_id
            .ok_or_else(|| BridgeError::Auth("Login response has no session id".to_string()))?;

        Ok(AuthGrant {
            token,
            secret: key.to_vec(),
            expires_in: None,
        })
    }

    async fn lineup(&self) -> Result<Vec<LineupEntry>, BridgeError> {
        let endpoints = self.endpoints().await?;
        let url = format!("{}/en-us/json/lineup/200/client/ump", endpoints.lineup_url);
        let lineup: Value = serde_json::from_str(&self.get_text(&url).await?)?;
        let channels = parse_lineup(&lineup)?;
        info!(count = channels.len(), "Loaded channel lineup");
        Ok(channels)
    }

    async fn open_stream(
        &self,
        session: &Session,
        channel_key: &str,
    ) -> Result<StreamLocator, BridgeError> {
        let endpoints = self.endpoints().await?;
        let url = format!(
            "{}/en-us/json/v3/streaming/{}/{}/",
            endpoints.token_url, self.config.consumer_type, channel_key
        );
        let response = self
            .client
            .get(&url)
            .query(&[("sessionId", session.token.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BridgeError::TokenRejected {
                status: response.status().as_u16(),
            });
        }
        let body: Value = response.json().await?;

        let Some(token_data) = body["tokenResponse"]["tokenData"].as_str() else {
            // Upstream answers without token data once the session is gone
            return Err(BridgeError::Auth(format!(
                "Session rejected while opening {channel_key}"
            )));
        };
        let decrypted = decrypt_token_data(&session.secret, token_data)?;
        let (channel_url, token) = parse_token_payload(&decrypted)?;

        let variant = &self.config.variant;
        let base_url = format!("{channel_url}HLS_{channel_key}_{variant}/");
        debug!(channel_key, %base_url, "Opened upstream stream");
        Ok(StreamLocator {
            playlist_url: format!("{base_url}{channel_key}_{variant}_large.m3u8"),
            base_url,
            token,
        })
    }

    async fn fetch_playlist(&self, locator: &StreamLocator) -> Result<Bytes, BridgeError> {
        self.get_resource(locator, &locator.playlist_url).await
    }

    async fn fetch_segment(
        &self,
        locator: &StreamLocator,
        uri: &str,
    ) -> Result<Bytes, BridgeError> {
        self.get_resource(locator, uri).await
    }

    async fn fetch_key(&self, locator: &StreamLocator, uri: &str) -> Result<[u8; 16], BridgeError> {
        let data = self.get_resource(locator, uri).await?;
        <[u8; 16]>::try_from(data.as_ref()).map_err(|_| {
            BridgeError::Transport(format!(
                "Key from {uri} has incorrect length: {} bytes (expected 16)",
                data.len()
            ))
        })
    }
}
