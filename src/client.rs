use crate::config::EffectiveConfig;
use crate::resource::{Collection, FieldError, Resource};
use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const UA: &str = "vtmctl/0.1";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("cannot build URL for `{name}` from {base}")]
    Url { base: String, name: String },
}

/// Access to the remote configuration store.
///
/// Implementations perform exactly one remote call per method invocation.
pub trait ResourceClient {
    fn list(&mut self, collection: Collection) -> Result<Vec<String>, RemoteError>;
    fn get(&mut self, collection: Collection, name: &str) -> Result<Resource, RemoteError>;
    fn set(&mut self, resource: &Resource) -> Result<(), RemoteError>;

    fn list_virtual_servers(&mut self) -> Result<Vec<String>, RemoteError> {
        self.list(Collection::VirtualServers)
    }

    fn list_pools(&mut self) -> Result<Vec<String>, RemoteError> {
        self.list(Collection::Pools)
    }

    fn get_virtual_server(&mut self, name: &str) -> Result<Resource, RemoteError> {
        self.get(Collection::VirtualServers, name)
    }

    fn get_pool(&mut self, name: &str) -> Result<Resource, RemoteError> {
        self.get(Collection::Pools, name)
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    name: String,
}

#[derive(Debug, Clone)]
pub struct VtmClient {
    base_url: Url,
    http: Client,
    username: String,
    password: String,
}

impl VtmClient {
    pub fn new(config: &EffectiveConfig) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(&config.url).context("parsing API URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let base_url = base_url
            .join(&format!("api/tm/{}/config/active/", config.api_version))
            .context("joining API version to base URL")?;

        let http = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .user_agent(HeaderValue::from_static(UA))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            base_url,
            http,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn collection_url(&self, collection: Collection) -> Result<Url, RemoteError> {
        self.base_url
            .join(collection.path())
            .map_err(|_| RemoteError::Url {
                base: self.base_url.to_string(),
                name: collection.path().to_string(),
            })
    }

    fn resource_url(&self, collection: Collection, name: &str) -> Result<Url, RemoteError> {
        let mut url = self.collection_url(collection)?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Url {
                base: self.base_url.to_string(),
                name: name.to_string(),
            })?
            .push(name);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value, RemoteError> {
        debug!(%method, %url, "sending request");
        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(USER_AGENT, HeaderValue::from_static(UA));

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().map_err(|source| RemoteError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status();
        info!("Response: {}", status);
        let text = resp.text().map_err(|source| RemoteError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message: format_error_message(&method, status, &text, url.as_str()),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|source| RemoteError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

impl ResourceClient for VtmClient {
    fn list(&mut self, collection: Collection) -> Result<Vec<String>, RemoteError> {
        let url = self.collection_url(collection)?;
        info!("Getting {} list from {}", collection.noun(), url);
        let json = self.request(Method::GET, url.clone(), None)?;
        let listing: Listing = serde_json::from_value(json).map_err(|source| RemoteError::Decode {
            url: url.to_string(),
            source,
        })?;
        Ok(listing.children.into_iter().map(|c| c.name).collect())
    }

    fn get(&mut self, collection: Collection, name: &str) -> Result<Resource, RemoteError> {
        let url = self.resource_url(collection, name)?;
        let json = self.request(Method::GET, url, None)?;
        Ok(Resource::from_document(collection, name, json)?)
    }

    fn set(&mut self, resource: &Resource) -> Result<(), RemoteError> {
        let url = self.resource_url(resource.collection, &resource.name)?;
        self.request(Method::PUT, url, Some(&resource.to_document()))?;
        Ok(())
    }
}

fn format_error_message(method: &Method, status: StatusCode, body: &str, url: &str) -> String {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return format!(
            "Authentication failed ({}) at {}\n\nPossible causes:\n  • Invalid API user or password\n  • The user lacks REST API permissions\n\nTry:\n  vtmctl config-show\n  vtmctl validate",
            status.as_u16(),
            url
        );
    }

    if status == StatusCode::NOT_FOUND {
        return format!(
            "Resource not found (404) at {}\n\nPossible causes:\n  • The name does not exist (it may have been removed since listing)\n  • The API version is not supported by this traffic manager\n\nTry:\n  vtmctl --api-version <VERSION> ...",
            url
        );
    }

    let mut msg = format!("{} {} failed: HTTP {}", method, url, status);
    // The traffic manager reports failures as {"error_id": .., "error_text": ..}.
    if let Ok(json) = serde_json::from_str::<Value>(body)
        && let Some(text) = json.get("error_text").and_then(|t| t.as_str())
    {
        msg.push_str(&format!("\n\nError: {}", text));
    } else if !body.trim().is_empty() {
        let snippet: String = body.chars().take(200).collect();
        let ellipsis = if body.chars().count() > 200 { "..." } else { "" };
        msg.push_str(&format!("\n\nResponse: {}{}", snippet, ellipsis));
    }
    msg
}
