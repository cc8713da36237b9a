use std::fs::File;
use std::path::Path;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, HeaderValue, SET_COOKIE, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::error::IcosdpError;

const LOGIN_URL: &str = "https://cpauth.icos-cp.eu/password/login";
const DATA_BASE_URL: &str = "https://data.icos-cp.eu/objects";
const AUTH_COOKIE: &str = "cpauthToken";

static TRAILING_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})\s*$").expect("valid year regex"));

/// One member of a catalog collection, as listed by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogMember {
    #[serde(rename = "res")]
    pub locator: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl CatalogMember {
    pub fn collection(locator: &str, title: &str) -> Self {
        Self {
            locator: locator.to_string(),
            title: Some(title.to_string()),
            name: None,
        }
    }

    pub fn object(locator: &str, name: &str) -> Self {
        Self {
            locator: locator.to_string(),
            title: None,
            name: Some(name.to_string()),
        }
    }

    /// Year taken from the trailing 4-digit token of the title.
    pub fn year(&self) -> Option<i32> {
        let title = self.title.as_deref()?;
        TRAILING_YEAR
            .captures(title)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Declared object name, falling back to the title.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.title.as_deref())
            .unwrap_or(&self.locator)
    }
}

#[derive(Debug, Deserialize)]
struct CollectionMeta {
    #[serde(default)]
    members: Vec<CatalogMember>,
}

pub trait CatalogClient: Send + Sync {
    fn collection_members(&self, locator: &str) -> Result<Vec<CatalogMember>, IcosdpError>;
    fn download(&self, object_locator: &str, destination: &Path) -> Result<(), IcosdpError>;
}

#[derive(Clone)]
pub struct IcosHttpClient {
    client: Client,
    auth_token: Option<String>,
}

impl IcosHttpClient {
    pub fn new() -> Result<Self, IcosdpError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("icosdp/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IcosdpError::Transport(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| IcosdpError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            auth_token: None,
        })
    }

    /// Signs in at the ICOS authentication service and keeps the session token.
    pub fn from_credentials(email: &str, password: &str) -> Result<Self, IcosdpError> {
        let mut this = Self::new()?;
        let response = this
            .send_with_retries(|| {
                this.client
                    .post(LOGIN_URL)
                    .form(&[("mail", email), ("password", password)])
            })?;
        let response = Self::handle_status(response)?;
        let token = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|cookie| {
                cookie
                    .split(';')
                    .next()
                    .and_then(|pair| pair.trim().strip_prefix(&format!("{AUTH_COOKIE}=")))
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                IcosdpError::Transport("login succeeded but no auth token was returned".to_string())
            })?;
        this.auth_token = Some(token);
        Ok(this)
    }

    pub fn data_url(object_locator: &str) -> String {
        let hash = object_locator
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(object_locator);
        format!("{DATA_BASE_URL}/{hash}")
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, IcosdpError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "ICOS request failed".to_string());
        Err(IcosdpError::TransportStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, IcosdpError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(IcosdpError::Transport(err.to_string()));
                }
            }
        }
    }
}

impl CatalogClient for IcosHttpClient {
    fn collection_members(&self, locator: &str) -> Result<Vec<CatalogMember>, IcosdpError> {
        debug!(locator, "fetching collection metadata");
        let response = self.send_with_retries(|| {
            self.client
                .get(locator)
                .header(ACCEPT, "application/json")
        })?;
        let response = Self::handle_status(response)?;
        let meta: CollectionMeta = response
            .json()
            .map_err(|err| IcosdpError::Transport(err.to_string()))?;
        Ok(meta.members)
    }

    fn download(&self, object_locator: &str, destination: &Path) -> Result<(), IcosdpError> {
        let token = self
            .auth_token
            .as_deref()
            .ok_or(IcosdpError::CredentialsRequired)?;
        let url = Self::data_url(object_locator);
        debug!(%url, destination = %destination.display(), "downloading object");
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .header(COOKIE, format!("{AUTH_COOKIE}={token}"))
        })?;
        let mut response = Self::handle_status(response)?;
        let mut file =
            File::create(destination).map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| IcosdpError::Transport(err.to_string()))?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_from_trailing_title_token() {
        let member = CatalogMember::collection("c1", "FLUXCOM-X-BASE NEE 0.5 monthly 2003");
        assert_eq!(member.year(), Some(2003));
        let member = CatalogMember::collection("c2", "no year here");
        assert_eq!(member.year(), None);
    }

    #[test]
    fn members_parse_from_metadata_json() {
        let meta: CollectionMeta = serde_json::from_str(
            r#"{"title": "NEE", "members": [
                {"res": "https://meta.icos-cp.eu/collections/a", "title": "NEE 2001"},
                {"res": "https://meta.icos-cp.eu/objects/b", "name": "NEE_2001_050_monthly.nc"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(meta.members.len(), 2);
        assert_eq!(meta.members[0].year(), Some(2001));
        assert_eq!(meta.members[1].display_name(), "NEE_2001_050_monthly.nc");
    }

    #[test]
    fn data_url_uses_object_hash() {
        assert_eq!(
            IcosHttpClient::data_url("https://meta.icos-cp.eu/objects/AbC123"),
            "https://data.icos-cp.eu/objects/AbC123"
        );
    }
}
