use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, ORIGIN, SET_COOKIE, USER_AGENT,
};
use reqwest::multipart::Form;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::types::*;
use super::Marketplace;
use crate::core::error::UNKNOWN_ERROR;
use crate::core::{Result, TrackerError};

/// Stateless HTTP client for the Kwork marketplace.
pub struct KworkClient {
    client: Client,
    base_url: String,
}

impl KworkClient {
    pub fn new(base_url: &str, profile: &RequestProfile, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, header_value(&profile.accept)?);
        headers.insert(ACCEPT_LANGUAGE, header_value(&profile.accept_language)?);
        headers.insert(USER_AGENT, header_value(&profile.user_agent)?);
        headers.insert(
            ORIGIN,
            header_value(profile.origin.as_deref().unwrap_or(&base_url))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if let Some(rest) = url.strip_prefix("//") {
            format!("https://{}", rest)
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Marketplace for KworkClient {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let url = format!("{}/api/user/login", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&LoginForm::new(username, password))
            .send()
            .await?;

        let status = response.status();
        let session_cookie = session_cookie(response.headers());
        let body = response.text().await?;
        let raw: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        let reason = || error_text(raw.get("error")).unwrap_or_else(|| UNKNOWN_ERROR.to_string());

        if status != StatusCode::OK {
            tracing::error!("Login failed with status code: {}", status);
            return Err(TrackerError::Auth(reason()));
        }

        if raw.get("success").and_then(serde_json::Value::as_bool) != Some(true) {
            let reason = reason();
            tracing::error!("Login failed with error: {}", reason);
            return Err(TrackerError::Auth(reason));
        }

        if session_cookie.is_empty() {
            return Err(TrackerError::Auth(
                "login succeeded but no session cookie was issued".to_string(),
            ));
        }

        Ok(LoginResponse {
            session_cookie,
            raw,
        })
    }

    async fn fetch_listings(&self, session_cookie: &str) -> Result<Vec<Listing>> {
        let url = format!("{}/projects", self.base_url);
        let query = ListingsQuery::default();
        let form = Form::new().text("a", query.a.to_string());

        let response = self
            .client
            .post(&url)
            .query(&query)
            .header(COOKIE, header_value(session_cookie)?)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TrackerError::Network(format!(
                "listing request returned {}",
                status
            )));
        }

        let envelope: ApiEnvelope<ProjectsPage> = response
            .json()
            .await
            .map_err(|e| TrackerError::Network(format!("malformed listing response: {}", e)))?;

        if !envelope.success {
            return Err(TrackerError::Network(format!(
                "marketplace rejected listing request: {}",
                envelope
                    .error_text()
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string())
            )));
        }

        let page = envelope.data.ok_or_else(|| {
            TrackerError::Network("listing response carried no data".to_string())
        })?;

        let listings = page
            .pagination
            .data
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<Listing>(raw) {
                Ok(listing) => Some(listing),
                Err(e) => {
                    tracing::warn!("Skipping undecodable listing: {}", e);
                    None
                }
            })
            .collect();

        Ok(listings)
    }

    async fn fetch_attachment(&self, session_cookie: &str, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.resolve_url(url))
            .header(COOKIE, header_value(session_cookie)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Network(format!(
                "attachment download returned {}",
                status
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| TrackerError::Network("value is not a valid HTTP header".to_string()))
}

/// Collapse `Set-Cookie` headers into a single `Cookie` header value.
fn session_cookie(headers: &HeaderMap) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for raw in headers.get_all(SET_COOKIE) {
        let Ok(raw) = raw.to_str() else {
            continue;
        };
        let Some((name, value)) = raw.split(';').next().and_then(|pair| pair.split_once('='))
        else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        match pairs.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = value.trim().to_string(),
            None => pairs.push((name.to_string(), value.trim().to_string())),
        }
    }

    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}
