use serde::{Deserialize, Serialize};

use crate::core::ListingId;

/// Header identity sent with every marketplace call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProfile {
    pub accept: String,
    pub accept_language: String,
    pub user_agent: String,
    pub origin: Option<String>,
}

impl Default for RequestProfile {
    fn default() -> Self {
        Self {
            accept: "application/json, text/plain, */*".to_string(),
            accept_language: "ru,en;q=0.9,en-GB;q=0.8,en-US;q=0.7".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0"
                .to_string(),
            origin: None,
        }
    }
}

/// JSON body of `POST /api/user/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginForm<'a> {
    pub l_username: &'a str,
    pub l_password: &'a str,
    pub jlog: u8,
    pub recaptcha_pass_token: &'a str,
    #[serde(rename = "g-recaptcha-response")]
    pub g_recaptcha_response: &'a str,
    pub track_client_id: bool,
    pub l_remember_me: &'a str,
}

impl<'a> LoginForm<'a> {
    pub fn new(username: &'a str, password: &'a str) -> Self {
        Self {
            l_username: username,
            l_password: password,
            jlog: 1,
            recaptcha_pass_token: "",
            g_recaptcha_response: "",
            track_client_id: false,
            l_remember_me: "1",
        }
    }
}

/// Query string (and the single multipart field `a`) of the listings call.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ListingsQuery {
    pub a: u8,
    pub page: u32,
}

impl Default for ListingsQuery {
    fn default() -> Self {
        Self { a: 1, page: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct LoginResponse {
    /// `name=value` pairs from every `Set-Cookie` header, joined by `"; "`.
    pub session_cookie: String,
    pub raw: serde_json::Value,
}

/// Response wrapper shared by the marketplace JSON endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn error_text(&self) -> Option<String> {
        error_text(self.error.as_ref())
    }
}

/// The marketplace reports errors as a plain string most of the time, but
/// occasionally as a number or nested object.
pub fn error_text(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsPage {
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    #[serde(deserialize_with = "flexible::id")]
    pub id: ListingId,
    #[serde(rename = "name", default, deserialize_with = "flexible::string")]
    pub title: String,
    #[serde(default, deserialize_with = "flexible::string")]
    pub description: String,
    #[serde(default, deserialize_with = "flexible::amount")]
    pub price_limit: Option<f64>,
    #[serde(default, deserialize_with = "flexible::amount")]
    pub possible_price_limit: Option<f64>,
    #[serde(default, deserialize_with = "flexible::text")]
    pub time_left: Option<String>,
    #[serde(rename = "kwork_count", default, deserialize_with = "flexible::count")]
    pub offer_count: Option<u64>,
    #[serde(rename = "wantUserGetProfileUrl", default, deserialize_with = "flexible::text")]
    pub buyer_profile_url: Option<String>,
    #[serde(rename = "getWantsActiveCount", default, deserialize_with = "flexible::count")]
    pub buyer_open_listings: Option<u64>,
    #[serde(default)]
    pub user: Option<BuyerEnvelope>,
    #[serde(default, deserialize_with = "flexible::list")]
    pub files: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyerEnvelope {
    #[serde(default, deserialize_with = "flexible::or_default")]
    pub data: BuyerStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuyerStats {
    #[serde(default, deserialize_with = "flexible::count")]
    pub wants_count: Option<u64>,
    #[serde(default, deserialize_with = "flexible::amount")]
    pub wants_hired_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(
        rename = "fname",
        default = "default_attachment_name",
        deserialize_with = "flexible::filename"
    )]
    pub filename: String,
}

fn default_attachment_name() -> String {
    "attachment".to_string()
}

impl Listing {
    /// Buyer's username, taken from the last segment of their profile URL.
    pub fn buyer_username(&self) -> Option<&str> {
        self.buyer_profile_url
            .as_deref()?
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }

    pub fn buyer_stats(&self) -> BuyerStats {
        self.user
            .as_ref()
            .map(|envelope| envelope.data.clone())
            .unwrap_or_default()
    }
}

/// Lenient field decoders: the marketplace sends numbers both as JSON numbers
/// and as numeric strings, and `null` wherever a field is empty.
mod flexible {
    use serde::{Deserialize, Deserializer};

    use super::Attachment;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Int(u64),
        Float(f64),
        Text(String),
    }

    impl Loose {
        fn as_f64(&self) -> Option<f64> {
            match self {
                Loose::Int(n) => Some(*n as f64),
                Loose::Float(f) => Some(*f),
                Loose::Text(s) => s.trim().parse().ok(),
            }
        }

        fn as_u64(&self) -> Option<u64> {
            match self {
                Loose::Int(n) => Some(*n),
                Loose::Float(f) if *f >= 0.0 => Some(*f as u64),
                Loose::Float(_) => None,
                Loose::Text(s) => s.trim().parse().ok(),
            }
        }
    }

    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = Loose::deserialize(deserializer)?;
        raw.as_u64()
            .ok_or_else(|| serde::de::Error::custom("listing id is not a non-negative integer"))
    }

    pub fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Ok(Option::<Loose>::deserialize(deserializer)?.and_then(|raw| raw.as_f64()))
    }

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        Ok(Option::<Loose>::deserialize(deserializer)?.and_then(|raw| raw.as_u64()))
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(
            Option::<Loose>::deserialize(deserializer)?.map(|raw| match raw {
                Loose::Int(n) => n.to_string(),
                Loose::Float(f) => f.to_string(),
                Loose::Text(s) => s,
            }),
        )
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(text(deserializer)?.unwrap_or_default())
    }

    pub fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Default,
    {
        Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
    }

    pub fn list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Attachment>, D::Error> {
        or_default(deserializer)
    }

    pub fn filename<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(text(deserializer)?
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(super::default_attachment_name))
    }
}
