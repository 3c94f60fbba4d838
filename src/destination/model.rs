use serde::{Deserialize, Serialize};

/// Standard OAuth2 token endpoint response.
#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Serialize, Debug)]
pub struct PublishBody<'a> {
    pub text: &'a str,
    pub media: Vec<MediaBody<'a>>,
}

#[derive(Serialize, Debug)]
pub struct MediaBody<'a> {
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
pub struct PublishResponse {
    pub id: serde_json::Value,
    #[serde(default)]
    pub url: Option<String>,
}
