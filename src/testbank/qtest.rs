//! qTest-compatible test-bank client.
//!
//! A configured bearer token is used as-is; otherwise a password grant is
//! performed on first use and the token cached for the life of the client.

use super::{TestBankClient, TestBankDetails, TestBankError, TestBankMatch};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;

const USER_AGENT: &str = concat!("quartermaster/", env!("CARGO_PKG_VERSION"));

/// Property names carrying the fields we enrich from.
const ASSIGNEE_FIELDS: &[&str] = &["Assigned To", "Assignee"];
const PRIORITY_FIELDS: &[&str] = &["Priority"];
const AUTOMATION_FIELDS: &[&str] = &["Automation Status", "Automation"];

/// Connection settings for a qTest-compatible test-bank.
#[derive(Debug, Clone, Default)]
pub struct TestBankCredentials {
    pub base_url: String,
    pub username: String,
    pub password: Option<String>,
    pub token: Option<String>,
    pub project_id: Option<String>,
    pub timeout: Duration,
}

impl TestBankCredentials {
    /// URL, username and a password or token are all present.
    pub fn is_complete(&self) -> bool {
        let present = |v: &str| !v.trim().is_empty();
        present(&self.base_url)
            && present(&self.username)
            && (self.password.as_deref().is_some_and(present)
                || self.token.as_deref().is_some_and(present))
    }
}

/// Blocking qTest REST client.
pub struct QTestClient {
    credentials: TestBankCredentials,
    base_url: String,
    agent: ureq::Agent,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: serde_json::Value,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct TestCaseBody {
    pid: Option<String>,
    #[serde(default)]
    properties: Vec<Property>,
}

#[derive(Debug, Deserialize)]
struct Property {
    field_name: Option<String>,
    field_value_name: Option<String>,
    field_value: Option<serde_json::Value>,
}

impl QTestClient {
    pub fn new(credentials: TestBankCredentials) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(credentials.timeout)
            .user_agent(USER_AGENT)
            .build();
        let token = credentials
            .token
            .clone()
            .filter(|t| !t.trim().is_empty());

        Self {
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            credentials,
            agent,
            token: Mutex::new(token),
        }
    }

    fn cached_token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }

    /// Return the cached token, logging in with the password if there is none.
    fn bearer(&self) -> Result<String, TestBankError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        let password = self
            .credentials
            .password
            .as_deref()
            .ok_or(TestBankError::NotConfigured)?;

        let basic = STANDARD.encode(format!("{}:", self.credentials.username));
        let response = self
            .agent
            .post(&format!("{}/oauth/token", self.base_url))
            .set("Authorization", &format!("Basic {}", basic))
            .send_form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", password),
            ]);
        let body: TokenResponse = decode(response)?;

        if let Ok(mut guard) = self.token.lock() {
            *guard = Some(body.access_token.clone());
        }
        tracing::debug!("obtained test-bank session token");
        Ok(body.access_token)
    }

    fn project_id(&self) -> Result<&str, TestBankError> {
        self.credentials
            .project_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or(TestBankError::NotConfigured)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TestBankError> {
        let token = self.bearer()?;
        let response = self
            .agent
            .get(&format!("{}{}", self.base_url, path))
            .set("Authorization", &format!("Bearer {}", token))
            .set("Accept", "application/json")
            .call();
        decode(response)
    }
}

fn decode<T: DeserializeOwned>(
    response: Result<ureq::Response, ureq::Error>,
) -> Result<T, TestBankError> {
    match response {
        Ok(resp) => resp
            .into_json()
            .map_err(|e| TestBankError::Parse(e.to_string())),
        Err(ureq::Error::Status(401, _)) => Err(TestBankError::Unauthorized),
        Err(ureq::Error::Status(403, _)) => Err(TestBankError::Forbidden),
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            Err(TestBankError::Http(format!("HTTP {}: {}", code, body)))
        }
        Err(e) => Err(TestBankError::Transport(e.to_string())),
    }
}

impl TestBankClient for QTestClient {
    fn is_configured(&self) -> bool {
        self.credentials.is_complete()
    }

    fn is_authenticated(&self) -> bool {
        self.cached_token().is_some()
    }

    fn test_connection(&self) -> bool {
        match self.get_json::<serde_json::Value>("/api/v3/projects") {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "test-bank connection probe failed");
                false
            }
        }
    }

    fn search_by_title(&self, title: &str) -> Result<Vec<TestBankMatch>, TestBankError> {
        let project_id = self.project_id()?;
        let token = self.bearer()?;
        let query = format!("'name' = '{}'", title.replace('\'', "\\'"));
        let response = self
            .agent
            .post(&format!("{}/api/v3/projects/{}/search", self.base_url, project_id))
            .set("Authorization", &format!("Bearer {}", token))
            .send_json(json!({
                "object_type": "test-cases",
                "fields": ["id", "name", "pid"],
                "query": query,
            }));
        let page: SearchPage = decode(response)?;

        Ok(page
            .items
            .into_iter()
            .map(|item| TestBankMatch {
                id: value_to_string(&item.id).unwrap_or_default(),
                name: item.name,
            })
            .filter(|m| !m.id.is_empty())
            .collect())
    }

    fn fetch_details(&self, id: &str) -> Result<TestBankDetails, TestBankError> {
        let project_id = self.project_id()?;
        let body: TestCaseBody =
            self.get_json(&format!("/api/v3/projects/{}/test-cases/{}", project_id, id))?;
        Ok(details_from_body(body))
    }
}

fn details_from_body(body: TestCaseBody) -> TestBankDetails {
    TestBankDetails {
        id: body.pid,
        assignee: property(&body.properties, ASSIGNEE_FIELDS),
        priority: property(&body.properties, PRIORITY_FIELDS),
        automation_status: property(&body.properties, AUTOMATION_FIELDS),
    }
}

/// First non-empty display value of a property with one of the given names.
fn property(properties: &[Property], names: &[&str]) -> Option<String> {
    properties
        .iter()
        .filter(|p| {
            p.field_name
                .as_deref()
                .is_some_and(|name| names.iter().any(|n| n.eq_ignore_ascii_case(name)))
        })
        .find_map(|p| {
            p.field_value_name
                .clone()
                .or_else(|| p.field_value.as_ref().and_then(value_to_string))
                .filter(|v| !v.trim().is_empty())
        })
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
