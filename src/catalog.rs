use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::CatalogEndpoint;
use crate::domain::GroupSlug;
use crate::error::MigrateError;
use crate::log::MigrationLog;

/// Rows requested per city search. Results past this are not fetched.
pub const SEARCH_ROWS: usize = 1000;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);
const GROUP_SHOW_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SearchPage {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub results: Vec<NamedRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupSummary {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupDetail {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<NamedRef>,
}

impl GroupDetail {
    pub fn dataset_names(&self) -> Vec<String> {
        self.packages.iter().map(|pkg| pkg.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasetRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewGroup {
    pub name: String,
    pub title: String,
    pub description: String,
}

impl NewGroup {
    pub fn for_city(city: &str) -> Self {
        Self {
            name: GroupSlug::from_city(city).as_str().to_string(),
            title: city.to_string(),
            description: format!("Datasets related to {city}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capacity {
    Public,
}

impl Capacity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capacity::Public => "public",
        }
    }
}

/// The subset of the CKAN action API the migration needs.
pub trait CatalogClient: Send + Sync {
    fn search_datasets(&self, city: &str) -> Result<SearchPage, MigrateError>;
    fn list_groups(&self) -> Result<Vec<GroupSummary>, MigrateError>;
    /// Group detail with member datasets and no other optional fields.
    fn show_group(&self, name: &str) -> Result<GroupDetail, MigrateError>;
    fn find_group(&self, slug: &GroupSlug) -> Result<GroupSummary, MigrateError>;
    fn create_group(&self, group: &NewGroup) -> Result<GroupSummary, MigrateError>;
    fn show_dataset(&self, name: &str) -> Result<DatasetRef, MigrateError>;
    fn create_membership(
        &self,
        group: &GroupSlug,
        dataset_id: &str,
        capacity: Capacity,
    ) -> Result<(), MigrateError>;
    /// Replaces the dataset's whole tag list.
    fn patch_dataset_tags(&self, dataset: &str, tags: &[String]) -> Result<(), MigrateError>;
    fn list_tags(&self) -> Result<Vec<String>, MigrateError>;
    fn delete_tag(&self, tag: &str) -> Result<(), MigrateError>;
}

/// Dataset names tagged with `city`. Failures are logged as warnings and
/// yield an empty list.
pub fn datasets_for_city(
    client: &dyn CatalogClient,
    city: &str,
    log: &dyn MigrationLog,
) -> Vec<String> {
    match client.search_datasets(city) {
        Ok(page) => {
            let names = page
                .results
                .into_iter()
                .map(|pkg| pkg.name)
                .collect::<Vec<_>>();
            if page.count > names.len() {
                log.warn(&format!(
                    "Search for city '{city}' matched {} datasets but only {} were fetched",
                    page.count,
                    names.len()
                ));
            }
            log.info(&format!("Found {} datasets for city '{city}'", names.len()));
            names
        }
        Err(err) => {
            log.warn(&format!("Search failed for city '{city}': {err}"));
            Vec::new()
        }
    }
}

#[derive(Clone)]
pub struct CkanHttpClient {
    client: Client,
    endpoint: CatalogEndpoint,
}

impl CkanHttpClient {
    pub fn new(endpoint: &CatalogEndpoint) -> Result<Self, MigrateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ckan-migrator/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MigrateError::CatalogHttp(err.to_string()))?,
        );
        if let Some(api_key) = &endpoint.api_key {
            let mut value = HeaderValue::from_str(api_key)
                .map_err(|err| MigrateError::ConfigParse(format!("invalid API key: {err}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!endpoint.verify_tls)
            .timeout(None)
            .build()
            .map_err(|err| MigrateError::CatalogHttp(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.clone(),
        })
    }

    fn get_action<T: DeserializeOwned>(
        &self,
        action: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, MigrateError> {
        let url = self.endpoint.action_url(action);
        let response =
            self.send_with_retries(|| self.client.get(&url).query(query).timeout(timeout))?;
        decode_result(read_envelope(response)?)
    }

    fn post_action(&self, action: &str, body: &Value) -> Result<Value, MigrateError> {
        let url = self.endpoint.action_url(action);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|err| MigrateError::CatalogHttp(err.to_string()))?;
        read_envelope(response)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, MigrateError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
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
                    return Err(MigrateError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl CatalogClient for CkanHttpClient {
    fn search_datasets(&self, city: &str) -> Result<SearchPage, MigrateError> {
        self.get_action("package_search", &search_query(city), SEARCH_TIMEOUT)
    }

    fn list_groups(&self) -> Result<Vec<GroupSummary>, MigrateError> {
        let query = [("all_fields", "true".to_string())];
        self.get_action("group_list", &query, SEARCH_TIMEOUT)
    }

    fn show_group(&self, name: &str) -> Result<GroupDetail, MigrateError> {
        self.get_action("group_show", &group_show_query(name), GROUP_SHOW_TIMEOUT)
    }

    fn find_group(&self, slug: &GroupSlug) -> Result<GroupSummary, MigrateError> {
        let query = [
            ("id", slug.as_str().to_string()),
            ("include_datasets", "false".to_string()),
        ];
        self.get_action("group_show", &query, GROUP_SHOW_TIMEOUT)
    }

    fn create_group(&self, group: &NewGroup) -> Result<GroupSummary, MigrateError> {
        let body = serde_json::to_value(group)
            .map_err(|err| MigrateError::MalformedResponse(err.to_string()))?;
        decode_result(self.post_action("group_create", &body)?)
    }

    fn show_dataset(&self, name: &str) -> Result<DatasetRef, MigrateError> {
        let url = self.endpoint.action_url("package_show");
        let response = self
            .client
            .get(&url)
            .query(&[("id", name)])
            .send()
            .map_err(|err| MigrateError::CatalogHttp(err.to_string()))?;
        decode_result(read_envelope(response)?)
    }

    fn create_membership(
        &self,
        group: &GroupSlug,
        dataset_id: &str,
        capacity: Capacity,
    ) -> Result<(), MigrateError> {
        self.post_action("member_create", &membership_body(group, dataset_id, capacity))
            .map(|_| ())
    }

    fn patch_dataset_tags(&self, dataset: &str, tags: &[String]) -> Result<(), MigrateError> {
        self.post_action("package_patch", &tag_patch_body(dataset, tags))
            .map(|_| ())
    }

    fn list_tags(&self) -> Result<Vec<String>, MigrateError> {
        self.get_action("tag_list", &[], SEARCH_TIMEOUT)
    }

    fn delete_tag(&self, tag: &str) -> Result<(), MigrateError> {
        self.post_action("tag_delete", &json!({ "id": tag }))
            .map(|_| ())
    }
}

/// `group_show` flags for export: members on, every other optional field off.
const GROUP_MEMBERSHIP_FLAGS: [(&str, bool); 7] = [
    ("include_dataset_count", true),
    ("include_datasets", true),
    ("include_extras", false),
    ("include_users", false),
    ("include_groups", false),
    ("include_tags", false),
    ("include_followers", false),
];

pub fn search_query(city: &str) -> Vec<(&'static str, String)> {
    vec![("q", city_query(city)), ("rows", SEARCH_ROWS.to_string())]
}

pub fn group_show_query(name: &str) -> Vec<(&'static str, String)> {
    let mut query = vec![("id", name.to_string())];
    query.extend(
        GROUP_MEMBERSHIP_FLAGS
            .iter()
            .map(|(flag, on)| (*flag, on.to_string())),
    );
    query
}

pub fn membership_body(group: &GroupSlug, dataset_id: &str, capacity: Capacity) -> Value {
    json!({
        "id": group.as_str(),
        "object": dataset_id,
        "object_type": "package",
        "capacity": capacity.as_str(),
    })
}

pub fn city_query(city: &str) -> String {
    format!("city:\"{}\"", city.replace('"', "\\\""))
}

pub fn tag_patch_body(dataset: &str, tags: &[String]) -> Value {
    let tags = tags
        .iter()
        .map(|tag| json!({ "name": tag }))
        .collect::<Vec<_>>();
    json!({ "id": dataset, "tags": tags })
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

fn read_envelope(response: Response) -> Result<Value, MigrateError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .map_err(|err| MigrateError::CatalogHttp(err.to_string()))?;
    parse_envelope(status, &body)
}

/// Unwraps a CKAN action response. API error bodies are mapped to their
/// category even when they arrive with a 4xx status.
pub fn parse_envelope(status: u16, body: &str) -> Result<Value, MigrateError> {
    let is_success = (200..300).contains(&status);
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            if is_success {
                return Err(MigrateError::MalformedResponse(err.to_string()));
            }
            return Err(MigrateError::CatalogStatus {
                status,
                message: truncate(body, 200),
            });
        }
    };

    if envelope.success {
        return Ok(envelope.result.unwrap_or(Value::Null));
    }
    if let Some(error) = envelope.error {
        return Err(MigrateError::from_api_error(&error));
    }
    if !is_success {
        return Err(MigrateError::CatalogStatus {
            status,
            message: truncate(body, 200),
        });
    }
    Err(MigrateError::MalformedResponse(
        "response reported failure without an error object".to_string(),
    ))
}

fn decode_result<T: DeserializeOwned>(value: Value) -> Result<T, MigrateError> {
    serde_json::from_value(value).map_err(|err| MigrateError::MalformedResponse(err.to_string()))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut = text.chars().take(max_chars).collect::<String>();
    cut.push_str("...");
    cut
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
