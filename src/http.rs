//! HTTP client abstraction.
//!
//! The transport only needs "GET this URL with these query parameters and
//! give me the body". Anything that can do that implements `HttpClient`;
//! `ReqwestClient` is the blocking implementation used by default.

use crate::config::TransportConfig;
use crate::error::{RestCacheError, Result};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// One GET request against a feature service.
#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub url: &'a str,
    pub params: &'a [(String, String)],
    /// Skip certificate verification for this request.
    pub relax_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Failure below the HTTP response level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// Connection, timeout or protocol failure.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The server certificate was rejected.
    #[error("certificate rejected: {0}")]
    Certificate(String),
}

pub trait HttpClient {
    /// Issue a GET request and return the raw response.
    fn get(&self, request: &HttpRequest<'_>) -> std::result::Result<HttpResponse, HttpError>;
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn get(&self, request: &HttpRequest<'_>) -> std::result::Result<HttpResponse, HttpError> {
        (**self).get(request)
    }
}

impl<C: HttpClient + ?Sized> HttpClient for &C {
    fn get(&self, request: &HttpRequest<'_>) -> std::result::Result<HttpResponse, HttpError> {
        (**self).get(request)
    }
}

/// Blocking `reqwest` client.
///
/// The relaxed client is only built when the configuration opts into the
/// insecure TLS fallback.
pub struct ReqwestClient {
    strict: reqwest::blocking::Client,
    relaxed: Option<reqwest::blocking::Client>,
}

impl fmt::Debug for ReqwestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestClient")
            .field("tls_fallback", &self.relaxed.is_some())
            .finish()
    }
}

impl ReqwestClient {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let strict = Self::build_client(config, false)?;
        let relaxed = if config.allow_insecure_tls_fallback {
            Some(Self::build_client(config, true)?)
        } else {
            None
        };
        Ok(Self { strict, relaxed })
    }

    fn build_client(
        config: &TransportConfig,
        accept_invalid_certs: bool,
    ) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| RestCacheError::Http(format!("failed to build HTTP client: {e}")))
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, request: &HttpRequest<'_>) -> std::result::Result<HttpResponse, HttpError> {
        let client = match (&self.relaxed, request.relax_tls) {
            (Some(relaxed), true) => relaxed,
            _ => &self.strict,
        };

        let response = client
            .get(request.url)
            .query(request.params)
            .send()
            .map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| HttpError::Connection(format!("failed to read response body: {e}")))?;

        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> HttpError {
    if is_certificate_error(&err) {
        HttpError::Certificate(err.to_string())
    } else {
        HttpError::Connection(err.to_string())
    }
}

// reqwest does not expose TLS failures as a kind, so walk the source chain.
fn is_certificate_error(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.to_string().to_ascii_lowercase().contains("certificate") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Scripted stand-in for an Esri feature service.
#[cfg(test)]
pub(crate) mod testing {
    use super::{HttpClient, HttpError, HttpRequest, HttpResponse};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub(crate) const SERVICE_URL: &str = "https://example.com/arcgis/rest/services/Parcels/FeatureServer/0";

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedRequest {
        pub url: String,
        pub params: HashMap<String, String>,
    }

    impl RecordedRequest {
        pub fn is_count(&self) -> bool {
            self.params.get("returnCountOnly").map(String::as_str) == Some("true")
        }

        pub fn is_page(&self) -> bool {
            self.params.get("returnCountOnly").map(String::as_str) == Some("false")
        }
    }

    #[derive(Default)]
    struct FakeState {
        requests: Vec<RecordedRequest>,
        unreachable: bool,
        queries_unreachable: bool,
        queries_before_outage: Option<usize>,
        queries_served: usize,
    }

    pub(crate) struct FakeFeatureService {
        metadata: Value,
        records: HashMap<String, Vec<Value>>,
        max_record_count: usize,
        paginate: bool,
        ignore_offsets: bool,
        state: Mutex<FakeState>,
    }

    impl FakeFeatureService {
        pub fn new(metadata: Value) -> Self {
            let max_record_count = metadata
                .get("maxRecordCount")
                .and_then(Value::as_u64)
                .unwrap_or(1000) as usize;
            let paginate = metadata
                .pointer("/advancedQueryCapabilities/supportsPagination")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Self {
                metadata,
                records: HashMap::new(),
                max_record_count,
                paginate,
                ignore_offsets: false,
                state: Mutex::new(FakeState::default()),
            }
        }

        /// Point layer with `name` (string), `height` (double) and `surveyed` (date).
        pub fn points(max_record_count: u32, paginate: bool) -> Self {
            Self::new(point_metadata(max_record_count, paginate))
        }

        pub fn with_records(mut self, filter: &str, records: Vec<Value>) -> Self {
            self.records.insert(filter.to_string(), records);
            self
        }

        /// Advertise pagination but always serve the first page.
        pub fn with_offsets_ignored(mut self) -> Self {
            self.ignore_offsets = true;
            self
        }

        pub fn set_unreachable(&self, unreachable: bool) {
            self.state.lock().unwrap().unreachable = unreachable;
        }

        /// Every `/query` request fails while metadata keeps working.
        pub fn set_queries_unreachable(&self, unreachable: bool) {
            self.state.lock().unwrap().queries_unreachable = unreachable;
        }

        /// Serve `n` query requests, then fail all of the following ones.
        pub fn fail_queries_after(&self, n: usize) {
            self.state.lock().unwrap().queries_before_outage = Some(n);
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.state.lock().unwrap().requests.clone()
        }

        pub fn page_requests(&self) -> Vec<RecordedRequest> {
            self.requests().into_iter().filter(|r| r.is_page()).collect()
        }

        fn respond(&self, url: &str, params: &HashMap<String, String>) -> Value {
            if !url.ends_with("/query") {
                return self.metadata.clone();
            }

            let filter = params.get("where").map(String::as_str).unwrap_or("1=1");
            let records = self.records.get(filter).cloned().unwrap_or_default();
            if params.get("returnCountOnly").map(String::as_str) == Some("true") {
                return json!({ "count": records.len() });
            }

            let offset = if self.paginate && !self.ignore_offsets {
                params
                    .get("resultOffset")
                    .and_then(|o| o.parse::<usize>().ok())
                    .unwrap_or(0)
            } else {
                0
            };
            let page: Vec<Value> = records
                .iter()
                .skip(offset)
                .take(self.max_record_count)
                .cloned()
                .collect();
            let exceeded = offset + page.len() < records.len();
            json!({
                "objectIdFieldName": "OBJECTID",
                "geometryType": self.metadata["geometryType"],
                "features": page,
                "exceededTransferLimit": exceeded,
            })
        }
    }

    impl HttpClient for FakeFeatureService {
        fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError> {
            let params: HashMap<String, String> = request.params.iter().cloned().collect();
            let mut state = self.state.lock().unwrap();
            state.requests.push(RecordedRequest {
                url: request.url.to_string(),
                params: params.clone(),
            });

            if state.unreachable {
                return Err(HttpError::Connection("connection refused".to_string()));
            }
            if request.url.ends_with("/query") {
                if state.queries_unreachable {
                    return Err(HttpError::Connection("connection reset".to_string()));
                }
                if let Some(limit) = state.queries_before_outage {
                    if state.queries_served >= limit {
                        return Err(HttpError::Connection("connection reset".to_string()));
                    }
                }
                state.queries_served += 1;
            }
            drop(state);

            Ok(HttpResponse {
                status: 200,
                body: self.respond(request.url, &params).to_string(),
            })
        }
    }

    pub(crate) fn point_metadata(max_record_count: u32, paginate: bool) -> Value {
        json!({
            "name": "Survey Points 2020",
            "geometryType": "esriGeometryPoint",
            "extent": {
                "xmin": 0.0, "ymin": 0.0, "xmax": 10.0, "ymax": 10.0,
                "spatialReference": { "wkid": 4326 }
            },
            "fields": [
                { "name": "OBJECTID", "type": "esriFieldTypeOID", "alias": "OBJECTID" },
                { "name": "Shape", "type": "esriFieldTypeGeometry" },
                { "name": "name", "type": "esriFieldTypeString", "length": 50 },
                { "name": "height", "type": "esriFieldTypeDouble" },
                { "name": "surveyed", "type": "esriFieldTypeDate", "length": 8 },
                { "name": "GlobalID", "type": "esriFieldTypeGlobalID", "length": 38 }
            ],
            "maxRecordCount": max_record_count,
            "advancedQueryCapabilities": { "supportsPagination": paginate }
        })
    }

    pub(crate) fn point_record(id: i64, x: f64, y: f64, name: &str) -> Value {
        json!({
            "geometry": { "x": x, "y": y },
            "attributes": {
                "OBJECTID": id,
                "name": name,
                "height": id as f64 * 1.5,
                "surveyed": 1_589_704_200_000_i64 + id * 1000,
                "GlobalID": format!("{{0000000{id}-0000-0000-0000-000000000000}}")
            }
        })
    }
}
