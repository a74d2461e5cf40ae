//! Rate-limited, retry-bounded HTTP client exposing the four upstream
//! operations of spec §4.3, plus `monthly_report`.
//!
//! Retry/backoff loop is grounded on
//! `keeper-rs/src/scanner.rs::fetch_logs_with_retries`; the JSON
//! request/response plumbing on `aa-rs/src/paymaster.rs::rpc`.

use super::ratelimit::RateGate;
use super::shapes::{check_status_field, extract_blob_list, unwrap_quoted_json};
use crate::domain::{DocType, Role};
use crate::errors::UpstreamError;
use base64::Engine;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const RETRY_COUNT: u32 = 2;
const RETRY_BACKOFF_FACTOR_MS: u64 = 500;
const RATE_LIMIT_DELAY: Duration = Duration::from_millis(2000);
const RATE_LIMIT_DELAY_RECOVERY: Duration = Duration::from_millis(2100);
const EVENTS_PAGE_SIZE: u32 = 50;
const NOT_FOUND_EVENTS_MARKER: &str = "Eventos n\u{e3}o encontrados!";
const EMPTY_REPORT_MARKER: &str = "Nenhum arquivo xml encontrado";

#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimeouts {
    pub connect: Duration,
    pub read_nfe: Duration,
    pub read_cte: Duration,
    pub absolute_nfe: Duration,
    pub absolute_cte: Duration,
}

impl UpstreamTimeouts {
    pub fn from_env() -> Self {
        let secs = |key: &str, default: u64| -> Duration {
            Duration::from_secs(
                std::env::var(key)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default),
            )
        };
        Self {
            connect: secs("SIEG_TIMEOUT_CONEXAO", 10),
            read_nfe: secs("SIEG_TIMEOUT_LEITURA_NFE", 120),
            read_cte: secs("SIEG_TIMEOUT_LEITURA_CTE", 180),
            absolute_nfe: secs("SIEG_TIMEOUT_ABSOLUTO_NFE", 90),
            absolute_cte: secs("SIEG_TIMEOUT_ABSOLUTO_CTE", 180),
        }
    }

    fn read_for(&self, doc_type: DocType) -> Duration {
        match doc_type {
            DocType::NFe => self.read_nfe,
            DocType::CTe => self.read_cte,
        }
    }

    fn absolute_for(&self, doc_type: DocType) -> Duration {
        match doc_type {
            DocType::NFe => self.absolute_nfe,
            DocType::CTe => self.absolute_cte,
        }
    }
}

pub struct BatchFilter {
    pub company_id: String,
    pub doc_type: DocType,
    pub role: Role,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub skip: u32,
    pub take: u32,
}

pub struct EventsFilter {
    pub company_id: String,
    pub doc_type: DocType,
    pub role: Role,
    pub event_type: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct MonthlyReportResult {
    pub report_base64: Option<String>,
    pub empty: bool,
    pub status_msg: Option<String>,
    pub error_msg: Option<String>,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeouts: UpstreamTimeouts,
    rate_gate: RateGate,
    recovery_rate_gate: RateGate,
}

impl UpstreamClient {
    pub fn new(base_url: String, api_key_percent_encoded: &str, timeouts: UpstreamTimeouts) -> Self {
        // The key arrives percent-encoded (as it would from a URL or env
        // var copy-paste); decode once here, re-encode per request via
        // reqwest's query serializer, per spec §6.
        let api_key = percent_decode(api_key_percent_encoded);
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(timeouts.connect)
                .build()
                .expect("failed to build reqwest client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeouts,
            rate_gate: RateGate::new(RATE_LIMIT_DELAY),
            recovery_rate_gate: RateGate::new(RATE_LIMIT_DELAY_RECOVERY),
        }
    }

    #[instrument(skip(self, filter))]
    pub async fn count(&self, filter: &BatchFilter) -> Result<u64, UpstreamError> {
        self.rate_gate.wait().await;
        let body = count_body(filter);
        let url = format!("{}/api/v1/xmls/count", self.base_url);
        let key = self.api_key.clone();
        let http = self.http.clone();
        let read_timeout = self.timeouts.read_for(filter.doc_type);
        let absolute = self.timeouts.absolute_for(filter.doc_type);

        let value = with_deadline(absolute, async move {
            request_json(&http, &key, &url, Some(body), read_timeout).await
        })
        .await?;

        let value = unwrap_quoted_json(value)?;
        value
            .get("Total")
            .and_then(Value::as_u64)
            .or_else(|| value.as_u64())
            .ok_or_else(|| UpstreamError::Decode("missing Total in count response".into()))
    }

    #[instrument(skip(self, filter))]
    pub async fn batch_download(&self, filter: &BatchFilter) -> Result<Vec<String>, UpstreamError> {
        self.rate_gate.wait().await;
        let body = batch_body(filter);
        let url = format!("{}/api/v1/xmls/download", self.base_url);
        let key = self.api_key.clone();
        let http = self.http.clone();
        let read_timeout = self.timeouts.read_for(filter.doc_type);
        let absolute = self.timeouts.absolute_for(filter.doc_type);

        let value = with_deadline(absolute, async move {
            retry(|| request_json(&http, &key, &url, Some(body.clone()), read_timeout)).await
        })
        .await?;

        extract_blob_list(value)
    }

    /// Fetches a single document by key. Falls back to `include_events =
    /// false` if the server rejects `include_events = true` with HTTP 400
    /// (spec §4.3 mandatory fallback).
    #[instrument(skip(self))]
    pub async fn get_one(
        &self,
        key: &str,
        doc_type: DocType,
        include_events: bool,
    ) -> Result<Option<Vec<u8>>, UpstreamError> {
        self.recovery_rate_gate.wait().await;
        let read_timeout = self.timeouts.read_for(doc_type);
        let absolute = self.timeouts.absolute_for(doc_type);

        match self
            .get_one_attempt(key, doc_type, include_events, read_timeout, absolute)
            .await
        {
            Err(UpstreamError::Http { status: 400 }) if include_events => {
                warn!(key, "include_events=true rejected with HTTP 400; retrying without events");
                self.get_one_attempt(key, doc_type, false, read_timeout, absolute)
                    .await
            }
            other => other,
        }
    }

    async fn get_one_attempt(
        &self,
        key: &str,
        doc_type: DocType,
        include_events: bool,
        read_timeout: Duration,
        absolute: Duration,
    ) -> Result<Option<Vec<u8>>, UpstreamError> {
        let url = format!(
            "{}/api/v1/xmls/single?xmlType={}&downloadEvent={}&api_key={}",
            self.base_url,
            doc_type.xml_type_code(),
            include_events,
            self.api_key,
        );
        let key_body = key.to_string();
        let http = self.http.clone();

        let value = with_deadline(absolute, async move {
            retry(|| request_json_body_text(&http, &url, &key_body, read_timeout)).await
        })
        .await?;

        let value = unwrap_quoted_json(value)?;
        match value {
            Value::Null => Ok(None),
            Value::String(s) if s.is_empty() => Ok(None),
            Value::String(s) => Ok(Some(
                base64::engine::general_purpose::STANDARD.decode(s.trim()).map_err(|e| UpstreamError::Decode(e.to_string()))?,
            )),
            Value::Object(obj) => {
                check_status_field(&obj)?;
                match obj.get("xml").or_else(|| obj.get("Xml")).and_then(Value::as_str) {
                    Some(s) => Ok(Some(
                        base64::engine::general_purpose::STANDARD.decode(s.trim()).map_err(|e| UpstreamError::Decode(e.to_string()))?,
                    )),
                    None => Ok(None),
                }
            }
            other => Err(UpstreamError::Decode(format!(
                "unexpected single-xml response shape: {other}"
            ))),
        }
    }

    #[instrument(skip(self, filter))]
    pub async fn events_download(&self, filter: &EventsFilter) -> Result<Vec<String>, UpstreamError> {
        let mut all = Vec::new();
        let mut skip = 0u32;
        loop {
            self.rate_gate.wait().await;
            let url = format!(
                "{}/api/v1/xmls/events?api_key={}&XmlType={}&{}={}&TipoEvento={}&DataInicio={}&DataFim={}&Skip={}&Take={}",
                self.base_url,
                self.api_key,
                filter.doc_type.xml_type_code(),
                filter.role.upstream_field(),
                filter.company_id,
                filter.event_type,
                filter.date_start,
                filter.date_end,
                skip,
                EVENTS_PAGE_SIZE,
            );
            let http = self.http.clone();
            let read_timeout = self.timeouts.read_for(filter.doc_type);
            let absolute = self.timeouts.absolute_for(filter.doc_type);

            let page = with_deadline(absolute, async move {
                retry(|| request_json(&http, "", &url, None, read_timeout)).await
            })
            .await;

            let page = match page {
                Err(UpstreamError::ApiError { message }) if message.contains(NOT_FOUND_EVENTS_MARKER) => {
                    break;
                }
                Err(UpstreamError::Http { status: 404 }) => break,
                Err(e) => return Err(e),
                Ok(v) => v,
            };

            let blobs = extract_blob_list(page)?;
            let got = blobs.len() as u32;
            all.extend(blobs);
            if got < EVENTS_PAGE_SIZE {
                break;
            }
            skip += EVENTS_PAGE_SIZE;
        }
        Ok(all)
    }

    /// Downloads the authoritative monthly manifest report. This call uses
    /// dedicated timeouts and deliberately skips both the retry loop and
    /// the absolute-deadline wrapper (spec §4.3, §9 asymmetry note) because
    /// the operation is inherently slow.
    #[instrument(skip(self))]
    pub async fn monthly_report(
        &self,
        company_id: &str,
        doc_type: DocType,
        month: u32,
        year: i32,
        report_kind: Option<u8>,
    ) -> Result<MonthlyReportResult, UpstreamError> {
        self.rate_gate.wait().await;
        let kind = report_kind.unwrap_or_else(|| doc_type.xml_type_code());
        let body = json!({
            "Cnpj": company_id,
            "TypeXmlDownloadReport": kind,
            "XmlType": doc_type.xml_type_code(),
            "Month": month,
            "Year": year,
        });
        let url = format!("{}/api/v1/xmls/report", self.base_url);

        let read_timeout = self.timeouts.read_for(doc_type);
        let resp = self
            .http
            .post(&url)
            .timeout(read_timeout)
            .query(&[("api_key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if text.contains(EMPTY_REPORT_MARKER) {
            return Ok(MonthlyReportResult {
                empty: true,
                ..Default::default()
            });
        }

        if !status.is_success() {
            return Err(UpstreamError::Http {
                status: status.as_u16(),
            });
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let value = unwrap_quoted_json(value)?;

        match value {
            Value::String(report) if !report.is_empty() => Ok(MonthlyReportResult {
                report_base64: Some(report),
                ..Default::default()
            }),
            Value::Object(obj) => {
                check_status_field(&obj)?;
                let report_base64 = obj
                    .get("Relatorio")
                    .or_else(|| obj.get("report"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let status_msg = obj.get("StatusMsg").and_then(Value::as_str).map(str::to_string);
                let error_msg = obj.get("ErrorMsg").and_then(Value::as_str).map(str::to_string);
                Ok(MonthlyReportResult {
                    empty: report_base64.is_none(),
                    report_base64,
                    status_msg,
                    error_msg,
                })
            }
            _ => Ok(MonthlyReportResult {
                empty: true,
                ..Default::default()
            }),
        }
    }
}

/// Builds the shared `{XmlType, <role field>, DataEmissaoInicio, DataEmissaoFim, ...}`
/// request body. `json!` can't take a non-literal key, so the role field is
/// inserted after the fact.
fn batch_body(filter: &BatchFilter) -> Value {
    let mut body = json!({
        "XmlType": filter.doc_type.xml_type_code(),
        "DataEmissaoInicio": filter.date_start.to_string(),
        "DataEmissaoFim": filter.date_end.to_string(),
        "Skip": filter.skip,
        "Take": filter.take,
        "DownloadEvent": false,
    });
    body.as_object_mut()
        .expect("json! object")
        .insert(filter.role.upstream_field().to_string(), json!(filter.company_id));
    body
}

fn count_body(filter: &BatchFilter) -> Value {
    let mut body = json!({
        "XmlType": filter.doc_type.xml_type_code(),
        "DataEmissaoInicio": filter.date_start.to_string(),
        "DataEmissaoFim": filter.date_end.to_string(),
    });
    body.as_object_mut()
        .expect("json! object")
        .insert(filter.role.upstream_field().to_string(), json!(filter.company_id));
    body
}

fn percent_decode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                out.push(byte as char);
                continue;
            }
            out.push('%');
            out.push_str(&hex);
        } else {
            out.push(c);
        }
    }
    out
}

async fn request_json(
    http: &reqwest::Client,
    api_key: &str,
    url: &str,
    body: Option<Value>,
    read_timeout: Duration,
) -> Result<Value, UpstreamError> {
    let mut req = if let Some(body) = body {
        http.post(url).json(&body)
    } else {
        http.get(url)
    };
    req = req.timeout(read_timeout);
    if !api_key.is_empty() {
        req = req.query(&[("api_key", api_key)]);
    }

    let resp = req.send().await?;
    let status = resp.status();
    if status.as_u16() == 400 {
        return Err(UpstreamError::Http { status: 400 });
    }
    if !status.is_success() {
        return Err(UpstreamError::Http {
            status: status.as_u16(),
        });
    }
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| UpstreamError::Decode(e.to_string()))
}

async fn request_json_body_text(
    http: &reqwest::Client,
    url: &str,
    body_text: &str,
    read_timeout: Duration,
) -> Result<Value, UpstreamError> {
    let resp = http
        .post(url)
        .timeout(read_timeout)
        .body(body_text.to_string())
        .send()
        .await?;
    let status = resp.status();
    if status.as_u16() == 400 {
        return Err(UpstreamError::Http { status: 400 });
    }
    if !status.is_success() {
        return Err(UpstreamError::Http {
            status: status.as_u16(),
        });
    }
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| UpstreamError::Decode(e.to_string()))
}

/// Retries on network errors and the documented retryable HTTP statuses,
/// with exponential backoff (factor 0.5s, up to `RETRY_COUNT` retries).
async fn retry<F, Fut>(mut call: F) -> Result<Value, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, UpstreamError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(UpstreamError::Http { status }) if RETRYABLE_STATUSES.contains(&status) => {
                if attempt >= RETRY_COUNT {
                    return Err(UpstreamError::Http { status });
                }
            }
            Err(UpstreamError::Network(e)) => {
                if attempt >= RETRY_COUNT {
                    return Err(UpstreamError::Network(e));
                }
            }
            Err(e) => return Err(e),
        }
        let delay_ms = RETRY_BACKOFF_FACTOR_MS * (1u64 << attempt);
        debug!(attempt, delay_ms, "retrying upstream call");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        attempt += 1;
    }
}

/// Runs `fut` on a worker task and abandons it if `deadline` fires first.
/// The worker task is not cancelled; it is left to complete (or not) on its
/// own, and its eventual result is discarded (spec §9 "threaded timeout
/// guard").
async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(fut);
    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(_join_error)) => Err(UpstreamError::Decode("worker task panicked".into())),
        Err(_elapsed) => Err(UpstreamError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decode_roundtrip() {
        assert_eq!(percent_decode("abc%2Bdef"), "abc+def");
        assert_eq!(percent_decode("plain"), "plain");
    }
}
