//! Thin HTTP client for the Oozie v2 job API.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

/// Errors from the Oozie REST API.
#[derive(Debug, thiserror::Error)]
pub enum OozieError {
    /// Caller-side violation: `params` tried to override a reserved key.
    #[error("params cannot contain reserved key {0:?}")]
    ReservedParam(&'static str),

    /// Network-level failure: connect error, timeout, invalid body.
    #[error("oozie request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("oozie returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

/// Client for one Oozie base URL.
pub struct OozieClient {
    base_url: String,
    http: reqwest::Client,
}

impl OozieClient {
    /// Build a client with the given HTTP timeout. Trailing slashes on the
    /// base URL are ignored.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OozieError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {base}/v2/job/{id}?show=info` returning the parsed JSON body.
    pub async fn job_info(&self, job_id: &str) -> Result<Value, OozieError> {
        let url = format!("{}/v2/job/{job_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("show", "info")])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OozieError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }

    /// `PUT {base}/v2/job/{id}?action=rerun` with an optional XML
    /// configuration body and extra query params.
    ///
    /// `params` must not contain the reserved `action` key. A 2xx response
    /// body that is not JSON yields a synthetic `{"status": "submitted"}`.
    pub async fn rerun(
        &self,
        job_id: &str,
        conf: Option<&[(String, String)]>,
        params: Option<&BTreeMap<String, String>>,
    ) -> Result<Value, OozieError> {
        if params.is_some_and(|p| p.contains_key("action")) {
            return Err(OozieError::ReservedParam("action"));
        }

        let url = format!("{}/v2/job/{job_id}", self.base_url);

        let mut query: Vec<(String, String)> = vec![("action".to_owned(), "rerun".to_owned())];
        if let Some(params) = params {
            query.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let body = conf.map(configuration_xml).unwrap_or_default();

        let resp = self
            .http
            .put(&url)
            .query(&query)
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OozieError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({"status": "submitted"})))
    }
}

/// Render property pairs as an Oozie `<configuration>` document.
fn configuration_xml(props: &[(String, String)]) -> String {
    let mut xml = String::from("<configuration>");
    for (k, v) in props {
        xml.push_str("<property><name>");
        xml.push_str(&xml_escape(k));
        xml.push_str("</name><value>");
        xml.push_str(&xml_escape(v));
        xml.push_str("</value></property>");
    }
    xml.push_str("</configuration>");
    xml
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
