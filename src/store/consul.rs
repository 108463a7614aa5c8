use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ConsulConfig;
use crate::error::{Result, SchedulerError};
use crate::store::{CoordinationStore, KvPair, QueryMeta, QueryOptions};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Extra time granted to a blocking query on top of its wait. Consul adds up
/// to wait/16 of jitter before answering.
const BLOCKING_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    value: Option<String>,
    session: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
    lock_delay: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// Coordination store backed by the Consul HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulStore {
    client: reqwest::Client,
    config: ConsulConfig,
}

impl ConsulStore {
    pub fn new(config: ConsulConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/v1/{}",
            self.config.address.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut req = self.client.request(method, url);
        if let Some(ref token) = self.config.token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(ref dc) = self.config.datacenter {
            req = req.query(&[("dc", dc)]);
        }
        req
    }

    async fn entries(&self, key: &str, recurse: bool) -> Result<Vec<KvEntry>> {
        let mut req = self.request(Method::GET, &format!("kv/{}", key));
        if recurse {
            req = req.query(&[("recurse", "true")]);
        }
        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn expect_bool(resp: Response) -> Result<bool> {
        Ok(resp.error_for_status()?.json::<bool>().await?)
    }
}

fn decode_value(entry: &KvEntry) -> Result<String> {
    let Some(ref encoded) = entry.value else {
        return Ok(String::new());
    };
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SchedulerError::Encoding {
            key: entry.key.clone(),
            reason: e.to_string(),
        })?;
    // Invalid UTF-8 sequences decode to U+FFFD
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_index(resp: &Response) -> Result<u64> {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| SchedulerError::store("keys query", "missing or invalid X-Consul-Index header"))
}

#[async_trait]
impl CoordinationStore for ConsulStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entries(key, false).await?.first() {
            Some(entry) => Ok(Some(decode_value(entry)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let mut pairs = Vec::new();
        for entry in self.entries(prefix, true).await? {
            let value = decode_value(&entry)?;
            pairs.push(KvPair {
                key: entry.key,
                value,
            });
        }
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    async fn keys(
        &self,
        prefix: &str,
        separator: Option<&str>,
        opts: &QueryOptions,
    ) -> Result<(Vec<String>, QueryMeta)> {
        let mut req = self
            .request(Method::GET, &format!("kv/{}", prefix))
            .query(&[("keys", "")]);
        if let Some(sep) = separator {
            req = req.query(&[("separator", sep)]);
        }
        if opts.wait_index > 0 {
            req = req.query(&[("index", opts.wait_index.to_string())]);
            if let Some(wait) = opts.wait_time {
                req = req
                    .query(&[("wait", format!("{}ms", wait.as_millis()))])
                    .timeout(wait + BLOCKING_SLACK);
            }
        }

        let resp = req.send().await?;
        let last_index = parse_index(&resp)?.max(1);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), QueryMeta { last_index }));
        }
        let keys: Vec<String> = resp.error_for_status()?.json().await?;
        Ok((keys, QueryMeta { last_index }))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let resp = self
            .request(Method::PUT, &format!("kv/{}", key))
            .body(value.to_string())
            .send()
            .await?;
        if !Self::expect_bool(resp).await? {
            return Err(SchedulerError::store(format!("put {}", key), "rejected"));
        }
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        self.request(Method::DELETE, &format!("kv/{}", prefix))
            .query(&[("recurse", "true")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn create_session(&self, ttl: Duration) -> Result<String> {
        let body = SessionRequest {
            name: "action-scheduler",
            ttl: format!("{}s", ttl.as_secs().max(10)),
            behavior: "release",
            lock_delay: "0s",
        };
        let created: SessionCreated = self
            .request(Method::PUT, "session/create")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.id)
    }

    async fn renew_session(&self, session: &str) -> Result<()> {
        let resp = self
            .request(Method::PUT, &format!("session/renew/{}", session))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SchedulerError::SessionLost(session.to_string()));
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn destroy_session(&self, session: &str) -> Result<()> {
        self.request(Method::PUT, &format!("session/destroy/{}", session))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, session: &str) -> Result<bool> {
        let resp = self
            .request(Method::PUT, &format!("kv/{}", key))
            .query(&[("acquire", session)])
            .send()
            .await?;
        // Consul answers 500 "invalid session" for an expired session
        if resp.status() == StatusCode::INTERNAL_SERVER_ERROR {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("invalid session") {
                return Err(SchedulerError::SessionLost(session.to_string()));
            }
            return Err(SchedulerError::store(format!("acquire {}", key), body));
        }
        Self::expect_bool(resp).await
    }

    async fn release_lock(&self, key: &str, session: &str) -> Result<bool> {
        let resp = self
            .request(Method::PUT, &format!("kv/{}", key))
            .query(&[("release", session)])
            .send()
            .await?;
        Self::expect_bool(resp).await
    }

    async fn lock_holder(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries(key, false)
            .await?
            .into_iter()
            .next()
            .and_then(|e| e.session))
    }
}
