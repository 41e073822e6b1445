use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{ChapterKey, ChapterStatus, Credentials, OcrLanguage};
use crate::settings::Settings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred while talking to the OCR server")]
    NetworkError(#[source] anyhow::Error),
}

/// The OCR server operations the status tracker depends on. Split out as a
/// trait so the tracker can be driven against a scripted double in tests.
#[async_trait]
pub trait ChapterOcrApi: Send + Sync {
    async fn chapter_status(
        &self,
        key: &ChapterKey,
        language: OcrLanguage,
    ) -> Result<ChapterStatus, Error>;

    async fn enqueue_chapter(&self, key: &ChapterKey, language: OcrLanguage) -> Result<(), Error>;

    async fn delete_chapter(
        &self,
        key: &ChapterKey,
        delete_data: bool,
        language: OcrLanguage,
    ) -> Result<(), Error>;

    async fn chapter_status_batch(
        &self,
        keys: &[ChapterKey],
        language: OcrLanguage,
    ) -> Result<HashMap<ChapterKey, ChapterStatus>, Error>;
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ChapterStatusResponse {
    Idle {
        #[serde(default, alias = "cached_count")]
        cached: usize,
        #[serde(default, alias = "total_expected")]
        total: usize,
    },
    Processing {
        #[serde(default)]
        progress: usize,
        #[serde(default)]
        total: usize,
    },
    Processed,
}

impl From<ChapterStatusResponse> for ChapterStatus {
    fn from(value: ChapterStatusResponse) -> Self {
        match value {
            ChapterStatusResponse::Idle { cached, total } => Self::Idle { cached, total },
            ChapterStatusResponse::Processing { progress, total } => {
                Self::Processing { progress, total }
            }
            ChapterStatusResponse::Processed => Self::Processed,
        }
    }
}

#[derive(Serialize)]
struct EnqueueChapterBody {
    base_url: String,
    chapter_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<String>,
    language: OcrLanguage,
}

#[derive(Serialize)]
struct DeleteChapterBody {
    base_url: String,
    delete_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<String>,
    language: OcrLanguage,
}

#[derive(Serialize)]
struct ChapterStatusBatchBody {
    chapters: Vec<ChapterStatusBatchItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<String>,
    language: OcrLanguage,
}

#[derive(Serialize)]
struct ChapterStatusBatchItem {
    base_url: String,
}

/// Snapshot returned by the OCR server's `/status` endpoint.
#[derive(Debug, Deserialize)]
pub struct ServerStatus {
    pub status: String,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub requests_processed: usize,
    #[serde(default)]
    pub items_in_cache: usize,
    #[serde(default)]
    pub active_jobs: usize,
}

#[derive(Clone)]
pub struct OcrClient {
    http: reqwest::Client,
    ocr_server_url: Url,
    library_server_url: Url,
    credentials: Option<Credentials>,
}

impl OcrClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            ocr_server_url: settings.ocr_server_url.clone(),
            library_server_url: settings.library_server_url.clone(),
            credentials: settings.credentials.clone(),
        }
    }

    /// Absolute location of the chapter on the media server; this is the
    /// `base_url` every OCR endpoint keys its bookkeeping on.
    fn chapter_base_url(&self, key: &ChapterKey) -> String {
        format!(
            "{}{}",
            self.library_server_url.as_str().trim_end_matches('/'),
            key.canonical_path()
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.ocr_server_url.as_str().trim_end_matches('/'),
            path
        )
    }

    fn user(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .map(|credentials| credentials.user.clone())
    }

    fn pass(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .and_then(|credentials| credentials.pass.clone())
    }

    pub async fn server_status(&self) -> Result<ServerStatus, Error> {
        let response = self
            .http
            .get(self.endpoint("/status"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("Failed to fetch OCR server status")
            .map_err(Error::NetworkError)?;

        response
            .json()
            .await
            .context("Failed to parse OCR server status")
            .map_err(Error::NetworkError)
    }

    pub async fn purge_cache(&self) -> Result<(), Error> {
        self.http
            .post(self.endpoint("/purge-cache"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("Failed to purge the OCR cache")
            .map_err(Error::NetworkError)?;

        Ok(())
    }
}

#[async_trait]
impl ChapterOcrApi for OcrClient {
    async fn chapter_status(
        &self,
        key: &ChapterKey,
        language: OcrLanguage,
    ) -> Result<ChapterStatus, Error> {
        let base_url = self.chapter_base_url(key);
        debug!("checking OCR status for {base_url}");

        let mut query: Vec<(&str, String)> = vec![
            ("base_url", base_url),
            ("language", language.code().to_owned()),
        ];
        if let Some(user) = self.user() {
            query.push(("user", user));
        }
        if let Some(pass) = self.pass() {
            query.push(("pass", pass));
        }

        let response = self
            .http
            .get(self.endpoint("/is-chapter-preprocessed"))
            .query(&query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("Failed to query chapter OCR status")
            .map_err(Error::NetworkError)?;

        let status: ChapterStatusResponse = response
            .json()
            .await
            .context("Failed to parse chapter OCR status")
            .map_err(Error::NetworkError)?;

        Ok(status.into())
    }

    async fn enqueue_chapter(&self, key: &ChapterKey, language: OcrLanguage) -> Result<(), Error> {
        let body = EnqueueChapterBody {
            base_url: self.chapter_base_url(key),
            chapter_path: key.canonical_path(),
            user: self.user(),
            pass: self.pass(),
            language,
        };

        self.http
            .post(self.endpoint("/preprocess-chapter"))
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("Failed to enqueue chapter for OCR")
            .map_err(Error::NetworkError)?;

        Ok(())
    }

    async fn delete_chapter(
        &self,
        key: &ChapterKey,
        delete_data: bool,
        language: OcrLanguage,
    ) -> Result<(), Error> {
        let body = DeleteChapterBody {
            base_url: self.chapter_base_url(key),
            delete_data,
            user: self.user(),
            pass: self.pass(),
            language,
        };

        self.http
            .post(self.endpoint("/delete-chapter"))
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("Failed to delete chapter OCR data")
            .map_err(Error::NetworkError)?;

        Ok(())
    }

    async fn chapter_status_batch(
        &self,
        keys: &[ChapterKey],
        language: OcrLanguage,
    ) -> Result<HashMap<ChapterKey, ChapterStatus>, Error> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        // The server keys its response on the base URLs we send, so remember
        // which chapter each one belongs to.
        let mut keys_by_base_url: HashMap<String, ChapterKey> = keys
            .iter()
            .map(|key| (self.chapter_base_url(key), key.clone()))
            .collect();

        let body = ChapterStatusBatchBody {
            chapters: keys_by_base_url
                .keys()
                .map(|base_url| ChapterStatusBatchItem {
                    base_url: base_url.clone(),
                })
                .collect(),
            user: self.user(),
            pass: self.pass(),
            language,
        };

        let response = self
            .http
            .post(self.endpoint("/is-chapters-preprocessed"))
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("Failed to query chapter OCR statuses in batch")
            .map_err(Error::NetworkError)?;

        let statuses: HashMap<String, ChapterStatusResponse> = response
            .json()
            .await
            .context("Failed to parse batch chapter OCR statuses")
            .map_err(Error::NetworkError)?;

        Ok(statuses
            .into_iter()
            .filter_map(|(base_url, status)| {
                keys_by_base_url
                    .remove(&base_url)
                    .map(|key| (key, status.into()))
            })
            .collect())
    }
}
