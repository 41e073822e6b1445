use std::{fs::File, path::Path};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{Credentials, OcrLanguage};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    /// Base URL of the OCR server.
    #[serde(default = "default_ocr_server_url")]
    pub ocr_server_url: Url,
    /// Base URL of the media server hosting the chapters. Chapter resource
    /// locations are formed by joining the chapter's canonical path onto it.
    #[serde(default = "default_library_server_url")]
    pub library_server_url: Url,
    /// Credentials forwarded to the servers, if they require authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Language the OCR pipeline should recognize. Defaults to Japanese.
    #[serde(default)]
    pub ocr_language: OcrLanguage,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ocr_server_url: default_ocr_server_url(),
            library_server_url: default_library_server_url(),
            credentials: None,
            ocr_language: OcrLanguage::default(),
        }
    }
}

impl Settings {
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        if let Ok(file) = File::open(path) {
            Ok(serde_json::from_reader(file)?)
        } else {
            Ok(Default::default())
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;

        Ok(serde_json::to_writer_pretty(file, self)?)
    }
}

fn default_ocr_server_url() -> Url {
    Url::parse("http://127.0.0.1:8000").unwrap()
}

fn default_library_server_url() -> Url {
    Url::parse("http://127.0.0.1:4567").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();

        assert_eq!(settings.ocr_server_url, default_ocr_server_url());
        assert_eq!(settings.library_server_url, default_library_server_url());
        assert!(settings.credentials.is_none());
        assert_eq!(settings.ocr_language, OcrLanguage::Japanese);
    }

    #[test]
    fn parses_a_fully_populated_file() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "ocr_server_url": "http://ocr.local:9000/",
                "library_server_url": "http://suwayomi.local:4567/",
                "credentials": { "user": "reader", "pass": "hunter2" },
                "ocr_language": "ko"
            }"#,
        )
        .unwrap();

        assert_eq!(settings.ocr_server_url.as_str(), "http://ocr.local:9000/");
        assert_eq!(settings.ocr_language, OcrLanguage::Korean);

        let credentials = settings.credentials.unwrap();
        assert_eq!(credentials.user, "reader");
        assert_eq!(credentials.pass.as_deref(), Some("hunter2"));
    }
}
