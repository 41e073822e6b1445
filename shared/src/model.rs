use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct MangaId {
    manga_id: String,
}

impl MangaId {
    pub fn new(value: String) -> Self {
        Self { manga_id: value }
    }

    pub fn value(&self) -> &String {
        &self.manga_id
    }
}

/// Identifies a single chapter across the tracker and the wire. The canonical
/// path form doubles as the chapter's base resource path on the media server,
/// so it has to stay exactly `/manga/{mangaId}/chapter/{sourceOrder}`.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ChapterKey {
    manga_id: MangaId,
    source_order: u64,
}

impl ChapterKey {
    pub fn new(manga_id: MangaId, source_order: u64) -> Self {
        Self {
            manga_id,
            source_order,
        }
    }

    pub fn from_parts(manga_id: String, source_order: u64) -> Self {
        Self::new(MangaId::new(manga_id), source_order)
    }

    pub fn manga_id(&self) -> &MangaId {
        &self.manga_id
    }

    pub fn source_order(&self) -> u64 {
        self.source_order
    }

    pub fn canonical_path(&self) -> String {
        format!(
            "/manga/{}/chapter/{}",
            self.manga_id.value(),
            self.source_order
        )
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_path())
    }
}

/// Last known OCR state of a chapter, as reported by the OCR server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChapterStatus {
    /// No job is running. `cached` pages already have OCR data, out of
    /// `total` pages (0 when the server doesn't know the page count yet).
    Idle { cached: usize, total: usize },
    /// A job is running and has processed `progress` of `total` pages.
    Processing { progress: usize, total: usize },
    /// Every page is OCR'd and cached.
    Processed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrLanguage {
    #[default]
    #[serde(rename = "ja")]
    Japanese,
    #[serde(rename = "en")]
    English,
    #[serde(rename = "zh")]
    Chinese,
    #[serde(rename = "ko")]
    Korean,
}

impl OcrLanguage {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Japanese => "ja",
            Self::English => "en",
            Self::Chinese => "zh",
            Self::Korean => "ko",
        }
    }
}

impl fmt::Display for OcrLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for OcrLanguage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ja" => Ok(Self::Japanese),
            "en" => Ok(Self::English),
            "zh" => Ok(Self::Chinese),
            "ko" => Ok(Self::Korean),
            _ => Err(anyhow::anyhow!("unknown OCR language: {s}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_key_canonical_path_matches_the_wire_format() {
        let key = ChapterKey::from_parts("42".into(), 7);

        assert_eq!("/manga/42/chapter/7", key.canonical_path());
        assert_eq!(key.canonical_path(), key.to_string());
    }

    #[test]
    fn chapter_keys_with_equal_parts_are_the_same_map_key() {
        let a = ChapterKey::from_parts("1".into(), 5);
        let b = ChapterKey::from_parts("1".into(), 5);

        assert_eq!(a, b);

        let mut map = std::collections::HashMap::new();
        map.insert(a, ());
        assert!(map.contains_key(&b));
    }

    #[test]
    fn ocr_language_round_trips_through_its_code() {
        for language in [
            OcrLanguage::Japanese,
            OcrLanguage::English,
            OcrLanguage::Chinese,
            OcrLanguage::Korean,
        ] {
            assert_eq!(language, language.code().parse().unwrap());
        }
    }
}
