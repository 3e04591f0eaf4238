//! Static table of known whisper.cpp model artifacts.

/// One downloadable model artifact.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    /// Short model name used in configuration.
    pub name: &'static str,
    /// Expected artifact size in bytes (10 % tolerance on verification).
    pub expected_size: u64,
    /// SHA-256 of the artifact, when published.
    pub sha256: Option<&'static str>,
    /// Download URL.
    pub url: &'static str,
}

const MB: u64 = 1024 * 1024;

/// Known models, in preference order from fastest to most accurate.
pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "tiny",
        expected_size: 39 * MB,
        sha256: Some("be07e048e1e599ad46341c8d2a135645097a303b82394ad0e2ce15eb8a1e1e3c"),
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
    },
    CatalogEntry {
        name: "base",
        expected_size: 142 * MB,
        sha256: Some("60ed5bc3dd14eea856493d334349b405782ddcaf0028d4b5df4088345fba2efe"),
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
    },
    CatalogEntry {
        name: "small",
        expected_size: 466 * MB,
        sha256: Some("1be3a9b2063867b937e64e2ec7483364a79917e157fa98c5d94b5c1fffea987b"),
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
    },
    CatalogEntry {
        name: "medium",
        expected_size: 1540 * MB,
        sha256: None,
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-medium.bin",
    },
    CatalogEntry {
        name: "large",
        expected_size: 3100 * MB,
        sha256: Some("ad82bf6ef9fd339d67b2ffccc8ff14802f1e99d6b77a9ec6a8d26b38b5bb2cd5"),
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3.bin",
    },
];

/// Looks up a catalog entry by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|entry| entry.name == name)
}

/// Local cache filename for a model.
#[must_use]
pub fn artifact_filename(name: &str) -> String {
    format!("ggml-{name}.bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

    #[test]
    fn catalog_order_is_deterministic() {
        let names: Vec<_> = CATALOG.iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["tiny", "base", "small", "medium", "large"]);
    }

    #[test]
    fn find_known_model() {
        let entry = find("base").unwrap();
        assert!(entry.url.starts_with(BASE_URL));
        assert!(entry.sha256.is_some());
    }

    #[test]
    fn find_unknown_model() {
        assert!(find("gigantic").is_none());
    }

    #[test]
    fn artifact_filenames() {
        assert_eq!(artifact_filename("tiny"), "ggml-tiny.bin");
        assert_eq!(artifact_filename("base"), "ggml-base.bin");
    }

    #[test]
    fn sizes_are_plausible() {
        for entry in CATALOG {
            assert!(entry.expected_size >= 10 * MB, "{} too small", entry.name);
        }
    }
}
