use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadState {
    NotDownloaded,
    Stale,
    Current,
    Unknown,
}

/// Immutable snapshot of one item as the index currently describes it. A new
/// descriptor replaces the old one on every update. Serializable as the wire
/// shape the request transport carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemDescriptor {
    /// Container-relative path; directories retain a trailing separator.
    pub path: String,
    pub is_directory: bool,
    pub size_bytes: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub content_changed: Option<OffsetDateTime>,
    pub download_state: DownloadState,
    pub uploading: bool,
    pub uploaded: bool,
    pub has_unresolved_conflicts: bool,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("metadata document is not an object")]
    NotAnObject,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("field {0} has unexpected type")]
    BadType(&'static str),
    #[error("unknown entry type: {0}")]
    UnknownKind(String),
    #[error("invalid timestamp in {field}")]
    BadTimestamp {
        field: &'static str,
        #[source]
        source: time::error::Parse,
    },
    #[error("download progress {0} out of range")]
    ProgressOutOfRange(f64),
}

/// A query result that could not be mapped. Preserved for diagnosis instead of
/// being discarded or failing the enumeration it arrived in.
#[derive(Debug)]
pub struct InvalidEntry {
    pub document: Value,
    pub error: DescriptorError,
}

pub fn map_entry(container_root: &str, document: &Value) -> Result<ItemDescriptor, DescriptorError> {
    let object = document.as_object().ok_or(DescriptorError::NotAnObject)?;

    let path = object
        .get("path")
        .ok_or(DescriptorError::MissingField("path"))?
        .as_str()
        .ok_or(DescriptorError::BadType("path"))?;
    let kind = object
        .get("type")
        .ok_or(DescriptorError::MissingField("type"))?
        .as_str()
        .ok_or(DescriptorError::BadType("type"))?;
    let is_directory = match kind {
        "file" => false,
        "dir" => true,
        other => return Err(DescriptorError::UnknownKind(other.to_string())),
    };

    let mut relative = paths::relative_to(container_root, path);
    if is_directory && !relative.ends_with('/') {
        relative.push('/');
    }

    let size_bytes = if is_directory {
        None
    } else {
        match object.get("size") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_u64().ok_or(DescriptorError::BadType("size"))?),
        }
    };

    let download = object.get("download");
    let progress = download.and_then(|d| d.get("progress")).and_then(Value::as_f64);
    if let Some(progress) = progress
        && !(0.0..=1.0).contains(&progress)
    {
        return Err(DescriptorError::ProgressOutOfRange(progress));
    }

    Ok(ItemDescriptor {
        path: relative,
        is_directory,
        size_bytes,
        created: parse_timestamp(object.get("created"), "created")?,
        content_changed: parse_timestamp(object.get("modified"), "modified")?,
        download_state: download_state(document),
        uploading: object
            .get("upload")
            .and_then(|u| u.get("active"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        uploaded: object
            .get("upload")
            .and_then(|u| u.get("committed"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        has_unresolved_conflicts: is_conflicted(document),
    })
}

/// Map a batch of raw documents, keeping the ones that fail as diagnostics.
pub fn map_entries(
    container_root: &str,
    documents: impl IntoIterator<Item = Value>,
) -> (Vec<ItemDescriptor>, Vec<InvalidEntry>) {
    let mut items = Vec::new();
    let mut invalid = Vec::new();
    for document in documents {
        match map_entry(container_root, &document) {
            Ok(descriptor) => items.push(descriptor),
            Err(error) => invalid.push(InvalidEntry { document, error }),
        }
    }
    (items, invalid)
}

fn parse_timestamp(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<OffsetDateTime>, DescriptorError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let text = value.as_str().ok_or(DescriptorError::BadType(field))?;
    OffsetDateTime::parse(text, &Rfc3339)
        .map(Some)
        .map_err(|source| DescriptorError::BadTimestamp { field, source })
}

// Lenient readers used by the watchdog's stage-one resolution; missing or
// odd-shaped fields degrade to "unknown" rather than erroring.

pub fn download_state(document: &Value) -> DownloadState {
    match document
        .get("download")
        .and_then(|d| d.get("state"))
        .and_then(Value::as_str)
    {
        Some("none") => DownloadState::NotDownloaded,
        Some("stale") => DownloadState::Stale,
        Some("current") => DownloadState::Current,
        _ => DownloadState::Unknown,
    }
}

pub fn download_progress(document: &Value) -> Option<f64> {
    document
        .get("download")
        .and_then(|d| d.get("progress"))
        .and_then(Value::as_f64)
}

pub fn download_error(document: &Value) -> Option<String> {
    document
        .get("download")
        .and_then(|d| d.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn is_conflicted(document: &Value) -> bool {
    document
        .get("conflicted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROOT: &str = "/containers/notes";

    fn file_document() -> Value {
        json!({
            "path": "/containers/notes/Docs/A.txt",
            "type": "file",
            "size": 1024,
            "created": "2026-01-01T00:00:00Z",
            "modified": "2026-01-02T12:30:00Z",
            "download": {"state": "current", "progress": 1.0},
            "upload": {"active": false, "committed": true},
            "conflicted": false
        })
    }

    #[test]
    fn maps_a_complete_file_document() {
        let descriptor = map_entry(ROOT, &file_document()).unwrap();

        assert_eq!(descriptor.path, "/Docs/A.txt");
        assert!(!descriptor.is_directory);
        assert_eq!(descriptor.size_bytes, Some(1024));
        assert_eq!(descriptor.download_state, DownloadState::Current);
        assert!(descriptor.uploaded);
        assert!(!descriptor.uploading);
        assert!(!descriptor.has_unresolved_conflicts);
        assert!(descriptor.created.is_some());
    }

    #[test]
    fn directories_keep_a_trailing_separator_and_no_size() {
        let descriptor = map_entry(
            ROOT,
            &json!({"path": "/containers/notes/Docs", "type": "dir", "size": 4096}),
        )
        .unwrap();

        assert_eq!(descriptor.path, "/Docs/");
        assert!(descriptor.is_directory);
        assert_eq!(descriptor.size_bytes, None);
    }

    #[test]
    fn missing_optional_fields_map_to_absent() {
        let descriptor = map_entry(
            ROOT,
            &json!({"path": "/containers/notes/B.txt", "type": "file"}),
        )
        .unwrap();

        assert_eq!(descriptor.size_bytes, None);
        assert!(descriptor.created.is_none());
        assert!(descriptor.content_changed.is_none());
        assert_eq!(descriptor.download_state, DownloadState::Unknown);
    }

    #[test]
    fn malformed_documents_produce_typed_errors() {
        assert!(matches!(
            map_entry(ROOT, &json!("not an object")),
            Err(DescriptorError::NotAnObject)
        ));
        assert!(matches!(
            map_entry(ROOT, &json!({"type": "file"})),
            Err(DescriptorError::MissingField("path"))
        ));
        assert!(matches!(
            map_entry(ROOT, &json!({"path": "/containers/notes/x", "type": "socket"})),
            Err(DescriptorError::UnknownKind(_))
        ));
        assert!(matches!(
            map_entry(
                ROOT,
                &json!({"path": "/containers/notes/x", "type": "file", "size": -3})
            ),
            Err(DescriptorError::BadType("size"))
        ));
        assert!(matches!(
            map_entry(
                ROOT,
                &json!({"path": "/containers/notes/x", "type": "file", "modified": "yesterday"})
            ),
            Err(DescriptorError::BadTimestamp { field: "modified", .. })
        ));
        assert!(matches!(
            map_entry(
                ROOT,
                &json!({
                    "path": "/containers/notes/x",
                    "type": "file",
                    "download": {"progress": 1.5}
                })
            ),
            Err(DescriptorError::ProgressOutOfRange(_))
        ));
    }

    #[test]
    fn one_bad_document_does_not_poison_the_batch() {
        let mut documents: Vec<Value> = (0..100)
            .map(|i| {
                json!({
                    "path": format!("/containers/notes/file-{i:03}.txt"),
                    "type": "file",
                    "size": i
                })
            })
            .collect();
        documents.insert(37, json!({"type": "file", "note": "no path"}));

        let (items, invalid) = map_entries(ROOT, documents);

        assert_eq!(items.len(), 100);
        assert_eq!(invalid.len(), 1);
        assert!(matches!(
            invalid[0].error,
            DescriptorError::MissingField("path")
        ));
    }

    #[test]
    fn descriptors_serialize_into_the_transport_shape() {
        let descriptor = map_entry(ROOT, &file_document()).unwrap();
        let wire = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(wire["path"], "/Docs/A.txt");
        assert_eq!(wire["download_state"], "current");
        assert_eq!(wire["created"], "2026-01-01T00:00:00Z");
    }

    #[test]
    fn lenient_readers_cover_the_watchdog_fields() {
        let document = json!({
            "path": "/containers/notes/A.txt",
            "type": "file",
            "download": {"state": "stale", "progress": 0.25, "error": "checksum mismatch"},
            "conflicted": true
        });

        assert_eq!(download_state(&document), DownloadState::Stale);
        assert_eq!(download_progress(&document), Some(0.25));
        assert_eq!(download_error(&document).as_deref(), Some("checksum mismatch"));
        assert!(is_conflicted(&document));
        assert_eq!(download_progress(&json!({})), None);
        assert_eq!(download_state(&json!({})), DownloadState::Unknown);
    }
}
