//! Catalog persistence: the confirmed document list lives in one JSON file,
//! replaced atomically on every commit adoption.

use std::path::Path;

use tracing::warn;

use crate::types::Catalog;

/// Load the catalog from `path`. A missing file yields a fresh, empty
/// catalog. A corrupt file is moved aside (`<path>.corrupt-<timestamp>`)
/// and a fresh catalog is returned rather than failing startup — the
/// cluster will re-converge on the correct version via the next
/// `version_commit` it observes.
pub async fn load_catalog(path: &str) -> Catalog {
    let path_ref = Path::new(path);
    if !path_ref.exists() {
        return Catalog::default();
    }

    match tokio::fs::read_to_string(path_ref).await {
        Ok(contents) => match serde_json::from_str::<Catalog>(&contents) {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(error = %err, path, "catalog file is corrupt, quarantining and starting fresh");
                quarantine(path_ref).await;
                Catalog::default()
            }
        },
        Err(err) => {
            warn!(error = %err, path, "failed to read catalog file, starting fresh");
            Catalog::default()
        }
    }
}

async fn quarantine(path: &Path) {
    let quarantined = path.with_extension(format!(
        "corrupt-{}",
        chrono::Utc::now().timestamp()
    ));
    if let Err(err) = tokio::fs::rename(path, &quarantined).await {
        warn!(error = %err, "failed to quarantine corrupt catalog file");
    }
}

/// Persist `catalog` to `path`, writing to a temp file and renaming over
/// the target so a crash mid-write never leaves a half-written catalog.
pub async fn save_catalog(path: &str, catalog: &Catalog) -> std::io::Result<()> {
    let serialized = serde_json::to_string_pretty(catalog)?;
    let tmp_path = format!("{path}.tmp");
    tokio::fs::write(&tmp_path, serialized).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CatalogEntry;

    #[tokio::test]
    async fn missing_file_yields_empty_catalog() {
        let catalog = load_catalog("/nonexistent/path/catalog.json").await;
        assert!(catalog.documents_confirmed.is_empty());
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let path = path.to_str().unwrap();

        let mut catalog = Catalog::default();
        catalog.documents_confirmed.push(CatalogEntry {
            cid: "Qm123".into(),
            filename: "doc.txt".into(),
            added_at: chrono::Utc::now(),
            embedding_cid: "Qm456".into(),
            local_embedding_path: "embeddings/Qm123".into(),
        });
        catalog.version_confirmed = 1;

        save_catalog(path, &catalog).await.unwrap();
        let loaded = load_catalog(path).await;
        assert_eq!(loaded.version_confirmed, 1);
        assert_eq!(loaded.documents_confirmed.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let catalog = load_catalog(path.to_str().unwrap()).await;
        assert!(catalog.documents_confirmed.is_empty());
    }
}
