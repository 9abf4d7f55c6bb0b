//! Property files consumed by the external test scheduler.
//!
//! A property file is a flat list of `KEY=value` lines sorted by key. Files
//! are written to a temporary name and renamed into place so the scheduler
//! never picks up a partial file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

/// Writes property files into a single directory.
#[derive(Debug, Clone)]
pub struct PropertyFileWriter {
    dir: PathBuf,
}

impl PropertyFileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Render parameters as sorted `KEY=value` lines.
    ///
    /// Newlines in values are replaced with spaces so every parameter stays
    /// on one line.
    pub fn render(parameters: &BTreeMap<String, String>) -> String {
        parameters
            .iter()
            .map(|(key, value)| format!("{}={}\n", key, value.replace(['\r', '\n'], " ")))
            .collect()
    }

    /// Write `file_name` atomically and return its final path.
    pub async fn write(
        &self,
        file_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<PathBuf> {
        validate_file_name(file_name)?;

        tokio::fs::create_dir_all(&self.dir).await.with_context(|| {
            format!("Failed to create property directory {}", self.dir.display())
        })?;

        let path = self.dir.join(file_name);
        let tmp = self.dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        let contents = Self::render(parameters);

        tokio::fs::write(&tmp, contents.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e)
                .with_context(|| format!("Failed to move property file to {}", path.display()));
        }

        info!("Wrote property file {} ({} keys)", path.display(), parameters.len());
        Ok(path)
    }
}

/// File names must stay inside the property directory.
fn validate_file_name(file_name: &str) -> Result<()> {
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        bail!("Invalid property file name: {:?}", file_name);
    }
    if file_name.contains(['/', '\\', '\0']) {
        bail!("Property file name must not contain path separators: {:?}", file_name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_sorted_lines() {
        let rendered = PropertyFileWriter::render(&params(&[
            ("PULL_REQUEST", "42"),
            ("ARCHITECTURE", "x86_64"),
            ("EXTRA_NOTE", "two\nlines"),
        ]));
        assert_eq!(
            rendered,
            "ARCHITECTURE=x86_64\nEXTRA_NOTE=two lines\nPULL_REQUEST=42\n"
        );
    }

    #[tokio::test]
    async fn test_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PropertyFileWriter::new(dir.path().join("props"));
        let path = writer
            .write("trigger-tests-repo-42-x86_64.properties", &params(&[("A", "1"), ("B", "2")]))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A=1\nB=2\n");

        // No temporary files are left behind.
        let names: Vec<_> = std::fs::read_dir(writer.dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PropertyFileWriter::new(dir.path());
        writer.write("f.properties", &params(&[("A", "1")])).await.unwrap();
        let path = writer.write("f.properties", &params(&[("A", "2")])).await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "A=2\n");
    }

    #[tokio::test]
    async fn test_write_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PropertyFileWriter::new(dir.path());
        assert!(writer.write("../escape.properties", &BTreeMap::new()).await.is_err());
        assert!(writer.write("..", &BTreeMap::new()).await.is_err());
        assert!(writer.write("", &BTreeMap::new()).await.is_err());
    }
}
