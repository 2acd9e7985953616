//! One JSON file per template under a configured directory. Filenames are
//! validated against the same pattern before every read and write so a
//! template name can never be used to escape the directory.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, GatewayResult};
use crate::model::Template;

static FILENAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+\.json$").unwrap());

pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, template_name: &str) -> GatewayResult<PathBuf> {
        let filename = format!("{template_name}.json");
        if !FILENAME_PATTERN.is_match(&filename) {
            return Err(GatewayError::BadInput(format!(
                "template name {template_name:?} does not yield a safe filename"
            )));
        }
        Ok(self.dir.join(filename))
    }

    pub async fn save(&self, template: &Template) -> GatewayResult<()> {
        let path = self.path_for(&template.name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(template)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    pub async fn load(&self, template_name: &str) -> GatewayResult<Template> {
        let path = self.path_for(template_name)?;
        let body = tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                GatewayError::NotFound(format!("no persisted template named {template_name:?}"))
            } else {
                GatewayError::Io(err)
            }
        })?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn remove(&self, template_name: &str) -> GatewayResult<()> {
        let path = self.path_for(template_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GatewayError::Io(err)),
        }
    }

    pub async fn list(&self) -> GatewayResult<Vec<Template>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(GatewayError::Io(err)),
        };

        let mut templates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !FILENAME_PATTERN.is_match(&name) {
                continue;
            }
            let body = tokio::fs::read(entry.path()).await?;
            templates.push(serde_json::from_slice(&body)?);
        }
        Ok(templates)
    }
}

pub fn is_safe_filename(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| FILENAME_PATTERN.is_match(n))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProtocolVersion, Transport};
    use std::collections::HashMap;

    fn template(name: &str) -> Template {
        Template {
            name: name.to_string(),
            protocol_version: ProtocolVersion::V2025_06_18,
            transport: Transport::Stdio,
            command: Some("node".into()),
            args: vec![],
            env: HashMap::new(),
            working_directory: None,
            endpoint: None,
            timeout_ms: 1000,
            retries: 0,
            container: None,
            health_check: None,
            untrusted: false,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        let tpl = template("echo");
        store.save(&tpl).await.unwrap();
        let loaded = store.load("echo").await.unwrap();
        assert_eq!(loaded, tpl);
    }

    #[tokio::test]
    async fn load_missing_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        let result = store.load("missing").await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn unsafe_template_name_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        let tpl = template("../escape");
        let result = store.save(&tpl).await;
        assert!(matches!(result, Err(GatewayError::BadInput(_))));
    }

    #[tokio::test]
    async fn list_skips_non_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        store.save(&template("a")).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hello").await.unwrap();

        let templates = store.list().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].name, "a");
    }
}
