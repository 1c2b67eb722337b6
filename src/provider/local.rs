//! Built-in filesystem provider.
//!
//! Handles two resource types rooted at a configurable directory:
//! - `local:file`: a file with text content
//! - `local:random_id`: a random identifier persisted as a small JSON record

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::graph::AttributeMap;

use super::schema::ResourceSchema;
use super::{CreatedResource, Provider, ProviderContext, ProviderResult};

/// Resource type for managed files.
pub const FILE_TYPE: &str = "local:file";

/// Resource type for random identifiers.
pub const RANDOM_ID_TYPE: &str = "local:random_id";

/// Default provider root, relative to the working directory.
const DEFAULT_ROOT: &str = ".converge/local";

/// Directory under the root holding random id records.
const RANDOM_ID_DIR: &str = "random_id";

/// Largest accepted `byte_length`.
const MAX_BYTE_LENGTH: u64 = 64;

/// Filesystem-backed provider.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

/// Persisted form of a random id.
#[derive(Debug, Serialize, Deserialize)]
struct RandomIdRecord {
    hex: String,
    byte_length: u64,
    #[serde(default)]
    keepers: Value,
}

impl LocalProvider {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates a provider from its context; `root` defaults to `.converge/local`.
    #[must_use]
    pub fn from_context(context: &ProviderContext) -> Self {
        Self::new(context.setting_str("root").unwrap_or(DEFAULT_ROOT))
    }

    /// Returns the provider root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, inputs: &AttributeMap) -> ProviderResult<PathBuf> {
        let path = required_str(inputs, "path")?;
        if path.is_empty() {
            return Err(ProviderError::permanent("'path' must not be empty"));
        }
        Ok(self.root.join(path))
    }

    fn record_path(&self, hex_id: &str) -> PathBuf {
        self.root.join(RANDOM_ID_DIR).join(format!("{hex_id}.json"))
    }

    async fn create_file(&self, inputs: &AttributeMap) -> ProviderResult<CreatedResource> {
        let path = self.file_path(inputs)?;
        let content = required_str(inputs, "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&e, parent))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error(&e, &path))?;

        let provider_id = path.to_string_lossy().into_owned();
        info!("Created file {provider_id}");
        Ok(CreatedResource {
            outputs: file_outputs(&provider_id, content),
            provider_id,
        })
    }

    async fn create_random_id(&self, inputs: &AttributeMap) -> ProviderResult<CreatedResource> {
        let byte_length = inputs
            .get("byte_length")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProviderError::permanent("'byte_length' must be a positive integer"))?;
        if byte_length == 0 || byte_length > MAX_BYTE_LENGTH {
            return Err(ProviderError::permanent(format!(
                "'byte_length' must be between 1 and {MAX_BYTE_LENGTH}"
            )));
        }

        let record = RandomIdRecord {
            hex: random_hex(byte_length),
            byte_length,
            keepers: inputs.get("keepers").cloned().unwrap_or(Value::Null),
        };
        let path = self.record_path(&record.hex);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&e, parent))?;
        }
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| ProviderError::permanent(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| io_error(&e, &path))?;

        info!("Created random id {}", record.hex);
        Ok(CreatedResource {
            outputs: random_id_outputs(&record),
            provider_id: record.hex,
        })
    }

    async fn read_file(provider_id: &str) -> ProviderResult<Option<AttributeMap>> {
        match tokio::fs::read_to_string(provider_id).await {
            Ok(content) => Ok(Some(file_outputs(provider_id, &content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&e, Path::new(provider_id))),
        }
    }

    async fn read_random_id(&self, provider_id: &str) -> ProviderResult<Option<AttributeMap>> {
        let path = self.record_path(provider_id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&e, &path)),
        };
        let record: RandomIdRecord = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::permanent(format!("corrupt record {}: {e}", path.display())))?;
        Ok(Some(random_id_outputs(&record)))
    }

    async fn delete_path(path: &Path) -> ProviderResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!("Deleted {}", path.display());
                Ok(())
            }
            Err(e) => Err(io_error(&e, path)),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn schemas(&self) -> Vec<ResourceSchema> {
        vec![
            ResourceSchema::new(FILE_TYPE)
                .replace_required("path")
                .update_in_place("content"),
            ResourceSchema::new(RANDOM_ID_TYPE)
                .replace_required("byte_length")
                .replace_required("keepers")
                .create_before_delete(),
        ]
    }

    async fn create(
        &self,
        resource_type: &str,
        inputs: &AttributeMap,
    ) -> ProviderResult<CreatedResource> {
        debug!("local create {resource_type}");
        match resource_type {
            FILE_TYPE => self.create_file(inputs).await,
            RANDOM_ID_TYPE => self.create_random_id(inputs).await,
            other => Err(unsupported(other)),
        }
    }

    async fn read(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> ProviderResult<Option<AttributeMap>> {
        match resource_type {
            FILE_TYPE => Self::read_file(provider_id).await,
            RANDOM_ID_TYPE => self.read_random_id(provider_id).await,
            other => Err(unsupported(other)),
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        inputs: &AttributeMap,
    ) -> ProviderResult<AttributeMap> {
        if resource_type != FILE_TYPE {
            return Err(ProviderError::permanent(format!(
                "{resource_type} does not support in-place updates"
            )));
        }
        let path = Path::new(provider_id);
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            });
        }
        let content = required_str(inputs, "content")?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| io_error(&e, path))?;
        info!("Updated file {provider_id}");
        Ok(file_outputs(provider_id, content))
    }

    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        match resource_type {
            FILE_TYPE => Self::delete_path(Path::new(provider_id)).await,
            RANDOM_ID_TYPE => Self::delete_path(&self.record_path(provider_id)).await,
            other => Err(unsupported(other)),
        }
    }
}

fn required_str<'a>(inputs: &'a AttributeMap, name: &str) -> ProviderResult<&'a str> {
    inputs
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::permanent(format!("'{name}' must be a string")))
}

fn unsupported(resource_type: &str) -> ProviderError {
    ProviderError::permanent(format!("local provider does not handle '{resource_type}'"))
}

fn io_error(e: &std::io::Error, path: &Path) -> ProviderError {
    match e.kind() {
        ErrorKind::NotFound => ProviderError::NotFound {
            provider_id: path.to_string_lossy().into_owned(),
        },
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            ProviderError::transient(format!("{}: {e}", path.display()))
        }
        _ => ProviderError::permanent(format!("{}: {e}", path.display())),
    }
}

fn file_outputs(provider_id: &str, content: &str) -> AttributeMap {
    let mut outputs = AttributeMap::new();
    outputs.insert(String::from("id"), json!(provider_id));
    outputs.insert(String::from("path"), json!(provider_id));
    outputs.insert(
        String::from("sha256"),
        json!(hex::encode(Sha256::digest(content.as_bytes()))),
    );
    outputs
}

fn random_id_outputs(record: &RandomIdRecord) -> AttributeMap {
    let mut outputs = AttributeMap::new();
    outputs.insert(String::from("id"), json!(record.hex));
    outputs.insert(String::from("hex"), json!(record.hex));
    outputs.insert(String::from("byte_length"), json!(record.byte_length));
    outputs
}

fn random_hex(byte_length: u64) -> String {
    let len = usize::try_from(byte_length).unwrap_or(usize::MAX);
    let mut bytes = Vec::with_capacity(len);
    while bytes.len() < len {
        bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    }
    bytes.truncate(len);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChangePolicy;
    use tempfile::TempDir;

    fn inputs(pairs: &[(&str, Value)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let dir = TempDir::new().expect("tempdir");
        let provider = LocalProvider::new(dir.path());

        let created = provider
            .create(
                FILE_TYPE,
                &inputs(&[("path", json!("out/a.txt")), ("content", json!("hello"))]),
            )
            .await
            .expect("create");
        assert!(dir.path().join("out/a.txt").exists());
        assert_eq!(created.outputs.get("path"), Some(&json!(created.provider_id)));

        let updated = provider
            .update(
                FILE_TYPE,
                &created.provider_id,
                &inputs(&[("path", json!("out/a.txt")), ("content", json!("bye"))]),
            )
            .await
            .expect("update");
        assert_ne!(updated.get("sha256"), created.outputs.get("sha256"));

        let live = provider
            .read(FILE_TYPE, &created.provider_id)
            .await
            .expect("read");
        assert_eq!(live, Some(updated));

        provider
            .delete(FILE_TYPE, &created.provider_id)
            .await
            .expect("delete");
        assert_eq!(
            provider.read(FILE_TYPE, &created.provider_id).await,
            Ok(None)
        );
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let provider = LocalProvider::new(dir.path());
        let missing = dir.path().join("nope.txt");

        let err = provider
            .delete(FILE_TYPE, &missing.to_string_lossy())
            .await
            .expect_err("missing file");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_random_id_lifecycle() {
        let dir = TempDir::new().expect("tempdir");
        let provider = LocalProvider::new(dir.path());

        let created = provider
            .create(RANDOM_ID_TYPE, &inputs(&[("byte_length", json!(8))]))
            .await
            .expect("create");
        assert_eq!(created.provider_id.len(), 16);

        let live = provider
            .read(RANDOM_ID_TYPE, &created.provider_id)
            .await
            .expect("read");
        assert_eq!(live, Some(created.outputs.clone()));

        provider
            .delete(RANDOM_ID_TYPE, &created.provider_id)
            .await
            .expect("delete");
        assert_eq!(
            provider.read(RANDOM_ID_TYPE, &created.provider_id).await,
            Ok(None)
        );
    }

    #[tokio::test]
    async fn test_invalid_inputs_are_permanent() {
        let dir = TempDir::new().expect("tempdir");
        let provider = LocalProvider::new(dir.path());

        let err = provider
            .create(RANDOM_ID_TYPE, &inputs(&[("byte_length", json!(0))]))
            .await
            .expect_err("zero length");
        assert!(!err.is_retryable());

        let err = provider
            .create(FILE_TYPE, &inputs(&[("path", json!("x.txt"))]))
            .await
            .expect_err("missing content");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_schemas() {
        let provider = LocalProvider::new("/tmp");
        let schemas = provider.schemas();
        let file = &schemas[0];
        assert_eq!(file.policy_for("path"), Some(ChangePolicy::ReplaceRequired));
        assert_eq!(file.policy_for("content"), Some(ChangePolicy::UpdateInPlace));
        assert!(schemas[1].create_before_delete);
    }
}
