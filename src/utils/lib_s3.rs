use std::{path::Path as LocalPath, sync::Arc};

use async_trait::async_trait;
use futures::TryStreamExt;
use log::info;
use object_store::{aws::AmazonS3Builder, path::Path, ObjectStore, PutPayload};

use crate::{config::S3Settings, error::EtlError};

/// Remote folder the batch files are staged in before the warehouse picks
/// them up.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Upload a local file as `<prefix>/<name>` and return the object key.
    async fn upload(&self, local: &LocalPath, name: &str) -> Result<String, EtlError>;

    /// Keys of all the objects currently under the prefix.
    async fn list(&self) -> Result<Vec<String>, EtlError>;

    async fn delete(&self, key: &str) -> Result<(), EtlError>;

    /// External location of the prefix, e.g. `s3://bucket/folder/`.
    fn location(&self) -> String;
}

pub struct S3Stage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl S3Stage {
    pub fn new(settings: &S3Settings) -> Result<Self, EtlError> {
        let store = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_access_key_id(&settings.access_key_id)
            .with_secret_access_key(&settings.secret_access_key)
            .build()?;
        Ok(Self::with_store(
            Arc::new(store),
            &settings.bucket,
            &settings.folder,
        ))
    }

    /// Stage on top of any object store, e.g. an in-memory one.
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: &str, prefix: &str) -> Self {
        S3Stage {
            store,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn key(&self, name: &str) -> Path {
        Path::from(format!("{}/{}", self.prefix, name))
    }
}

#[async_trait]
impl Stage for S3Stage {
    async fn upload(&self, local: &LocalPath, name: &str) -> Result<String, EtlError> {
        let bytes = tokio::fs::read(local).await?;
        let key = self.key(name);
        self.store.put(&key, PutPayload::from(bytes)).await?;
        Ok(key.to_string())
    }

    async fn list(&self) -> Result<Vec<String>, EtlError> {
        let prefix = Path::from(self.prefix.as_str());
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let mut keys: Vec<String> = objects.into_iter().map(|o| o.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), EtlError> {
        // keys come back from `list` already encoded
        let location = Path::parse(key).map_err(object_store::Error::from)?;
        self.store.delete(&location).await?;
        info!("Deleted {} from S3.", key);
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}/{}/", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, io::Write};

    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn upload_list_delete() -> Result<(), Box<dyn Error>> {
        let memory = Arc::new(InMemory::new());
        memory
            .put(&Path::from("other/keep.csv"), PutPayload::from_static(b"x"))
            .await?;
        let stage = S3Stage::with_store(memory.clone(), "etl-bucket", "/gsc/daily/");
        assert_eq!(stage.location(), "s3://etl-bucket/gsc/daily/");
        assert!(stage.list().await?.is_empty());

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"query,clicks\nrust,1\n")?;
        let key = stage.upload(file.path(), "batch_1.csv").await?;
        assert_eq!(key, "gsc/daily/batch_1.csv");

        let stored = memory.get(&Path::from(key.as_str())).await?.bytes().await?;
        assert_eq!(stored.as_ref(), b"query,clicks\nrust,1\n");
        assert_eq!(stage.list().await?, vec!["gsc/daily/batch_1.csv"]);

        stage.delete(&key).await?;
        assert!(stage.list().await?.is_empty());
        // objects outside the prefix are never touched
        assert!(memory.head(&Path::from("other/keep.csv")).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn delete_listed_key_with_reserved_chars() -> Result<(), Box<dyn Error>> {
        let memory = Arc::new(InMemory::new());
        memory
            .put(&Path::from("gsc/report 100%.csv"), PutPayload::from_static(b"x"))
            .await?;
        let stage = S3Stage::with_store(memory, "etl-bucket", "gsc");
        let keys = stage.list().await?;
        assert_eq!(keys, vec!["gsc/report 100%25.csv"]);
        for key in &keys {
            stage.delete(key).await?;
        }
        assert!(stage.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_local_file() {
        let stage = S3Stage::with_store(Arc::new(InMemory::new()), "b", "p");
        let res = stage
            .upload(LocalPath::new("/nonexistent/batch_1.csv"), "batch_1.csv")
            .await;
        assert!(matches!(res, Err(EtlError::Io(_))));
    }
}
