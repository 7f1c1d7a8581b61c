use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use object_store::{
    aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem,
    memory::InMemory, ObjectStore,
};
use tracing::debug;

use super::location::{Location, Scheme};

/// Build the object store a location lives in. Cloud stores pick up
/// credentials from the environment (`GOOGLE_*`, `AWS_*`).
pub fn build_store(location: &Location) -> Result<Arc<dyn ObjectStore>> {
    debug!(root = %location.root(), "building object store");

    let store: Arc<dyn ObjectStore> = match location.scheme() {
        Scheme::Gcs => {
            let bucket = bucket_of(location)?;
            let store = GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket)
                .build()
                .with_context(|| format!("failed to create object store for {}", location.root()))?;
            Arc::new(store)
        }
        Scheme::S3 => {
            let bucket = bucket_of(location)?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .with_context(|| format!("failed to create object store for {}", location.root()))?;
            Arc::new(store)
        }
        Scheme::Memory => Arc::new(InMemory::new()),
        // drop directories emptied by deletes, staging dirs included
        Scheme::Local => Arc::new(LocalFileSystem::new().with_automatic_cleanup(true)),
    };

    Ok(store)
}

fn bucket_of(location: &Location) -> Result<&str> {
    location
        .bucket()
        .ok_or_else(|| anyhow!("location {} has no bucket", location))
}
