pub mod location;

pub use location::{OutputLocation, StorageUrl};

use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use common::Result;
use common::config::AwsConfig;
use datafusion::execution::context::SessionContext;
use futures::TryStreamExt;
use glob::{MatchOptions, Pattern};
use object_store::ObjectStore;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

#[derive(Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub allow_http: bool,
}

impl From<&AwsConfig> for S3Config {
    fn from(aws: &AwsConfig) -> Self {
        Self {
            endpoint: aws.endpoint.clone(),
            region: aws.region.clone(),
            access_key: aws.access_key.clone(),
            secret_key: aws.secret_key.clone(),
            allow_http: aws.allow_http,
        }
    }
}

impl S3Config {
    /// No access key configured: requests go out unsigned.
    pub fn is_anonymous(&self) -> bool {
        self.access_key.trim().is_empty()
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("allow_http", &self.allow_http)
            .finish()
    }
}

/// Hands out per-bucket S3 clients and object stores built from one set of credentials.
#[derive(Clone)]
pub struct S3Manager {
    pub config: S3Config,
    client_cache: Arc<dashmap::DashMap<String, Arc<S3Client>>>,
    object_store_cache: Arc<dashmap::DashMap<String, Arc<AmazonS3>>>,
}

impl S3Manager {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client_cache: Arc::new(dashmap::DashMap::new()),
            object_store_cache: Arc::new(dashmap::DashMap::new()),
        }
    }

    pub async fn get_client(&self, bucket: &str) -> Result<Arc<S3Client>> {
        if let Some(client) = self.client_cache.get(bucket) {
            return Ok(client.clone());
        }

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()));

        if !self.config.is_anonymous() {
            builder = builder.credentials_provider(Credentials::new(
                &self.config.access_key,
                &self.config.secret_key,
                None,
                None,
                "static",
            ));
        }

        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Arc::new(S3Client::from_conf(builder.build()));
        self.client_cache.insert(bucket.to_string(), client.clone());
        Ok(client)
    }

    pub async fn get_object_store(&self, bucket: &str) -> Result<Arc<AmazonS3>> {
        if let Some(store) = self.object_store_cache.get(bucket) {
            return Ok(store.clone());
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&self.config.region)
            .with_allow_http(self.config.allow_http);

        if self.config.is_anonymous() {
            builder = builder.with_skip_signature(true);
        } else {
            builder = builder
                .with_access_key_id(&self.config.access_key)
                .with_secret_access_key(&self.config.secret_key);
        }

        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        let store = Arc::new(builder.build()?);
        self.object_store_cache
            .insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    /// Makes `s3://<bucket>` resolvable for DataFusion reads and writes.
    pub async fn register_object_store(&self, ctx: &SessionContext, bucket: &str) -> Result<()> {
        let store = self.get_object_store(bucket).await?;
        let url = Url::parse(&format!("s3://{}", bucket))?;
        ctx.runtime_env().register_object_store(&url, store);
        debug!(bucket, "Registered object store");
        Ok(())
    }

    /// Expands a key pattern (`*`, `?`, `[...]`, `**`) against the bucket listing.
    /// DataFusion only resolves globs on local paths, so object store inputs are
    /// handed to it as explicit file URLs.
    pub async fn expand_glob(&self, bucket: &str, key_pattern: &str) -> Result<Vec<String>> {
        if !has_glob(key_pattern) {
            return Ok(vec![format!("s3://{}/{}", bucket, key_pattern)]);
        }

        let pattern = Pattern::new(key_pattern).map_err(|e| {
            common::Error::InvalidInput(format!("Invalid glob '{}': {}", key_pattern, e))
        })?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let store = self.get_object_store(bucket).await?;
        let prefix = ObjectPath::from(literal_prefix(key_pattern));
        let listed: Vec<object_store::ObjectMeta> =
            store.list(Some(&prefix)).try_collect().await?;

        let mut matched: Vec<String> = listed
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| pattern.matches_with(key, options))
            .map(|key| format!("s3://{}/{}", bucket, key))
            .collect();
        matched.sort();

        info!(bucket, pattern = key_pattern, files = matched.len(), "Expanded input glob");
        Ok(matched)
    }

    /// Verifies that a bucket exists and is accessible
    pub async fn verify_bucket_exists(&self, bucket: &str) -> Result<()> {
        if self.config.is_anonymous() {
            return self.verify_bucket_listable(bucket).await;
        }

        let client = self.get_client(bucket).await?;

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!(bucket, "Bucket is reachable");
                Ok(())
            }
            Err(e) => Err(common::Error::Storage(format!(
                "Cannot access bucket '{}': {}",
                bucket,
                DisplayErrorContext(&e)
            ))),
        }
    }

    /// Unsigned check for public buckets, through the same store reads use.
    async fn verify_bucket_listable(&self, bucket: &str) -> Result<()> {
        let store = self.get_object_store(bucket).await?;
        match store.list_with_delimiter(None).await {
            Ok(_) => {
                info!(bucket, "Bucket is reachable without credentials");
                Ok(())
            }
            Err(e) => Err(common::Error::Storage(format!(
                "Cannot list bucket '{}' anonymously: {}",
                bucket, e
            ))),
        }
    }
}

fn has_glob(key: &str) -> bool {
    key.contains(['*', '?', '['])
}

/// Directory part of `key` that precedes the first glob character.
fn literal_prefix(key: &str) -> &str {
    let end = key.find(['*', '?', '[']).unwrap_or(key.len());
    match key[..end].rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    }
}
