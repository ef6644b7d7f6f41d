//! Azure Blob state store
//!
//! Keeps each key as a block blob in one container, authorised by a SAS token
//! or an account key.

use async_trait::async_trait;
use azure_core::error::ErrorKind;
use azure_core::StatusCode;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use crmtrail_core::error::{CrmTrailError, Result};
use log::debug;

use super::StateStore;

const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// How the store authenticates against the storage account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobCredentials {
    /// Container or account SAS token, with or without the leading `?`
    SasToken(String),
    /// Shared account key
    AccessKey(String),
}

/// State store backed by block blobs in an Azure storage container
pub struct BlobStateStore {
    account_name: String,
    container: String,
    container_client: ContainerClient,
}

impl BlobStateStore {
    /// Create a store for `container` in `account_name`
    pub fn new<A: Into<String>, C: Into<String>>(
        account_name: A,
        container: C,
        credentials: BlobCredentials,
    ) -> Result<Self> {
        let account_name = account_name.into();
        let container = container.into();

        let storage_credentials = match credentials {
            BlobCredentials::SasToken(token) => StorageCredentials::sas_token(token.trim_start_matches('?'))
                .map_err(|e| CrmTrailError::Config(format!("Invalid SAS token: {}", e)))?,
            BlobCredentials::AccessKey(key) => StorageCredentials::access_key(account_name.clone(), key),
        };
        let container_client =
            BlobServiceClient::new(account_name.clone(), storage_credentials).container_client(container.clone());

        Ok(Self { account_name, container, container_client })
    }

    fn blob_name(key: &str) -> &str {
        key.trim_start_matches('/')
    }

    /// `account/container/blob`, for logs
    fn describe(&self, key: &str) -> String {
        format!("{}/{}/{}", self.account_name, self.container, Self::blob_name(key))
    }
}

fn is_not_found(error: &azure_core::Error) -> bool {
    matches!(error.kind(), ErrorKind::HttpResponse { status: StatusCode::NotFound, .. })
}

#[async_trait]
impl StateStore for BlobStateStore {
    async fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let blob_client = self.container_client.blob_client(Self::blob_name(key));

        let content = match blob_client.get_content().await {
            Ok(content) => content,
            Err(e) if is_not_found(&e) => {
                debug!("Blob {} does not exist", self.describe(key));
                return Ok(None);
            }
            Err(e) => {
                return Err(CrmTrailError::State(format!("Failed to download {}: {}", self.describe(key), e)));
            }
        };

        debug!("Downloaded blob {} ({} bytes)", self.describe(key), content.len());
        String::from_utf8(content)
            .map(Some)
            .map_err(|e| CrmTrailError::State(format!("Blob {} is not UTF-8: {}", self.describe(key), e)))
    }

    async fn save_raw(&self, key: &str, value: &str) -> Result<()> {
        let blob_client = self.container_client.blob_client(Self::blob_name(key));

        blob_client
            .put_block_blob(value.as_bytes().to_vec())
            .content_type(CONTENT_TYPE)
            .await
            .map_err(|e| CrmTrailError::State(format!("Failed to upload {}: {}", self.describe(key), e)))?;

        debug!("Uploaded blob {}", self.describe(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_names() {
        let store = BlobStateStore::new(
            "acct",
            "state",
            BlobCredentials::SasToken("?sv=2022-11-02&ss=b&srt=co&sp=rw&sig=abc".into()),
        )
        .unwrap();

        assert_eq!(BlobStateStore::blob_name("/entitydelta/lastdate.txt"), "entitydelta/lastdate.txt");
        assert_eq!(store.describe("/lastdate.txt"), "acct/state/lastdate.txt");
    }

    #[test]
    fn test_access_key_credentials() {
        let store = BlobStateStore::new("acct", "state", BlobCredentials::AccessKey("a2V5".into())).unwrap();
        assert_eq!(store.describe("traces.watermark"), "acct/state/traces.watermark");
    }

    #[test]
    fn test_not_found_detection() {
        let missing = azure_core::Error::new(
            ErrorKind::HttpResponse { status: StatusCode::NotFound, error_code: Some("BlobNotFound".into()) },
            "missing",
        );
        let forbidden = azure_core::Error::new(
            ErrorKind::HttpResponse { status: StatusCode::Forbidden, error_code: None },
            "forbidden",
        );

        assert!(is_not_found(&missing));
        assert!(!is_not_found(&forbidden));
    }
}
