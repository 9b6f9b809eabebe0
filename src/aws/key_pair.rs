//! Key pair provider.
//!
//! Key pairs are addressed by name. A declared public key is imported;
//! otherwise EC2 generates the pair and the private key is written to
//! `~/.ssh/{name}.pem`, the only time it is ever available.

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::primitives::Blob;
use aws_sdk_ec2::types::ResourceType;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::graph::{KeyPairSpec, ResourceKind, ResourceSpec};
use crate::naming::OwnerTag;
use crate::provider::{CreateRequest, CreatedResource, DeleteRequest, RemoteResource, ResourceProvider, UpdateRequest};

use super::error::from_sdk;
use super::tags::{EC2_TAG_LIMIT, owner_filter, tag_map, tag_spec};
use super::{ensure_absent, identity_filters, missing, wrong_spec};

/// Manages EC2 key pairs.
#[derive(Debug, Clone)]
pub struct KeyPairProvider {
    client: Client,
    key_dir: Option<PathBuf>,
}

impl KeyPairProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            key_dir: dirs::home_dir().map(|home| home.join(".ssh")),
        }
    }
}

/// Writes generated key material readable by the owner only.
fn save_private_key(dir: &Path, name: &str, material: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}.pem"));
    std::fs::write(&path, material)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(path)
}

#[async_trait]
impl ResourceProvider for KeyPairProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KeyPair
    }

    fn tag_limit(&self) -> Option<usize> {
        Some(EC2_TAG_LIMIT)
    }

    async fn list(&self, owner: &OwnerTag) -> ProviderResult<Vec<RemoteResource>> {
        let output = self
            .client
            .describe_key_pairs()
            .filters(owner_filter(owner))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeKeyPairs", &e))?;

        Ok(output
            .key_pairs()
            .iter()
            .filter_map(|key| {
                Some(RemoteResource {
                    remote_id: key.key_name()?.to_string(),
                    tags: tag_map(key.tags()),
                    spec: ResourceSpec::KeyPair(KeyPairSpec {
                        public_key: key.public_key().map(str::to_string),
                    }),
                })
            })
            .collect())
    }

    async fn create(&self, request: &CreateRequest) -> ProviderResult<CreatedResource> {
        let ResourceSpec::KeyPair(spec) = &request.spec else {
            return Err(wrong_spec(self.kind()));
        };

        let existing = self
            .client
            .describe_key_pairs()
            .set_filters(Some(identity_filters(&request.tags)))
            .send()
            .await
            .map_err(|e| from_sdk("DescribeKeyPairs", &e))?;
        ensure_absent(&request.name, existing.key_pairs().first().and_then(|k| k.key_name()))?;

        let tags = tag_spec(ResourceType::KeyPair, &request.tags);
        if let Some(public_key) = &spec.public_key {
            self.client
                .import_key_pair()
                .key_name(&request.name)
                .public_key_material(Blob::new(public_key.as_bytes()))
                .tag_specifications(tags)
                .send()
                .await
                .map_err(|e| from_sdk("ImportKeyPair", &e))?;
            info!(key_pair = %request.name, "Imported key pair");
        } else {
            let output = self
                .client
                .create_key_pair()
                .key_name(&request.name)
                .tag_specifications(tags)
                .send()
                .await
                .map_err(|e| from_sdk("CreateKeyPair", &e))?;
            let material = output
                .key_material()
                .ok_or_else(|| missing("CreateKeyPair", "key material"))?;
            match &self.key_dir {
                Some(dir) => {
                    let path = save_private_key(dir, &request.name, material).map_err(|e| ProviderError::Other {
                        code: String::from("KeyMaterialNotSaved"),
                        message: format!("{}: {e}", request.name),
                    })?;
                    info!(key_pair = %request.name, path = %path.display(), "Created key pair");
                }
                None => warn!(key_pair = %request.name, "No home directory; private key discarded"),
            }
        }

        Ok(CreatedResource {
            remote_id: request.name.clone(),
            tags: request.tags.to_map(),
        })
    }

    async fn update(&self, request: &UpdateRequest) -> ProviderResult<()> {
        Err(ProviderError::invalid(format!("key pair {} is immutable", request.remote_id)))
    }

    async fn delete(&self, request: &DeleteRequest) -> ProviderResult<()> {
        self.client
            .delete_key_pair()
            .key_name(&request.remote_id)
            .send()
            .await
            .map_err(|e| from_sdk("DeleteKeyPair", &e))?;
        info!(key_pair = %request.remote_id, "Deleted key pair");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_saved_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_private_key(&dir.path().join("ssh"), "staging-deploy", "-----BEGIN RSA-----").unwrap();
        assert_eq!(path.file_name().unwrap(), "staging-deploy.pem");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "-----BEGIN RSA-----");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
