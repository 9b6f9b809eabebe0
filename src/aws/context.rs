//! Shared AWS configuration context.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::sync::Arc;

/// Loaded SDK configuration, shared by every per-kind provider.
#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
    region: String,
}

impl AwsContext {
    /// Loads credentials and settings from the environment, config files
    /// and instance roles. `region` overrides the configured default.
    pub async fn load(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let config = loader.load().await;
        let region = config.region().map(ToString::to_string).unwrap_or_default();

        Self {
            config: Arc::new(config),
            region,
        }
    }

    /// The resolved region; empty if none is configured.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Creates an EC2 client.
    #[must_use]
    pub fn ec2_client(&self) -> aws_sdk_ec2::Client {
        aws_sdk_ec2::Client::new(&self.config)
    }

    /// Creates a classic load balancing client.
    #[must_use]
    pub fn elb_client(&self) -> aws_sdk_elasticloadbalancing::Client {
        aws_sdk_elasticloadbalancing::Client::new(&self.config)
    }
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
