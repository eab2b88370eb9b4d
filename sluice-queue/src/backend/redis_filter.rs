use async_trait::async_trait;
use rustis::client::Client;
use rustis::commands::{GenericCommands, SetCommands};

use crate::{DuplicateFilter, TaskQueueError};

/// Duplicate filter shared between processes through a Redis set.
/// `SADD` reports whether the member was new, which gives the atomic
/// add-if-absent step.
pub struct RedisDuplicateFilter {
    pub client: Client,
    pub set_key: String,
}

impl RedisDuplicateFilter {
    pub fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            set_key: format!("{}:{}", name, "fingerprints"),
        }
    }
}

#[async_trait]
impl DuplicateFilter for RedisDuplicateFilter {
    async fn seen(&self, fingerprint: &str) -> Result<bool, TaskQueueError> {
        let added: usize = self.client.sadd(&self.set_key, fingerprint).await?;
        Ok(added == 0)
    }

    async fn contains(&self, fingerprint: &str) -> Result<bool, TaskQueueError> {
        Ok(self.client.sismember(&self.set_key, fingerprint).await?)
    }

    async fn forget(&self, fingerprint: &str) -> Result<(), TaskQueueError> {
        self.client.srem(&self.set_key, fingerprint).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), TaskQueueError> {
        self.client.del(&self.set_key).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, TaskQueueError> {
        Ok(self.client.scard(&self.set_key).await?)
    }

    async fn fingerprints(&self) -> Result<Vec<String>, TaskQueueError> {
        let mut fps: Vec<String> = self.client.smembers(&self.set_key).await?;
        fps.sort();
        Ok(fps)
    }

    async fn restore(
        &self,
        fingerprints: Vec<String>,
    ) -> Result<(), TaskQueueError> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        self.client.sadd(&self.set_key, fingerprints).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisDuplicateFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDuplicateFilter")
            .field("set_key", &self.set_key)
            .finish()
    }
}
