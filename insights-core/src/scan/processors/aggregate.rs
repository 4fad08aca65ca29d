use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    dispatcher::MessageProcessor,
    error::{InsightsError, Result},
    scan::{context::CatalogScanContext, messages::AggregateBucketMessage},
    storage::TaskStateKey,
};

/// Aggregates one bucket and clears its task state.
#[derive(Clone, Debug)]
pub struct AggregateBucketProcessor {
    context: CatalogScanContext,
}

impl AggregateBucketProcessor {
    pub fn new(context: CatalogScanContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageProcessor<AggregateBucketMessage> for AggregateBucketProcessor {
    async fn process(&self, message: &AggregateBucketMessage, _delivery_count: u32) -> Result<()> {
        let key = TaskStateKey::new(
            message.storage_suffix.clone(),
            message.scan_id.to_string(),
            message.bucket.to_string(),
        );
        let Some(task_state) = self.context.task_states.get(&key).await? else {
            debug!(bucket = message.bucket, "aggregate bucket already complete");
            return Ok(());
        };

        let Some(scan) = self
            .context
            .storage
            .get_index_scan(message.driver_type, message.scan_id)
            .await?
        else {
            return Err(InsightsError::NotFound(format!(
                "index scan {} for aggregate bucket {}",
                message.scan_id, message.bucket
            )));
        };

        let registered = self.context.drivers.get(message.driver_type)?;
        let aggregatable = registered.driver.as_aggregatable().ok_or_else(|| {
            InsightsError::InvalidArgument(format!(
                "{} does not support aggregation",
                message.driver_type
            ))
        })?;

        aggregatable.aggregate(&scan.row, message.bucket).await?;
        self.context.task_states.delete(&task_state).await?;
        info!(scan_id = %message.scan_id, bucket = message.bucket, "bucket aggregated");
        Ok(())
    }
}
