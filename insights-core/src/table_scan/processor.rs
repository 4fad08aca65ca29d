use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{TableScanMessage, TableScanService};
use crate::{
    dispatcher::MessageProcessor,
    error::Result,
    storage::{PrefixScanStep, TaskStateKey},
};

/// Runs one prefix scan step per message.
#[derive(Clone, Debug)]
pub struct TableScanStepProcessor {
    service: Arc<TableScanService>,
}

impl TableScanStepProcessor {
    pub fn new(service: Arc<TableScanService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageProcessor<TableScanMessage> for TableScanStepProcessor {
    async fn process(&self, message: &TableScanMessage, _delivery_count: u32) -> Result<()> {
        let task_states = self.service.task_states();
        let key = TaskStateKey::new(
            message.storage_suffix.clone(),
            message.scan_id.to_string(),
            message.task_row_key.clone(),
        );
        let Some(state) = task_states.get(&key).await? else {
            debug!(
                scan_id = %message.scan_id,
                task = %message.task_row_key,
                "table scan step already done"
            );
            return Ok(());
        };

        let driver = self.service.driver(message.driver_type)?;
        let produced = match &message.step {
            PrefixScanStep::Segment { .. } => vec![message.step.clone()],
            step => {
                self.service
                    .scanner(message.start.segments_for(step))
                    .execute_step(&message.source_table, step)
                    .await?
            }
        };

        let mut children = Vec::new();
        for step in produced {
            match step {
                PrefixScanStep::Segment { entities, .. } => {
                    if !entities.is_empty() {
                        driver
                            .process_entities(&message.driver_parameters, entities)
                            .await?;
                    }
                }
                step => children.push(step),
            }
        }

        if !children.is_empty() {
            let row_keys: Vec<String> = (0..children.len())
                .map(|i| format!("{}.{i}", message.task_row_key))
                .collect();
            task_states
                .add(&key.storage_suffix, &key.partition_key, &row_keys)
                .await?;
            let messages: Vec<TableScanMessage> = children
                .into_iter()
                .zip(row_keys)
                .map(|(step, task_row_key)| TableScanMessage {
                    task_row_key,
                    step,
                    ..message.clone()
                })
                .collect();
            self.service
                .enqueuer()
                .enqueue_individually(&messages, Default::default())
                .await?;
            debug!(
                scan_id = %message.scan_id,
                task = %message.task_row_key,
                children = messages.len(),
                "table scan step expanded"
            );
        }

        task_states.delete(&state).await?;
        Ok(())
    }
}
