use anyhow::Result;

use crate::aggregators::processor::{AggregatorsProcessorInput, AggregatorsProcessorOutput};
use crate::backup::processor::{BackupProcessorInput, BackupProcessorOutput};
use crate::utils::app_config::AppConfig;
use crate::utils::traits::ActionProcessor;

pub enum ActionRouterInput {
    Aggregators(AggregatorsProcessorInput),
    Backup(BackupProcessorInput),
}

#[derive(Debug)]
pub enum ActionRouterOutput {
    Aggregators(AggregatorsProcessorOutput),
    Backup(BackupProcessorOutput),
}

impl ActionRouterInput {
    pub async fn process(&self, app_config: &AppConfig) -> Result<ActionRouterOutput> {
        match self {
            ActionRouterInput::Aggregators(processor) => {
                let mut config = app_config.aggregators.clone();
                let res = processor.process(app_config, &mut config).await?;
                Ok(ActionRouterOutput::Aggregators(res))
            }
            ActionRouterInput::Backup(processor) => {
                let mut config = app_config.backup.clone();
                let res = processor.process(app_config, &mut config).await?;
                Ok(ActionRouterOutput::Backup(res))
            }
        }
    }
}
