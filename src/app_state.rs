use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::retrying::Persistence;
use crate::db::ResumeStore;
use crate::services::{
    direct::DirectProcessor,
    extraction::ExtractionPipeline,
    llm::LlmService,
    orchestrator::BatchOrchestrator,
    taxonomy::Taxonomy,
    validation::{FieldValidator, ProcessingDate},
};

/// Shared components built once per process and handed to whichever mode runs.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub llm: Arc<dyn LlmService>,
    pub taxonomy: Arc<Taxonomy>,
    pub persistence: Persistence,
    pub pipeline: ExtractionPipeline,
    pub validator: FieldValidator,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ResumeStore>,
        llm: Arc<dyn LlmService>,
        taxonomy: Taxonomy,
    ) -> Self {
        let taxonomy = Arc::new(taxonomy);
        let persistence = Persistence::new(store, config.db_retry_policy());
        let pipeline = ExtractionPipeline::new(
            Arc::clone(&llm),
            Arc::clone(&taxonomy),
            config.pipeline_settings(),
        );
        let validator = FieldValidator::new(Arc::clone(&taxonomy), ProcessingDate::Today);

        Self {
            config,
            llm,
            taxonomy,
            persistence,
            pipeline,
            validator,
        }
    }

    pub fn direct_processor(&self) -> DirectProcessor {
        DirectProcessor::new(
            self.pipeline.clone(),
            self.validator.clone(),
            self.persistence.clone(),
            self.config.workers,
        )
    }

    pub fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(
            Arc::clone(&self.llm),
            self.pipeline.clone(),
            self.validator.clone(),
            self.persistence.clone(),
            self.config.orchestrator_settings(),
        )
    }
}
