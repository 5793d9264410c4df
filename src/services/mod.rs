pub mod dates;
pub mod direct;
pub mod extraction;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod records;
pub mod retry;
pub mod taxonomy;
pub mod validation;
