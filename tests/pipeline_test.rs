//! Direct-mode processing against in-memory collaborators

mod fixtures;
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use fixtures::*;
use helpers::*;
use resume_extract::models::field::Field;
use resume_extract::models::resume::UserId;
use resume_extract::services::direct::DirectProcessor;
use resume_extract::services::extraction::{ExtractionMode, ExtractionPipeline, PipelineSettings};
use resume_extract::services::taxonomy::Taxonomy;
use resume_extract::services::llm::LlmError;
use resume_extract::services::records::Stage;
use tokio::sync::watch;

fn processor(store: &Arc<MemoryStore>, llm: &Arc<ScriptedLlm>, mode: ExtractionMode) -> DirectProcessor {
    DirectProcessor::new(
        pipeline(Arc::clone(llm), mode),
        validator("2026-10-18"),
        persistence(Arc::clone(store)),
        4,
    )
}

#[tokio::test]
async fn test_current_role_at_acme_is_extracted_and_marked_processed() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(42, ACME_RESUME);
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_completion(acme_reply());

    let success = processor(&store, &llm, ExtractionMode::OneStep)
        .process_user(UserId(42))
        .await
        .expect("record processed");
    assert_eq!(success.user_id, UserId(42));

    let stored = store.resume(42).unwrap();
    assert!(stored.last_processed.is_some());
    let fields = stored.fields.unwrap();
    assert_eq!(fields.get(Field::PrimarySoftwareLanguage).as_text(), Some("Java"));
    assert_eq!(fields.get(Field::MostRecentCompany).as_text(), Some("Acme"));
    assert_eq!(
        fields.get(Field::MostRecentStartDate).as_date(),
        NaiveDate::from_ymd_opt(2020, 1, 1)
    );
    assert!(fields.get(Field::MostRecentEndDate).is_null());
    assert!(stored
        .flags
        .iter()
        .all(|(field, _)| !matches!(field, Field::PrimarySoftwareLanguage | Field::MostRecentCompany)));

    let requests = llm.requests();
    assert_eq!(requests.len(), 1);
    let resume_message = requests[0].messages.last().unwrap();
    assert!(resume_message.content.starts_with("RESUME:\n"));
    assert!(resume_message.content.contains("Acme Corp"));
}

#[tokio::test]
async fn test_two_step_passes_first_pass_background_to_second() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(7, ACME_RESUME);
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_completion(
        r#"{"MostRecentCompany": "Acme", "MostRecentStartDate": "2020-01",
            "PrimaryTitle": "Senior Software Engineer", "PrimaryIndustry": "Information Technology",
            "TopSkills": "Java, PostgreSQL"}"#,
    );
    llm.push_completion(r#"{"PrimarySoftwareLanguage": "Java", "Skill1": "Java"}"#);

    processor(&store, &llm, ExtractionMode::TwoStep)
        .process_user(UserId(7))
        .await
        .expect("record processed");

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    let background = requests[1]
        .messages
        .iter()
        .find(|m| m.content.starts_with("BACKGROUND FROM THE FIRST PASS:"))
        .expect("second pass carries background");
    assert!(background.content.contains("Senior Software Engineer"));
    assert!(background.content.contains("Acme"));

    let fields = store.resume(7).unwrap().fields.unwrap();
    assert_eq!(fields.get(Field::MostRecentCompany).as_text(), Some("Acme"));
    assert_eq!(fields.get(Field::PrimarySoftwareLanguage).as_text(), Some("Java"));
}

#[tokio::test]
async fn test_malformed_reply_is_reported_and_record_stays_unprocessed() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(5, ACME_RESUME);
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_completion("{\"MostRecentCompany\": \"Acme\", ");

    let report = processor(&store, &llm, ExtractionMode::OneStep)
        .run_batch(10)
        .await
        .unwrap();

    assert_eq!(report.attempted(), 1);
    assert_eq!(report.failed.len(), 1);
    let failure = &report.failed[0];
    assert_eq!(failure.user_id, Some(UserId(5)));
    assert_eq!(failure.stage, Stage::Parse);
    assert!(!failure.terminal);
    assert!(store.resume(5).unwrap().last_processed.is_none());
}

#[tokio::test]
async fn test_batch_processes_every_unprocessed_record() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=5 {
        store.insert_resume(id, ACME_RESUME);
    }
    let llm = Arc::new(ScriptedLlm::new());
    llm.set_fallback(short_reply("Globex"));

    let processor = processor(&store, &llm, ExtractionMode::OneStep);
    let report = processor.run_batch(3).await.unwrap();
    assert_eq!(report.succeeded.len(), 3);
    assert!(report.failed.is_empty());

    let report = processor.run_batch(10).await.unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(store.processed_ids(), vec![1, 2, 3, 4, 5]);

    let report = processor.run_batch(10).await.unwrap();
    assert_eq!(report.attempted(), 0);
}

#[tokio::test]
async fn test_quota_exhaustion_stops_the_run() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=3 {
        store.insert_resume(id, ACME_RESUME);
    }
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_error(LlmError::Quota("You exceeded your current quota".into()));

    let processor = DirectProcessor::new(
        pipeline(Arc::clone(&llm), ExtractionMode::OneStep),
        validator("2026-10-18"),
        persistence(Arc::clone(&store)),
        1,
    );
    let report = processor.run_batch(10).await.unwrap();

    assert!(report.has_terminal_failure());
    assert!(report.failed.iter().any(|f| f.terminal && f.stage == Stage::Extract));
    assert!(store.processed_ids().is_empty());
}

#[tokio::test]
async fn test_unknown_user_fails_at_fetch() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(ScriptedLlm::new());

    let failure = processor(&store, &llm, ExtractionMode::OneStep)
        .process_user(UserId(404))
        .await
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Fetch);
    assert!(failure.to_string().contains("user 404"));
    assert!(llm.requests().is_empty());
}

#[tokio::test]
async fn test_prompt_over_the_input_budget_is_not_sent() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(8, ACME_RESUME);
    let llm = Arc::new(ScriptedLlm::new());
    let pipeline = ExtractionPipeline::new(
        llm.clone(),
        Arc::new(Taxonomy::builtin().expect("builtin taxonomy")),
        PipelineSettings {
            model: "test-model".to_string(),
            temperature: 0.0,
            max_output_tokens: 2048,
            max_input_tokens: 10,
            mode: ExtractionMode::OneStep,
        },
    );

    let failure = DirectProcessor::new(pipeline, validator("2026-10-18"), persistence(Arc::clone(&store)), 1)
        .process_user(UserId(8))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Extract);
    assert!(failure.message.contains("input budget"));
    assert!(llm.requests().is_empty());
    assert!(store.resume(8).unwrap().last_processed.is_none());
}

// ── Continuous mode ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_failing_record_is_attempted_once_per_run() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(1, ACME_RESUME);
    let llm = Arc::new(ScriptedLlm::new());
    llm.set_fallback("{\"MostRecentCompany\": ");

    let processor = processor(&store, &llm, ExtractionMode::OneStep);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move {
        processor
            .run_continuous(10, Duration::from_secs(60), None, shutdown_rx)
            .await
    });

    tokio::time::sleep(Duration::from_secs(300)).await;
    shutdown_tx.send(true).unwrap();
    let report = run.await.unwrap().unwrap();

    assert_eq!(llm.requests().len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].stage, Stage::Parse);
    assert!(store.resume(1).unwrap().last_processed.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_continuous_drains_backlog_then_waits_for_new_work() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=3 {
        store.insert_resume(id, ACME_RESUME);
    }
    let llm = Arc::new(ScriptedLlm::new());
    llm.set_fallback(short_reply("Globex"));

    let processor = processor(&store, &llm, ExtractionMode::OneStep);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move {
        processor
            .run_continuous(2, Duration::from_secs(60), None, shutdown_rx)
            .await
    });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.processed_ids(), vec![1, 2, 3]);

    // Picked up after the idle wait.
    store.insert_resume(4, ACME_RESUME);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(store.processed_ids(), vec![1, 2, 3, 4]);

    shutdown_tx.send(true).unwrap();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.succeeded.len(), 4);
    assert!(report.failed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_max_batches_bounds_the_run() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=5 {
        store.insert_resume(id, ACME_RESUME);
    }
    let llm = Arc::new(ScriptedLlm::new());
    llm.set_fallback(short_reply("Globex"));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = processor(&store, &llm, ExtractionMode::OneStep)
        .run_continuous(2, Duration::from_secs(60), Some(2), shutdown_rx)
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 4);
    assert_eq!(store.processed_ids().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_stops_on_terminal_failure() {
    let store = Arc::new(MemoryStore::new());
    store.insert_resume(1, ACME_RESUME);
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_error(LlmError::Auth {
        status: 401,
        message: "Incorrect API key provided".into(),
    });
    llm.set_fallback(short_reply("Globex"));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = processor(&store, &llm, ExtractionMode::OneStep)
        .run_continuous(10, Duration::from_secs(60), None, shutdown_rx)
        .await
        .unwrap();

    assert!(report.has_terminal_failure());
    assert_eq!(llm.requests().len(), 1);
    assert!(store.processed_ids().is_empty());
}
