//! Integration tests for the narration pipeline.
//!
//! Drives a full session against scripted collaborators on a paused clock.

mod common;

use common::*;
use paper_narrator::mixer;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(60);

fn block_ids(narrator: &TestNarrator) -> Vec<String> {
    narrator
        .session
        .scheduler()
        .in_flight()
        .into_iter()
        .map(|segment| segment.block_id)
        .collect()
}

/// Test a one-section paper plays through to Completed.
#[tokio::test(start_paused = true)]
async fn test_single_section_plays_to_completion() {
    let mocks = Mocks::paper(&["Introduction"]);
    let narrator = TestNarrator::new(&mocks).await;
    let _output = mixer::init(narrator.session.scheduler().clone(), MOCK_RATE);

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    let state = wait_for_state(&narrator.session, WAIT, |state| {
        state.phase == Phase::Completed
            && state
                .sections
                .iter()
                .all(|section| section.status == SectionStatus::Completed)
    })
    .await;

    assert!(state.active_block.is_none());
    assert!(state.error.is_none());
    assert_eq!(state.parse_progress, 100);
    assert!(narrator.session.scheduler().is_idle());

    let document = narrator.session.document();
    let document = document.lock().unwrap();
    assert_eq!(document.progress(), 1.0);
    let block = document.find_block("section-1-block-0").unwrap();
    assert_eq!(block.content, "This is the text of Introduction.");
    assert!(block.has_audio());
}

/// Test segments across sections are scheduled back to back.
#[tokio::test(start_paused = true)]
async fn test_segments_are_scheduled_contiguously() {
    let mocks = Mocks::paper(&["Introduction", "Methods", "Results"]);
    let narrator = TestNarrator::new(&mocks).await;

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    let segments = narrator.session.scheduler().in_flight();
    assert_eq!(
        block_ids(&narrator),
        vec!["section-1-block-0", "section-2-block-0", "section-3-block-0"]
    );

    for pair in segments.windows(2) {
        let expected = pair[0].start_at + pair[0].duration_secs / pair[0].rate;
        assert!(
            (pair[1].start_at - expected).abs() < 1e-6,
            "gap between {} and {}",
            pair[0].block_id,
            pair[1].block_id
        );
    }
}

/// Test a failed section detection narrates the whole paper as one section.
#[tokio::test(start_paused = true)]
async fn test_extraction_failure_falls_back_to_one_section() {
    let mut mocks = Mocks::paper(&["Introduction", "Methods"]);
    mocks.extractor = Arc::new(MockExtractor::failing());
    let narrator = TestNarrator::new(&mocks).await;
    let mut events = narrator.bus.subscribe();

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    let events = drain_events(&mut events);
    assert_event_received!(
        events,
        Event::Pipeline(PipelineEvent::SectionsDetected {
            count: 1,
            fallback: true
        })
    );

    let state = narrator.session.snapshot();
    assert_eq!(state.sections.len(), 1);
    assert_eq!(state.sections[0].title, FALLBACK_SECTION_TITLE);
    assert_eq!((state.sections[0].page_start, state.sections[0].page_end), (1, 2));
    assert_eq!(mocks.processor.titles(), vec![FALLBACK_SECTION_TITLE]);
    assert_eq!(block_ids(&narrator).len(), 2);
}

/// Test a processor failure reads the section's raw text instead.
#[tokio::test(start_paused = true)]
async fn test_processor_failure_reads_raw_text() {
    let mut mocks = Mocks::layout(
        &["Raw [1] text\n12 of the introduction."],
        &[("Introduction", 1, 1)],
    );
    mocks.processor = Arc::new(MockProcessor::failing("section-1"));
    let narrator = TestNarrator::new(&mocks).await;

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    let document = narrator.session.document();
    let document = document.lock().unwrap();
    let blocks = document.blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].kind, BlockKind::Text);
    assert_eq!(blocks[0].content, "Raw text of the introduction.");
    assert!(blocks[0].has_audio());
}

/// Test a block whose synthesis fails is skipped without stopping the run.
#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_skips_block() {
    let mocks = Mocks {
        synthesizer: Arc::new(MockSynthesizer {
            fail_marker: Some("Methods".to_string()),
            ..Default::default()
        }),
        ..Mocks::paper(&["Introduction", "Methods", "Results"])
    };
    let narrator = TestNarrator::new(&mocks).await;

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    assert_eq!(
        block_ids(&narrator),
        vec!["section-1-block-0", "section-3-block-0"]
    );
    let document = narrator.session.document();
    let document = document.lock().unwrap();
    assert!(!document.find_block("section-2-block-0").unwrap().has_audio());
    assert!(narrator.session.snapshot().error.is_none());
}

/// Test a rejected LLM key on section 2 of 3 aborts the run but keeps section 1 playable.
#[tokio::test(start_paused = true)]
async fn test_rejected_llm_key_aborts_run() {
    let mut mocks = Mocks::paper(&["Introduction", "Methods", "Results"]);
    mocks.processor = Arc::new(MockProcessor::rejecting("section-2"));
    let narrator = TestNarrator::new(&mocks).await;

    assert_eq!(
        narrator.run().await,
        PipelineOutcome::InvalidCredential {
            provider: "LLM".to_string()
        }
    );

    let state = narrator.session.snapshot();
    assert_eq!(state.phase, Phase::Error);
    assert_eq!(state.error.as_deref(), Some(INVALID_CREDENTIAL_MESSAGE));
    assert!(state.credentials_required);

    assert!(!mocks.processor.calls().contains(&"section-3".to_string()));
    assert_eq!(block_ids(&narrator), vec!["section-1-block-0"]);

    // No retry until new keys are entered
    assert!(!narrator.session.has_credentials());
    assert!(narrator.session.start("paper.pdf").is_err());

    narrator
        .session
        .set_credentials(Credentials::new("new-llm", "new-tts"))
        .await
        .unwrap();
    let state = narrator.session.snapshot();
    assert!(!state.credentials_required);
    assert!(state.error.is_none());
    assert!(narrator.session.has_credentials());
}

/// Test a rejected TTS key aborts the run too.
#[tokio::test(start_paused = true)]
async fn test_rejected_tts_key_aborts_run() {
    let mocks = Mocks {
        synthesizer: Arc::new(MockSynthesizer {
            reject_marker: Some("Methods".to_string()),
            ..Default::default()
        }),
        ..Mocks::paper(&["Introduction", "Methods"])
    };
    let narrator = TestNarrator::new(&mocks).await;
    let mut events = narrator.bus.subscribe();

    assert_eq!(
        narrator.run().await,
        PipelineOutcome::InvalidCredential {
            provider: "TTS".to_string()
        }
    );

    let events = drain_events(&mut events);
    assert_event_received!(events, Event::Pipeline(PipelineEvent::Aborted { .. }));
    assert_event_not_received!(events, Event::Pipeline(PipelineEvent::Completed));
    assert_eq!(narrator.session.snapshot().phase, Phase::Error);
}

/// Test an unreadable PDF surfaces the parser's message.
#[tokio::test(start_paused = true)]
async fn test_parse_failure_is_reported() {
    let mut mocks = Mocks::paper(&["Introduction"]);
    mocks.parser = Arc::new(MockParser::failing("file is encrypted"));
    let narrator = TestNarrator::new(&mocks).await;

    match narrator.run().await {
        PipelineOutcome::Failed(message) => assert!(message.contains("file is encrypted")),
        other => panic!("Expected a failure, got {other:?}"),
    }

    let state = narrator.session.snapshot();
    assert_eq!(state.phase, Phase::Error);
    assert!(state.error.unwrap().contains("file is encrypted"));
    assert!(mocks.processor.calls().is_empty());

    narrator.session.dismiss_error();
    assert_eq!(narrator.session.snapshot().phase, Phase::Idle);
}

/// Test a PDF without pages fails instead of narrating nothing.
#[tokio::test(start_paused = true)]
async fn test_empty_document_fails() {
    let mocks = Mocks::layout(&[], &[]);
    let narrator = TestNarrator::new(&mocks).await;

    assert!(matches!(narrator.run().await, PipelineOutcome::Failed(_)));
    assert_eq!(narrator.session.snapshot().phase, Phase::Error);
}

/// Test reset cancels in-flight work and discards late results.
#[tokio::test(start_paused = true)]
async fn test_reset_cancels_run() {
    let mocks = Mocks {
        synthesizer: Arc::new(MockSynthesizer {
            delay: Duration::from_secs(1),
            ..Default::default()
        }),
        ..Mocks::paper(&["Introduction", "Methods"])
    };
    let narrator = TestNarrator::new(&mocks).await;

    let handle = narrator.session.start("paper.pdf").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    narrator.session.reset();

    assert_eq!(handle.await.unwrap(), PipelineOutcome::Cancelled);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let state = narrator.session.snapshot();
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.sections.is_empty());
    assert!(narrator.session.scheduler().is_idle());
    assert!(narrator.session.document().lock().unwrap().sections.is_empty());
    assert_eq!(mocks.synthesizer.calls().len(), 1);
}

/// Test a new run after reset starts from a clean schedule.
#[tokio::test(start_paused = true)]
async fn test_restart_after_reset() {
    let mocks = Mocks::paper(&["Introduction"]);
    let narrator = TestNarrator::new(&mocks).await;

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);
    tokio::time::sleep(Duration::from_secs(3)).await;
    narrator.session.reset();
    assert!(narrator.session.scheduler().next_start().is_none());

    let restarted_at = narrator.session.scheduler().clock().now();
    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    let segments = narrator.session.scheduler().in_flight();
    assert_eq!(segments.len(), 1);
    assert!(segments[0].start_at >= restarted_at + 0.1 - 1e-6);
    assert_eq!(mocks.processor.calls(), vec!["section-1", "section-1"]);
}

/// Test a voice change applies to blocks synthesized afterwards.
#[tokio::test(start_paused = true)]
async fn test_voice_change_applies_to_later_blocks() {
    let mocks = Mocks {
        synthesizer: Arc::new(MockSynthesizer {
            delay: Duration::from_millis(100),
            ..Default::default()
        }),
        ..Mocks::layout(
            &["First page.", "Second page.", "Third page."],
            &[("Introduction", 1, 3)],
        )
    };
    let narrator = TestNarrator::new(&mocks).await;

    let handle = narrator.session.start("paper.pdf").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    narrator.session.set_voice(Voice::NarratorB);
    assert_eq!(handle.await.unwrap(), PipelineOutcome::Completed);

    let voices: Vec<Voice> = mocks
        .synthesizer
        .calls()
        .into_iter()
        .map(|(_, voice)| voice)
        .collect();
    assert_eq!(
        voices,
        vec![Voice::NarratorA, Voice::NarratorA, Voice::NarratorB]
    );
    assert_eq!(narrator.session.snapshot().voice, Voice::NarratorB);
}

/// Test the next section is processed exactly once and played in order,
/// whether the prefetcher or the orchestrator got to it first.
#[tokio::test(start_paused = true)]
async fn test_next_section_is_processed_once() {
    let mocks = Mocks {
        synthesizer: Arc::new(MockSynthesizer {
            delay: Duration::from_millis(100),
            ..Default::default()
        }),
        ..Mocks::layout(
            &["One.", "Two.", "Three.", "Four.", "Five."],
            &[("Introduction", 1, 3), ("Methods", 4, 5)],
        )
    };
    let narrator = TestNarrator::new(&mocks).await;
    let mut events = narrator.bus.subscribe();

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    assert_eq!(mocks.processor.calls(), vec!["section-1", "section-2"]);
    assert_eq!(mocks.synthesizer.calls().len(), 5);
    assert_eq!(
        block_ids(&narrator),
        vec![
            "section-1-block-0",
            "section-1-block-1",
            "section-1-block-2",
            "section-2-block-0",
            "section-2-block-1",
        ]
    );

    let events = drain_events(&mut events);
    assert_event_received!(events, Event::Pipeline(PipelineEvent::SectionReady { index: 1 }));
    assert_event_received!(events, Event::Playback(PlaybackEvent::SectionStarted { index: 0 }));
}

/// Test section statuses move through playing to completed as audio plays.
#[tokio::test(start_paused = true)]
async fn test_sections_complete_in_order() {
    let mocks = Mocks::paper(&["Introduction", "Methods"]);
    let narrator = TestNarrator::new(&mocks).await;
    let mut events = narrator.bus.subscribe();
    let _output = mixer::init(narrator.session.scheduler().clone(), MOCK_RATE);

    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    wait_for_state(&narrator.session, WAIT, |state| {
        state.sections.len() == 2 && state.sections[0].status == SectionStatus::Completed
            && state.sections[1].status == SectionStatus::Playing
    })
    .await;

    let state = wait_for_state(&narrator.session, WAIT, |state| {
        state
            .sections
            .iter()
            .all(|section| section.status == SectionStatus::Completed)
    })
    .await;
    assert_eq!(state.current_section, 1);

    let started: Vec<usize> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            Event::Playback(PlaybackEvent::SectionStarted { index }) => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![0, 1]);
}

/// Test playback controls reach the scheduler.
#[tokio::test(start_paused = true)]
async fn test_playback_controls() {
    let mocks = Mocks::paper(&["Introduction", "Methods"]);
    let narrator = TestNarrator::new(&mocks).await;
    assert_eq!(narrator.run().await, PipelineOutcome::Completed);

    let session = &narrator.session;
    assert_eq!(session.snapshot().phase, Phase::Playing);

    session.toggle_play_pause();
    assert!(session.scheduler().is_paused());
    assert_eq!(session.snapshot().phase, Phase::Paused);

    session.toggle_play_pause();
    assert!(!session.scheduler().is_paused());
    assert_eq!(session.snapshot().phase, Phase::Playing);

    session.set_playback_rate(1.5);
    assert_eq!(session.snapshot().playback_rate, 1.5);
    assert!(session
        .scheduler()
        .in_flight()
        .iter()
        .all(|segment| segment.rate == 1.5));

    session.handle_control(paper_narrator::event::ControlAction::ToggleVoice);
    assert_eq!(session.snapshot().voice, Voice::NarratorB);
}

/// Test a run refuses to start without credentials.
#[tokio::test(start_paused = true)]
async fn test_start_requires_credentials() {
    let mocks = Mocks::paper(&["Introduction"]);
    let narrator = TestNarrator::without_credentials(&mocks).await;

    assert!(narrator.session.snapshot().credentials_required);
    assert!(narrator.session.start("paper.pdf").is_err());
    assert!(mocks.processor.calls().is_empty());
}

/// Test a reset racing the pipeline on other workers never leaves audio or
/// sections of the stopped run behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_race_leaves_nothing_behind() {
    let mocks = Mocks::paper(&["Introduction", "Methods", "Results", "Discussion"]);
    let narrator = TestNarrator::new(&mocks).await;

    for attempt in 0..50u64 {
        let handle = narrator.session.start("paper.pdf").unwrap();
        tokio::time::sleep(Duration::from_micros(attempt * 20)).await;
        narrator.session.reset();

        // Once the run has returned nothing of it can write anymore
        let _ = handle.await.unwrap();
        assert!(
            narrator.session.scheduler().is_idle(),
            "audio left over after reset on attempt {attempt}"
        );
        assert!(narrator.session.scheduler().next_start().is_none());
        assert!(narrator.session.document().lock().unwrap().sections.is_empty());
    }
}
