//! Response pipeline tests against scripted services

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{FakeGenerator, FakeSynthesizer, Reply, World};
use stress_buddy::llm::ServiceRole;
use stress_buddy::pipeline::Stage;
use stress_buddy::voice::Synthesizer;
use stress_buddy::{Generator, Persona, Phase, PipelineError, ResponsePipeline, Session};

struct Fixture {
    session: Session,
    generator: Arc<FakeGenerator>,
    synthesizer: Arc<FakeSynthesizer>,
}

impl Fixture {
    fn new() -> Self {
        let world = Arc::new(Mutex::new(World::default()));
        Self {
            session: Session::new(&Persona::default()),
            generator: Arc::new(FakeGenerator::new(Arc::clone(&world))),
            synthesizer: Arc::new(FakeSynthesizer::new(world)),
        }
    }

    fn pipeline(&self) -> ResponsePipeline {
        ResponsePipeline::new(
            Arc::clone(&self.generator) as Arc<dyn Generator>,
            Arc::clone(&self.synthesizer) as Arc<dyn Synthesizer>,
            "en-US-terrell",
        )
    }
}

#[tokio::test(start_paused = true)]
async fn test_each_turn_appends_two_entries() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline();

    for n in 1..=3 {
        let reply = pipeline
            .run(&fx.session, &format!("message {n}"))
            .await
            .unwrap();
        assert_eq!(reply.message.text, format!("reply {n}"));
        assert_eq!(reply.audio_ref, format!("blob://{n}"));
        assert_eq!(fx.session.snapshot().turns.len(), 2 + 2 * n);
    }

    // Every request carries the whole conversation, ending with the user
    let histories = fx.generator.histories.lock().clone();
    assert_eq!(histories.len(), 3);
    assert_eq!(histories[2].len(), 7);
    assert_eq!(histories[2][0].role, ServiceRole::User);
    assert_eq!(histories[2][1].role, ServiceRole::Model);
    assert_eq!(histories[2][6].role, ServiceRole::User);
    assert_eq!(histories[2][6].text, "message 3");

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.current_audio_ref.as_deref(), Some("blob://3"));
    assert_eq!(snapshot.messages.len(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_reply_is_synthesized_with_configured_voice() {
    let fx = Fixture::new();
    fx.generator.reply("Take a deep breath.");

    fx.pipeline().run(&fx.session, "I'm stressed").await.unwrap();

    let calls = fx.synthesizer.calls.lock().clone();
    assert_eq!(
        calls,
        vec![("Take a deep breath.".to_string(), "en-US-terrell".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_generation_failure_keeps_user_turn() {
    let fx = Fixture::new();
    fx.generator.script(Reply::Fail);

    let err = fx.pipeline().run(&fx.session, "hello").await.unwrap_err();
    assert!(matches!(err, PipelineError::Generation(_)));
    assert!(err.is_service_failure());

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.turns.len(), 3);
    assert!(fx.synthesizer.calls.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_failure_keeps_reply_without_audio() {
    let fx = Fixture::new();
    fx.synthesizer.fail_next();

    let err = fx.pipeline().run(&fx.session, "hello").await.unwrap_err();
    assert!(matches!(err, PipelineError::Synthesis(_)));

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.turns.len(), 4);
    let reply = snapshot.messages.last().unwrap();
    assert!(!reply.is_user);
    assert_eq!(reply.audio_ref(), None);
    assert_eq!(snapshot.current_audio_ref, None);
}

#[tokio::test(start_paused = true)]
async fn test_slow_generation_times_out() {
    let fx = Fixture::new();
    *fx.generator.delay.lock() = Duration::from_secs(60);
    let pipeline = fx.pipeline().with_timeout(Some(Duration::from_secs(5)));

    let err = pipeline.run(&fx.session, "hello").await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::TimedOut {
            stage: Stage::Generation,
            ..
        }
    ));
    assert_eq!(fx.session.snapshot().phase, Phase::Idle);
    assert_eq!(fx.session.snapshot().turns.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_synthesis_times_out() {
    let fx = Fixture::new();
    *fx.synthesizer.delay.lock() = Duration::from_secs(60);
    let pipeline = fx.pipeline().with_timeout(Some(Duration::from_secs(5)));

    let err = pipeline.run(&fx.session, "hello").await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::TimedOut {
            stage: Stage::Synthesis,
            ..
        }
    ));
    assert_eq!(fx.session.snapshot().turns.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_blank_input_changes_nothing() {
    let fx = Fixture::new();

    let err = fx.pipeline().run(&fx.session, " \n\t ").await.unwrap_err();
    assert!(matches!(err, PipelineError::EmptyInput));
    assert!(!err.is_service_failure());
    assert_eq!(fx.generator.calls(), 0);
    assert_eq!(fx.session.snapshot().turns.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_turn_refused_while_listening() {
    let fx = Fixture::new();
    fx.session
        .update(|s| s.transition(Phase::Listening))
        .unwrap();

    let err = fx.pipeline().run(&fx.session, "hello").await.unwrap_err();
    assert!(matches!(err, PipelineError::Busy(Phase::Listening)));
    assert_eq!(fx.generator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reset_during_generation_discards_reply() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline();

    let turn = fx.session.update(|s| pipeline.begin(s, "hello")).unwrap();
    fx.session.update(|s| s.reset_conversation());

    let err = pipeline.complete(&fx.session, turn).await.unwrap_err();
    assert!(matches!(err, PipelineError::Stale));
    assert!(!err.is_service_failure());

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.turns.len(), 2);
    assert!(fx.synthesizer.calls.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reset_during_generation_keeps_reply_when_configured() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline().discard_stale_results(false);

    let turn = fx.session.update(|s| pipeline.begin(s, "hello")).unwrap();
    fx.session.update(|s| s.reset_conversation());

    let reply = pipeline.complete(&fx.session, turn).await.unwrap();
    assert_eq!(reply.audio_ref, "blob://1");

    // The reply lands on top of the fresh opener
    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.turns.len(), 3);
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.messages[1].audio_ref(), Some("blob://1"));
}
