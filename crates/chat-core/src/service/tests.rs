use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use robochat_llm::{Chunk, ModelRef, Role as ProviderRole, ScriptStep, ScriptedProvider};
use robochat_storage::{BlockRecordStatus, MessageId, TopicId};

use super::*;
use crate::error::ServiceError;
use crate::store::StoreEvent;
use crate::test_support::RecordingStorage;

const THROTTLE: Duration = Duration::from_millis(10);

struct Harness {
    service: MessageService,
    storage: Arc<RecordingStorage>,
    provider: Arc<ScriptedProvider>,
    robot: Robot,
    topic_id: TopicId,
}

impl Harness {
    async fn new(provider: ScriptedProvider) -> Self {
        let storage = RecordingStorage::open().await;
        let provider = Arc::new(provider);
        let service = MessageService::new(
            storage.clone(),
            ProviderRegistry::new().with_provider(provider.clone()),
            ServiceOptions {
                throttle_interval: THROTTLE,
            },
        );
        let mut robot = Robot::new("tester", ModelRef::new("scripted", "echo"));
        let topic = service
            .create_topic(&mut robot, "test topic")
            .await
            .expect("topic created");
        Self {
            service,
            storage,
            provider,
            robot,
            topic_id: topic.id,
        }
    }

    async fn send(&self, text: &str) -> (MessageId, Vec<MessageId>) {
        self.send_message(user_text_message(self.topic_id, text)).await
    }

    async fn send_message(
        &self,
        (message, blocks): (Message, Vec<MessageBlock>),
    ) -> (MessageId, Vec<MessageId>) {
        let ask_id = message.id;
        let assistant_ids = self
            .service
            .send_message(self.topic_id, message, blocks, &self.robot)
            .await
            .expect("message accepted");
        (ask_id, assistant_ids)
    }

    async fn settle(&self) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.service.wait_for_topic(self.topic_id),
        )
        .await
        .expect("topic queue drained");
    }

    fn message(&self, message_id: MessageId) -> Message {
        self.service
            .messages()
            .message(message_id)
            .expect("message present")
    }

    fn blocks_of(&self, message_id: MessageId) -> Vec<MessageBlock> {
        self.message(message_id)
            .blocks
            .iter()
            .map(|block_id| {
                self.service
                    .blocks()
                    .block(*block_id)
                    .expect("referenced block present")
            })
            .collect()
    }

    /// A second service over the same database, with the topic freshly loaded.
    async fn reloaded(&self) -> MessageService {
        let service = MessageService::new(
            self.storage.clone(),
            ProviderRegistry::new(),
            ServiceOptions::default(),
        );
        service
            .load_topic_messages(self.topic_id, false)
            .await
            .expect("topic loads");
        service
    }

    async fn wait_until(&self, condition: impl Fn(&MessageService) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition(&self.service) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn emit(chunks: impl IntoIterator<Item = Chunk>) -> Vec<ScriptStep> {
    chunks.into_iter().map(ScriptStep::Emit).collect()
}

fn summary(blocks: &[MessageBlock]) -> Vec<(BlockKind, BlockStatus)> {
    blocks
        .iter()
        .map(|block| (block.kind.clone(), block.status))
        .collect()
}

fn stored_blocks(service: &MessageService, message: &Message) -> Vec<MessageBlock> {
    message
        .blocks
        .iter()
        .filter_map(|block_id| service.blocks().block(*block_id))
        .collect()
}

#[tokio::test]
async fn happy_path_streams_into_one_main_text_block() {
    let harness = Harness::new(ScriptedProvider::fixed(emit([
        Chunk::ResponseCreated,
        Chunk::text_delta("Hel"),
        Chunk::text_delta("lo"),
        Chunk::text_complete("Hello"),
        Chunk::BlockComplete { response: None },
    ])))
    .await;
    let mut events = harness.service.messages().subscribe();

    let (ask_id, assistant_ids) = harness.send("hi").await;
    harness.settle().await;

    assert_eq!(assistant_ids.len(), 1);
    let assistant = harness.message(assistant_ids[0]);
    assert_eq!(assistant.status, MessageStatus::Success);
    assert_eq!(assistant.ask_id, Some(ask_id));
    assert!(assistant.metrics.is_some());
    assert_eq!(
        summary(&harness.blocks_of(assistant.id)),
        vec![(BlockKind::main_text("Hello"), BlockStatus::Success)]
    );
    assert_eq!(harness.service.messages().streaming_message_id(), None);
    assert!(!harness.service.messages().is_topic_loading(harness.topic_id));

    let mut streaming = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::StreamingMessageChanged { message_id } = event {
            streaming.push(message_id);
        }
    }
    assert_eq!(streaming, vec![Some(assistant.id), None]);

    let requests = harness.provider.requests();
    let request = &requests[0];
    assert_eq!(request.model_id, "echo");
    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0].content, "hi");
    assert_eq!(request.preamble, None);

    let reloaded = harness.reloaded().await;
    let messages = reloaded.messages().messages_for_topic(harness.topic_id);
    assert_eq!(
        messages.iter().map(|message| message.id).collect::<Vec<_>>(),
        vec![ask_id, assistant.id]
    );
    assert_eq!(messages[1].status, MessageStatus::Success);
    assert_eq!(
        summary(&stored_blocks(&reloaded, &messages[1])),
        vec![(BlockKind::main_text("Hello"), BlockStatus::Success)]
    );
    assert_eq!(
        summary(&stored_blocks(&reloaded, &messages[0])),
        vec![(BlockKind::main_text("hi"), BlockStatus::Success)]
    );
}

#[tokio::test]
async fn thinking_then_text_yields_two_finished_blocks() {
    let harness = Harness::new(ScriptedProvider::fixed(emit([
        Chunk::thinking_delta("Let me", 5),
        Chunk::thinking_delta(" think", 9),
        Chunk::text_delta("Answer"),
        Chunk::BlockComplete { response: None },
    ])))
    .await;

    let (_, assistant_ids) = harness.send("question").await;
    harness.settle().await;

    let assistant = harness.message(assistant_ids[0]);
    assert_eq!(assistant.status, MessageStatus::Success);
    assert_eq!(
        summary(&harness.blocks_of(assistant.id)),
        vec![
            (
                BlockKind::Thinking {
                    content: "Let me think".to_string(),
                    thinking_millsec: Some(9),
                },
                BlockStatus::Success
            ),
            (BlockKind::main_text("Answer"), BlockStatus::Success),
        ]
    );

    let reloaded = harness.reloaded().await;
    let persisted = reloaded
        .messages()
        .message(assistant.id)
        .expect("assistant persisted");
    assert_eq!(
        summary(&stored_blocks(&reloaded, &persisted)),
        summary(&harness.blocks_of(assistant.id))
    );
}

#[tokio::test]
async fn abort_mid_text_pauses_the_block_and_appends_an_interrupted_marker() {
    let harness = Harness::new(ScriptedProvider::fixed(vec![
        ScriptStep::Emit(Chunk::ResponseCreated),
        ScriptStep::Emit(Chunk::text_delta("partial")),
        ScriptStep::HangUntilCancelled,
    ]))
    .await;

    let (ask_id, assistant_ids) = harness.send("tell me a story").await;
    let assistant_id = assistant_ids[0];
    harness
        .wait_until(|service| {
            service
                .blocks()
                .blocks_for_message(assistant_id)
                .iter()
                .any(|block| block.content() == Some("partial"))
        })
        .await;
    assert_eq!(
        harness.service.messages().streaming_message_id(),
        Some(assistant_id)
    );

    let regenerate = harness
        .service
        .regenerate_assistant_response(harness.topic_id, assistant_id, &harness.robot)
        .await;
    assert!(matches!(regenerate, Err(ServiceError::InvalidMessage { .. })));

    assert_eq!(harness.service.cancel_current_stream(harness.topic_id), 1);
    assert_eq!(harness.service.aborts().trigger(ask_id), 0);
    harness.settle().await;
    assert_eq!(harness.service.cancel_current_stream(harness.topic_id), 0);

    let assistant = harness.message(assistant_id);
    assert_eq!(assistant.status, MessageStatus::Success);
    assert_eq!(
        summary(&harness.blocks_of(assistant_id)),
        vec![
            (BlockKind::main_text("partial"), BlockStatus::Paused),
            (
                BlockKind::Interrupted {
                    content: "partial".to_string()
                },
                BlockStatus::Paused
            ),
        ]
    );
    assert_eq!(harness.service.messages().streaming_message_id(), None);
    assert!(!harness.service.aborts().has(ask_id));

    let reloaded = harness.reloaded().await;
    let persisted = reloaded
        .messages()
        .message(assistant_id)
        .expect("assistant persisted");
    assert_eq!(persisted.status, MessageStatus::Success);
    assert_eq!(
        summary(&stored_blocks(&reloaded, &persisted)),
        summary(&harness.blocks_of(assistant_id))
    );
}

#[tokio::test]
async fn provider_that_cannot_open_leaves_one_error_block() {
    let harness = Harness::new(ScriptedProvider::failing("connection refused")).await;

    let (_, assistant_ids) = harness.send("hello?").await;
    harness.settle().await;

    let assistant = harness.message(assistant_ids[0]);
    assert_eq!(assistant.status, MessageStatus::Error);
    let blocks = harness.blocks_of(assistant.id);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].status, BlockStatus::Error);
    match &blocks[0].kind {
        BlockKind::Error { error } => {
            assert!(!error.is_abort());
            assert!(error.message.contains("connection refused"));
        }
        other => panic!("expected an error block, got {other:?}"),
    }
    assert_eq!(harness.service.messages().streaming_message_id(), None);

    let reloaded = harness.reloaded().await;
    let persisted = reloaded
        .messages()
        .message(assistant.id)
        .expect("assistant persisted");
    assert_eq!(persisted.status, MessageStatus::Error);
    assert_eq!(stored_blocks(&reloaded, &persisted).len(), 1);
}

#[tokio::test]
async fn unknown_provider_is_reported_on_the_message() {
    let mut harness = Harness::new(ScriptedProvider::echo()).await;
    harness.robot.model = ModelRef::new("nowhere", "ghost");

    let (_, assistant_ids) = harness.send("anyone?").await;
    harness.settle().await;

    let assistant = harness.message(assistant_ids[0]);
    assert_eq!(assistant.status, MessageStatus::Error);
    let blocks = harness.blocks_of(assistant.id);
    assert!(matches!(
        &blocks[..],
        [MessageBlock { kind: BlockKind::Error { error }, .. }] if error.name == "ProviderNotFound"
    ));
    assert!(harness.provider.requests().is_empty());
}

#[tokio::test]
async fn mentions_fan_out_one_serialized_response_per_model() {
    let provider = ScriptedProvider::new(|request| {
        let mut steps = Vec::new();
        for word in ["from ", "model ", request.model_id.as_str()] {
            steps.push(ScriptStep::Pause(Duration::from_millis(4)));
            steps.push(ScriptStep::Emit(Chunk::text_delta(word)));
        }
        steps.push(ScriptStep::Emit(Chunk::BlockComplete { response: None }));
        Ok(steps)
    });
    let harness = Harness::new(provider).await;
    let (message, blocks) = user_text_message(harness.topic_id, "compare yourselves");
    let message = message.with_mentions(vec![
        ModelRef::new("scripted", "alpha"),
        ModelRef::new("scripted", "beta"),
        ModelRef::new("scripted", "gamma"),
    ]);

    let (_, assistant_ids) = harness.send_message((message, blocks)).await;
    assert_eq!(assistant_ids.len(), 3);
    for assistant_id in &assistant_ids {
        assert_eq!(harness.message(*assistant_id).status, MessageStatus::Pending);
    }
    harness.settle().await;

    assert_eq!(harness.provider.peak_concurrent_workers(), 1);
    assert_eq!(
        harness
            .provider
            .requests()
            .iter()
            .map(|request| request.model_id.clone())
            .collect::<Vec<_>>(),
        vec!["alpha", "beta", "gamma"]
    );

    for (assistant_id, model) in assistant_ids.iter().zip(["alpha", "beta", "gamma"]) {
        let assistant = harness.message(*assistant_id);
        assert_eq!(assistant.status, MessageStatus::Success);
        assert_eq!(
            summary(&harness.blocks_of(*assistant_id)),
            vec![(
                BlockKind::main_text(format!("from model {model}")),
                BlockStatus::Success
            )]
        );
    }

    // Block writes of one response never interleave with another's.
    let mut runs: Vec<MessageId> = Vec::new();
    for (message_id, _) in harness.storage.block_writes() {
        if assistant_ids.contains(&message_id) && runs.last() != Some(&message_id) {
            runs.push(message_id);
        }
    }
    assert_eq!(runs, assistant_ids);

    // The last persisted write of every block carries its final state.
    let reloaded = harness.reloaded().await;
    for (assistant_id, model) in assistant_ids.iter().zip(["alpha", "beta", "gamma"]) {
        let persisted = reloaded
            .messages()
            .message(*assistant_id)
            .expect("assistant persisted");
        assert_eq!(
            summary(&stored_blocks(&reloaded, &persisted)),
            vec![(
                BlockKind::main_text(format!("from model {model}")),
                BlockStatus::Success
            )]
        );
    }
}

#[tokio::test]
async fn different_topics_stream_concurrently() {
    let harness = Harness::new(ScriptedProvider::fixed(vec![
        ScriptStep::Emit(Chunk::ResponseCreated),
        ScriptStep::Pause(Duration::from_millis(80)),
        ScriptStep::Emit(Chunk::text_delta("done")),
        ScriptStep::Emit(Chunk::BlockComplete { response: None }),
    ]))
    .await;
    let mut robot = harness.robot.clone();
    let other = harness
        .service
        .create_topic(&mut robot, "second")
        .await
        .expect("second topic");

    let (first, first_blocks) = user_text_message(harness.topic_id, "one");
    let (second, second_blocks) = user_text_message(other.id, "two");
    let first_ids = harness
        .service
        .send_message(harness.topic_id, first, first_blocks, &robot)
        .await
        .expect("first accepted");
    let second_ids = harness
        .service
        .send_message(other.id, second, second_blocks, &robot)
        .await
        .expect("second accepted");
    harness.settle().await;
    harness.service.wait_for_topic(other.id).await;

    assert_eq!(harness.provider.peak_concurrent_workers(), 2);
    assert_eq!(harness.message(first_ids[0]).status, MessageStatus::Success);
    assert_eq!(harness.message(second_ids[0]).status, MessageStatus::Success);
    assert_eq!(harness.service.messages().streaming_message_id(), None);
}

#[tokio::test]
async fn history_respects_context_count_and_prompt() {
    let mut harness = Harness::new(ScriptedProvider::echo()).await;
    harness.robot = harness
        .robot
        .clone()
        .with_prompt("Answer in one word.")
        .with_context_count(2);

    harness.send("first").await;
    harness.settle().await;
    harness.send("second").await;
    harness.settle().await;

    let requests = harness.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].preamble.as_deref(), Some("Answer in one word."));
    assert_eq!(
        requests[1]
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>(),
        vec!["first", "second"]
    );
    assert_eq!(requests[1].messages[0].role, ProviderRole::Assistant);
}

#[tokio::test]
async fn regenerate_replaces_the_previous_answer() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let provider = ScriptedProvider::new(move |_| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(emit([
            Chunk::thinking_delta("hmm", 1),
            Chunk::text_delta(format!("attempt {attempt}")),
            Chunk::BlockComplete { response: None },
        ]))
    });
    let harness = Harness::new(provider).await;

    let (ask_id, assistant_ids) = harness.send("roll again").await;
    let assistant_id = assistant_ids[0];
    harness.settle().await;
    let first_blocks = harness.message(assistant_id).blocks;
    assert_eq!(first_blocks.len(), 2);

    let not_assistant = harness
        .service
        .regenerate_assistant_response(harness.topic_id, ask_id, &harness.robot)
        .await;
    assert!(matches!(not_assistant, Err(ServiceError::InvalidMessage { .. })));

    harness
        .service
        .regenerate_assistant_response(harness.topic_id, assistant_id, &harness.robot)
        .await
        .expect("regeneration queued");
    harness.settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let assistant = harness.message(assistant_id);
    assert_eq!(assistant.status, MessageStatus::Success);
    assert!(
        first_blocks
            .iter()
            .all(|block_id| harness.service.blocks().block(*block_id).is_none())
    );
    let blocks = harness.blocks_of(assistant_id);
    assert_eq!(
        blocks.last().map(|block| block.kind.clone()),
        Some(BlockKind::main_text("attempt 2"))
    );

    let reloaded = harness.reloaded().await;
    let persisted = reloaded
        .messages()
        .message(assistant_id)
        .expect("assistant persisted");
    assert_eq!(persisted.blocks, assistant.blocks);
    assert!(harness.storage.writes().iter().any(|op| matches!(
        op,
        crate::test_support::WriteOp::DeleteBlocks(deleted) if *deleted == first_blocks
    )));
}

#[tokio::test]
async fn clearing_and_deleting_remove_state_everywhere() {
    let harness = Harness::new(ScriptedProvider::echo()).await;
    let (ask_id, assistant_ids) = harness.send("keep me").await;
    harness.settle().await;

    harness
        .service
        .delete_single_message(harness.topic_id, assistant_ids[0])
        .await
        .expect("assistant deleted");
    assert!(
        harness
            .service
            .blocks()
            .blocks_for_message(assistant_ids[0])
            .is_empty()
    );
    let reloaded = harness.reloaded().await;
    assert_eq!(
        reloaded
            .messages()
            .messages_for_topic(harness.topic_id)
            .iter()
            .map(|message| message.id)
            .collect::<Vec<_>>(),
        vec![ask_id]
    );

    let missing = harness
        .service
        .delete_single_message(harness.topic_id, assistant_ids[0])
        .await;
    assert!(matches!(missing, Err(ServiceError::MessageNotFound { .. })));

    harness.service.clear_topic_messages(harness.topic_id).await;
    assert!(
        harness
            .service
            .messages()
            .messages_for_topic(harness.topic_id)
            .is_empty()
    );
    assert!(harness.service.blocks().is_empty());
    let reloaded = harness.reloaded().await;
    assert!(
        reloaded
            .messages()
            .messages_for_topic(harness.topic_id)
            .is_empty()
    );
    assert!(reloaded.blocks().is_empty());

    let mut robot = harness.robot.clone();
    let topics = harness
        .service
        .list_topics(robot.id)
        .await
        .expect("topics listed");
    assert_eq!(topics.len(), 1);
    harness
        .service
        .delete_topic(&mut robot, harness.topic_id)
        .await
        .expect("topic deleted");
    assert!(robot.topics.is_empty());
    assert_eq!(robot.selected_topic_id, None);
    assert!(
        harness
            .service
            .list_topics(robot.id)
            .await
            .expect("topics listed")
            .is_empty()
    );
}

#[tokio::test]
async fn clearing_a_streaming_topic_stops_the_response() {
    let harness = Harness::new(ScriptedProvider::fixed(vec![
        ScriptStep::Emit(Chunk::ResponseCreated),
        ScriptStep::Emit(Chunk::text_delta("never finished")),
        ScriptStep::HangUntilCancelled,
    ]))
    .await;

    let (_, assistant_ids) = harness.send("go").await;
    let assistant_id = assistant_ids[0];
    harness
        .wait_until(|service| {
            service.messages().message(assistant_id).map(|m| m.status)
                == Some(MessageStatus::Processing)
        })
        .await;

    harness.service.clear_topic_messages(harness.topic_id).await;
    harness.settle().await;

    assert!(harness.service.messages().message(assistant_id).is_none());
    assert!(harness.service.blocks().is_empty());
    assert_eq!(harness.service.throttle().pending_len(), 0);
    assert_eq!(harness.service.messages().streaming_message_id(), None);
    let reloaded = harness.reloaded().await;
    assert!(
        reloaded
            .messages()
            .messages_for_topic(harness.topic_id)
            .is_empty()
    );
}

#[tokio::test]
async fn failed_writes_keep_the_in_memory_conversation() {
    let harness = Harness::new(ScriptedProvider::echo()).await;
    harness.storage.fail_writes(true);

    let (ask_id, assistant_ids) = harness.send("offline disk").await;
    harness.settle().await;

    let assistant = harness.message(assistant_ids[0]);
    assert_eq!(assistant.status, MessageStatus::Success);
    assert_eq!(
        harness
            .blocks_of(assistant.id)
            .last()
            .map(|block| block.kind.clone()),
        Some(BlockKind::main_text("offline disk"))
    );
    assert_eq!(harness.message(ask_id).status, MessageStatus::Success);
    assert!(harness.storage.writes().is_empty());

    harness.storage.fail_writes(false);
    let reloaded = harness.reloaded().await;
    assert!(
        reloaded
            .messages()
            .messages_for_topic(harness.topic_id)
            .is_empty()
    );
}

#[tokio::test]
async fn loading_is_skipped_once_fulfilled_unless_forced() {
    let harness = Harness::new(ScriptedProvider::echo()).await;
    harness.send("persist me").await;
    harness.settle().await;

    let reader = MessageService::new(
        harness.storage.clone(),
        ProviderRegistry::new(),
        ServiceOptions::default(),
    );
    reader
        .load_topic_messages(harness.topic_id, false)
        .await
        .expect("first load");
    assert!(reader.messages().is_topic_fulfilled(harness.topic_id));
    assert_eq!(reader.messages().messages_for_topic(harness.topic_id).len(), 2);

    harness.send("and me").await;
    harness.settle().await;

    reader
        .load_topic_messages(harness.topic_id, false)
        .await
        .expect("cached load");
    assert_eq!(reader.messages().messages_for_topic(harness.topic_id).len(), 2);

    reader
        .load_topic_messages(harness.topic_id, true)
        .await
        .expect("forced load");
    let messages = reader.messages().messages_for_topic(harness.topic_id);
    assert_eq!(messages.len(), 4);
    assert!(messages.iter().all(|message| message.status == MessageStatus::Success));
    assert_eq!(
        harness
            .storage
            .block_writes()
            .iter()
            .filter(|(_, status)| *status == BlockRecordStatus::Processing)
            .count(),
        2
    );
}

#[tokio::test]
async fn thinking_after_text_opens_a_fresh_thinking_block() {
    let harness = Harness::new(ScriptedProvider::fixed(emit([
        Chunk::thinking_delta("first", 5),
        Chunk::text_delta("mid"),
        Chunk::thinking_delta("second", 9),
        Chunk::text_delta("end"),
        Chunk::BlockComplete { response: None },
    ])))
    .await;

    let (_, assistant_ids) = harness.send("two rounds").await;
    harness.settle().await;

    let assistant = harness.message(assistant_ids[0]);
    assert_eq!(assistant.status, MessageStatus::Success);
    let blocks = harness.blocks_of(assistant.id);
    let expected = vec![
        (
            BlockKind::Thinking {
                content: "first".to_string(),
                thinking_millsec: Some(5),
            },
            BlockStatus::Success,
        ),
        (BlockKind::main_text("mid"), BlockStatus::Success),
        (
            BlockKind::Thinking {
                content: "second".to_string(),
                thinking_millsec: Some(9),
            },
            BlockStatus::Success,
        ),
        (BlockKind::main_text("end"), BlockStatus::Success),
    ];
    assert_eq!(summary(&blocks), expected);
    let ids = blocks.iter().map(|block| block.id).collect::<HashSet<_>>();
    assert_eq!(ids.len(), 4);

    let reloaded = harness.reloaded().await;
    let persisted = reloaded
        .messages()
        .message(assistant.id)
        .expect("assistant persisted");
    assert_eq!(summary(&stored_blocks(&reloaded, &persisted)), expected);
}

#[tokio::test]
async fn reported_thinking_end_keeps_its_duration_before_the_answer() {
    let harness = Harness::new(ScriptedProvider::fixed(emit([
        Chunk::thinking_delta("reasoning...", 50),
        Chunk::thinking_complete("reasoning...", 120),
        Chunk::text_delta("answer"),
        Chunk::text_complete("answer"),
        Chunk::BlockComplete { response: None },
    ])))
    .await;

    let (_, assistant_ids) = harness.send("why?").await;
    harness.settle().await;

    let expected = vec![
        (
            BlockKind::Thinking {
                content: "reasoning...".to_string(),
                thinking_millsec: Some(120),
            },
            BlockStatus::Success,
        ),
        (BlockKind::main_text("answer"), BlockStatus::Success),
    ];
    assert_eq!(summary(&harness.blocks_of(assistant_ids[0])), expected);
    assert_eq!(
        harness.message(assistant_ids[0]).status,
        MessageStatus::Success
    );
}

#[tokio::test]
async fn first_text_reuses_the_placeholder_block() {
    let harness = Harness::new(ScriptedProvider::fixed(emit([
        Chunk::ResponseCreated,
        Chunk::text_delta("a"),
        Chunk::text_delta("b"),
        Chunk::text_delta("c"),
        Chunk::text_complete("final"),
        Chunk::BlockComplete { response: None },
    ])))
    .await;

    let (_, assistant_ids) = harness.send("spell it").await;
    let assistant_id = assistant_ids[0];
    harness.settle().await;

    let placeholder_id = harness
        .storage
        .writes()
        .into_iter()
        .find_map(|op| match op {
            crate::test_support::WriteOp::Block {
                block_id,
                message_id,
                status: BlockRecordStatus::Processing,
                ..
            } if message_id == assistant_id => Some(block_id),
            _ => None,
        })
        .expect("placeholder persisted");
    let blocks = harness.blocks_of(assistant_id);
    assert_eq!(
        summary(&blocks),
        vec![(BlockKind::main_text("final"), BlockStatus::Success)]
    );
    assert_eq!(blocks[0].id, placeholder_id);

    let reloaded = harness.reloaded().await;
    let persisted = reloaded
        .messages()
        .message(assistant_id)
        .expect("assistant persisted");
    assert_eq!(
        summary(&stored_blocks(&reloaded, &persisted)),
        vec![(BlockKind::main_text("final"), BlockStatus::Success)]
    );
}

#[tokio::test]
async fn deleting_a_pending_answer_stops_its_request() {
    let harness = Harness::new(ScriptedProvider::fixed(vec![
        ScriptStep::HangUntilCancelled,
    ]))
    .await;

    let (ask_id, assistant_ids) = harness.send("never mind").await;
    let assistant_id = assistant_ids[0];
    harness
        .wait_until(|service| service.aborts().has(ask_id))
        .await;
    assert_eq!(harness.message(assistant_id).status, MessageStatus::Pending);
    assert_eq!(harness.provider.requests().len(), 1);

    harness
        .service
        .delete_single_message(harness.topic_id, assistant_id)
        .await
        .expect("pending answer deleted");
    harness.settle().await;

    assert!(!harness.service.aborts().has(ask_id));
    assert!(harness.service.messages().message(assistant_id).is_none());
    assert!(!harness.service.messages().is_topic_loading(harness.topic_id));
    assert_eq!(harness.service.messages().streaming_message_id(), None);
}

#[tokio::test]
async fn loading_settles_answers_left_streaming_by_an_earlier_session() {
    let harness = Harness::new(ScriptedProvider::fixed(vec![
        ScriptStep::Emit(Chunk::ResponseCreated),
        ScriptStep::Emit(Chunk::text_delta("half")),
        ScriptStep::HangUntilCancelled,
    ]))
    .await;

    let (_, assistant_ids) = harness.send("long answer please").await;
    let assistant_id = assistant_ids[0];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !harness
        .storage
        .block_writes()
        .contains(&(assistant_id, BlockRecordStatus::Streaming))
    {
        assert!(tokio::time::Instant::now() < deadline, "partial text never stored");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // A second session opens the same database while the first one still streams.
    let expected = vec![
        (BlockKind::main_text("half"), BlockStatus::Paused),
        (
            BlockKind::Interrupted {
                content: "half".to_string(),
            },
            BlockStatus::Paused,
        ),
    ];
    let later = harness.reloaded().await;
    let settled = later
        .messages()
        .message(assistant_id)
        .expect("assistant loaded");
    assert_eq!(settled.status, MessageStatus::Success);
    assert_eq!(summary(&stored_blocks(&later, &settled)), expected);

    let again = harness.reloaded().await;
    let persisted = again
        .messages()
        .message(assistant_id)
        .expect("assistant persisted");
    assert_eq!(persisted.status, MessageStatus::Success);
    assert_eq!(summary(&stored_blocks(&again, &persisted)), expected);

    later
        .regenerate_assistant_response(harness.topic_id, assistant_id, &harness.robot)
        .await
        .expect("settled answer can be regenerated");
    later.wait_for_topic(harness.topic_id).await;

    harness.service.cancel_current_stream(harness.topic_id);
    harness.settle().await;
}
