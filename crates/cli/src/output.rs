use std::collections::HashMap;
use std::io::Write;

use robochat_core::{
    BlockId, BlockKind, Message, MessageBlock, MessageId, MessageService, Role, StoreEvent,
    TopicId,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Echoes assistant main text to stdout while it streams in.
pub struct StreamPrinter {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl StreamPrinter {
    pub fn spawn(service: MessageService, topic_id: TopicId) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let mut events = service.blocks().subscribe();
        let task = tokio::spawn(async move {
            let mut state = PrintState::new(service, topic_id);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    event = events.recv() => match event {
                        Ok(StoreEvent::BlocksUpserted { block_ids }) => {
                            for block_id in block_ids {
                                state.print_block(block_id);
                            }
                        }
                        Ok(StoreEvent::BlockUpdated { block_id }) => state.print_block(block_id),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "printer lagged behind block events");
                            state.sweep();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            state.sweep();
            state.end_line();
        });
        Self { stop, task }
    }

    /// Prints whatever the stream left unprinted and stops.
    pub async fn finish(self) {
        let _ = self.stop.send(());
        if let Err(error) = self.task.await {
            tracing::warn!(error = %error, "stream printer stopped abnormally");
        }
    }
}

struct PrintState {
    service: MessageService,
    topic_id: TopicId,
    printed: HashMap<BlockId, usize>,
    current_message: Option<MessageId>,
}

impl PrintState {
    fn new(service: MessageService, topic_id: TopicId) -> Self {
        Self {
            service,
            topic_id,
            printed: HashMap::new(),
            current_message: None,
        }
    }

    fn print_block(&mut self, block_id: BlockId) {
        let Some(block) = self.service.blocks().block(block_id) else {
            return;
        };
        let Some(message) = self.service.messages().message(block.message_id) else {
            return;
        };
        if message.topic_id != self.topic_id || !message.is_assistant() {
            return;
        }
        let BlockKind::MainText { content } = &block.kind else {
            return;
        };

        let already = self.printed.get(&block_id).copied().unwrap_or_default();
        // Regeneration or a reload can shrink the text; never print backwards.
        let Some(unseen) = content.get(already..).filter(|rest| !rest.is_empty()) else {
            return;
        };
        if self.current_message != Some(message.id) {
            self.end_line();
            if let Some(model) = &message.model {
                println!("[{model}]");
            }
            self.current_message = Some(message.id);
        }
        print!("{unseen}");
        let _ = std::io::stdout().flush();
        self.printed.insert(block_id, content.len());
    }

    fn sweep(&mut self) {
        let block_ids = self
            .service
            .messages()
            .messages_for_topic(self.topic_id)
            .into_iter()
            .filter(|message| message.is_assistant())
            .flat_map(|message| message.blocks)
            .collect::<Vec<_>>();
        for block_id in block_ids {
            self.print_block(block_id);
        }
    }

    fn end_line(&mut self) {
        if self.current_message.take().is_some() {
            println!();
        }
    }
}

/// Reports errors, interruptions and token usage of finished responses on stderr.
pub fn print_outcome(service: &MessageService, assistant_ids: &[MessageId]) {
    for assistant_id in assistant_ids {
        let Some(message) = service.messages().message(*assistant_id) else {
            continue;
        };
        let label = model_label(&message);
        for block in blocks_of(service, &message) {
            match &block.kind {
                BlockKind::Error { error } => {
                    eprintln!("[{label}] {}: {}", error.name, error.message);
                }
                BlockKind::Interrupted { .. } => eprintln!("[{label}] interrupted"),
                _ => {}
            }
        }
        if let Some(usage) = message.usage {
            eprintln!(
                "[{label}] tokens: {} prompt, {} completion",
                usage.prompt_tokens, usage.completion_tokens
            );
        }
    }
}

pub fn print_history(service: &MessageService, topic_id: TopicId) {
    let messages = service.messages().messages_for_topic(topic_id);
    if messages.is_empty() {
        println!("topic {topic_id} has no messages");
        return;
    }

    for message in messages {
        let speaker = match message.role {
            Role::User => "you".to_string(),
            Role::System => "system".to_string(),
            Role::Assistant => model_label(&message),
        };
        println!("── {speaker} ({:?})", message.status);
        for block in blocks_of(service, &message) {
            match &block.kind {
                BlockKind::MainText { content } | BlockKind::Code { content, .. } => {
                    println!("{content}");
                }
                BlockKind::Thinking {
                    thinking_millsec, ..
                } => match thinking_millsec {
                    Some(millsec) => println!("(thought for {millsec} ms)"),
                    None => println!("(thought)"),
                },
                BlockKind::Error { error } => println!("error: {}: {}", error.name, error.message),
                BlockKind::Interrupted { .. } => println!("[interrupted]"),
                BlockKind::Unknown => {}
            }
        }
        println!();
    }
}

fn blocks_of(service: &MessageService, message: &Message) -> Vec<MessageBlock> {
    message
        .blocks
        .iter()
        .filter_map(|block_id| service.blocks().block(*block_id))
        .collect()
}

fn model_label(message: &Message) -> String {
    message
        .model
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "assistant".to_string())
}
