use robochat_llm::{ProviderMessage, Role as ProviderRole};
use robochat_storage::MessageId;

use crate::block::BlockType;
use crate::message::{Message, MessageStatus, Role};
use crate::store::MessageBlockStore;

/// Builds the provider history for a response to `ask_id`.
///
/// Takes the topic's messages up to and including the asking message, drops failed and
/// unfinished assistant turns and anything without text, then keeps the last
/// `context_count` entries. The asking message always survives truncation.
pub fn build_history(
    messages: &[Message],
    blocks: &MessageBlockStore,
    ask_id: MessageId,
    context_count: usize,
) -> Vec<ProviderMessage> {
    let end = messages
        .iter()
        .position(|message| message.id == ask_id)
        .map_or(messages.len(), |index| index + 1);

    let mut history = messages[..end]
        .iter()
        .filter(|message| {
            !(message.is_assistant()
                && matches!(
                    message.status,
                    MessageStatus::Error | MessageStatus::Pending | MessageStatus::Processing
                ))
        })
        .filter_map(|message| {
            let content = message_text(message, blocks);
            if content.trim().is_empty() {
                return None;
            }
            Some(ProviderMessage::new(provider_role(message.role), content))
        })
        .collect::<Vec<_>>();

    let keep = context_count.max(1);
    if history.len() > keep {
        history.drain(..history.len() - keep);
    }
    history
}

/// Main-text blocks of `message`, in block order, separated by blank lines.
pub fn message_text(message: &Message, blocks: &MessageBlockStore) -> String {
    message
        .blocks
        .iter()
        .filter_map(|block_id| blocks.block(*block_id))
        .filter(|block| block.block_type() == BlockType::MainText)
        .filter_map(|block| block.content().map(str::to_string))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn provider_role(role: Role) -> ProviderRole {
    match role {
        Role::System => ProviderRole::System,
        Role::User => ProviderRole::User,
        Role::Assistant => ProviderRole::Assistant,
    }
}
