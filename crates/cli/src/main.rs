mod args;
mod output;

use std::collections::BTreeSet;
use std::sync::Arc;

use robochat_core::settings::parse_model_ref;
use robochat_core::{
    AppSettings, MessageService, ProviderRegistry, Robot, ServiceError, SettingsStore,
    user_text_message,
};
use robochat_llm::{LlmProvider, ProviderError, ScriptedProvider, create_provider};
use robochat_storage::{SqliteStorage, StorageError, TopicId};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing_subscriber::EnvFilter;

use crate::args::{ChatArgs, Command, USAGE};
use crate::output::{StreamPrinter, print_history, print_outcome};

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("no robot named '{name}' in settings"))]
    UnknownRobot { stage: &'static str, name: String },
    #[snafu(display("invalid topic id on `{stage}`: {source}"))]
    InvalidTopicId {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("topic {topic_id} does not belong to robot '{robot}'"))]
    ForeignTopic {
        stage: &'static str,
        topic_id: TopicId,
        robot: String,
    },
    #[snafu(display(
        "no api key configured in {path}; add one under `provider.api_key` or pass --offline"
    ))]
    MissingApiKey { stage: &'static str, path: String },
    #[snafu(display("failed to open the database on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to create the provider on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{source}"))]
    Service {
        stage: &'static str,
        source: ServiceError,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match args::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("robochat: {message}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(error) = run(command).await {
        eprintln!("robochat: {error}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), CliError> {
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let store = SettingsStore::load();
    match store.save_if_changed() {
        Ok(true) => tracing::info!(path = ?store.config_path(), "settings file written"),
        Ok(false) => {}
        Err(error) => tracing::warn!(error = %error, "could not write settings file"),
    }
    let settings = store.settings();
    let database_path = settings.database_path(&store.config_dir());
    let storage = SqliteStorage::open(&database_path.to_string_lossy())
        .await
        .context(StorageSnafu {
            stage: "open-database",
        })?;

    match command {
        Command::Chat(chat) => {
            let providers = provider_registry(&settings, &store, &chat)?;
            let service =
                MessageService::new(Arc::new(storage), providers, settings.service_options());
            run_chat(&service, &settings, chat).await
        }
        Command::Topics { robot } => {
            let service = MessageService::new(
                Arc::new(storage),
                ProviderRegistry::new(),
                settings.service_options(),
            );
            let robot = resolve_robot(&settings, robot.as_deref())?;
            let topics = service
                .list_topics(robot.id)
                .await
                .context(ServiceSnafu {
                    stage: "list-topics",
                })?;
            if topics.is_empty() {
                println!("no topics for robot '{}'", robot.name);
            }
            for topic in topics {
                println!(
                    "{}  {:>4} messages  {}",
                    topic.id, topic.message_count, topic.name
                );
            }
            Ok(())
        }
        Command::History { topic } => {
            let topic_id = TopicId::parse(&topic).context(InvalidTopicIdSnafu {
                stage: "history-topic-id",
            })?;
            let service = MessageService::new(
                Arc::new(storage),
                ProviderRegistry::new(),
                settings.service_options(),
            );
            service
                .load_topic_messages(topic_id, true)
                .await
                .context(ServiceSnafu {
                    stage: "load-history",
                })?;
            print_history(&service, topic_id);
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

async fn run_chat(
    service: &MessageService,
    settings: &AppSettings,
    chat: ChatArgs,
) -> Result<(), CliError> {
    let mut robot = resolve_robot(settings, chat.robot.as_deref())?;
    let topic_id = match chat.topic.as_deref() {
        Some(raw) => {
            let topic_id = TopicId::parse(raw).context(InvalidTopicIdSnafu {
                stage: "chat-topic-id",
            })?;
            let known = service
                .list_topics(robot.id)
                .await
                .context(ServiceSnafu {
                    stage: "chat-list-topics",
                })?
                .iter()
                .any(|topic| topic.id == topic_id);
            ensure!(
                known,
                ForeignTopicSnafu {
                    stage: "chat-topic-owner",
                    topic_id,
                    robot: robot.name.clone(),
                }
            );
            robot.select_topic(topic_id);
            service
                .load_topic_messages(topic_id, false)
                .await
                .context(ServiceSnafu {
                    stage: "chat-load-topic",
                })?;
            topic_id
        }
        None => {
            let name = topic_name(&chat.prompt);
            service
                .create_topic(&mut robot, &name)
                .await
                .context(ServiceSnafu {
                    stage: "chat-create-topic",
                })?
                .id
        }
    };

    let (message, blocks) = user_text_message(topic_id, &chat.prompt);
    let mentions = chat
        .models
        .iter()
        .map(|raw| parse_model_ref(raw, &settings.provider.provider_id))
        .collect::<Vec<_>>();
    let message = message.with_mentions(mentions);

    let printer = StreamPrinter::spawn(service.clone(), topic_id);
    let interrupt = {
        let service = service.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let cancelled = service.cancel_current_stream(topic_id);
                tracing::info!(topic_id = %topic_id, cancelled, "interrupted by user");
            }
        })
    };

    let assistant_ids = service
        .send_message(topic_id, message, blocks, &robot)
        .await
        .context(ServiceSnafu {
            stage: "chat-send",
        })?;
    service.wait_for_topic(topic_id).await;
    interrupt.abort();
    printer.finish().await;

    print_outcome(service, &assistant_ids);
    eprintln!("topic {topic_id}");
    Ok(())
}

fn resolve_robot(settings: &AppSettings, name: Option<&str>) -> Result<Robot, CliError> {
    settings.robot(name).context(UnknownRobotSnafu {
        stage: "resolve-robot",
        name: name.unwrap_or_default().to_string(),
    })
}

/// One provider per provider id referenced by the robots or `--model` mentions.
fn provider_registry(
    settings: &AppSettings,
    store: &SettingsStore,
    chat: &ChatArgs,
) -> Result<ProviderRegistry, CliError> {
    let mut registry = ProviderRegistry::new();
    if chat.offline {
        let mut provider_ids = settings
            .robots()
            .into_iter()
            .map(|robot| robot.answering_model().provider_id.clone())
            .collect::<BTreeSet<_>>();
        provider_ids.extend(
            chat.models
                .iter()
                .map(|raw| parse_model_ref(raw, &settings.provider.provider_id).provider_id),
        );
        for provider_id in provider_ids {
            registry.register(Arc::new(ScriptedProvider::echo().with_id(provider_id)));
        }
        return Ok(registry);
    }

    let config = settings
        .provider
        .to_provider_config()
        .context(MissingApiKeySnafu {
            stage: "provider-config",
            path: store.config_path().display().to_string(),
        })?;
    let provider: Arc<dyn LlmProvider> = create_provider(config).context(ProviderSnafu {
        stage: "create-provider",
    })?;
    registry.register(provider);
    Ok(registry)
}

fn topic_name(prompt: &str) -> String {
    const MAX_CHARS: usize = 40;
    let line = prompt.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX_CHARS {
        return line.to_string();
    }
    let mut name = line.chars().take(MAX_CHARS).collect::<String>();
    name.push('…');
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_first_line_and_bounded() {
        assert_eq!(topic_name("hello\nworld"), "hello");
        let long = "a".repeat(60);
        let name = topic_name(&long);
        assert_eq!(name.chars().count(), 41);
        assert!(name.ends_with('…'));
    }

    #[test]
    fn offline_registry_covers_robot_and_mentioned_providers() {
        let settings = AppSettings::default().normalized();
        let dir = std::env::temp_dir().join("robochat-cli-registry-test");
        let store = SettingsStore::new(dir.join("settings.json"));
        let chat = ChatArgs {
            models: vec!["local/llama".to_string()],
            offline: true,
            prompt: "hi".to_string(),
            ..ChatArgs::default()
        };

        let registry = provider_registry(&settings, &store, &chat).expect("offline registry");
        assert_eq!(registry.ids(), vec!["local", "openai"]);
    }

    #[test]
    fn online_registry_needs_an_api_key() {
        let settings = AppSettings::default().normalized();
        let dir = std::env::temp_dir().join("robochat-cli-missing-key-test");
        let store = SettingsStore::new(dir.join("settings.json"));
        let chat = ChatArgs {
            prompt: "hi".to_string(),
            ..ChatArgs::default()
        };

        let error = provider_registry(&settings, &store, &chat)
            .err()
            .expect("missing api key is an error");
        assert!(matches!(error, CliError::MissingApiKey { .. }));
    }
}
