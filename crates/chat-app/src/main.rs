use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use murmur::message::Message;
use murmur::settings::SettingsStore;
use murmur::{
    ChatError, ConversationOrchestrator, MessageStatus, SendOutcome, StreamProgress, telemetry,
};
use murmur_llm::{DispatchError, HttpPredictionClient};
use murmur_storage::{ConversationId, SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to open conversation store at {location}: {source}"))]
    OpenStorage {
        location: String,
        source: StorageError,
    },
    #[snafu(display("failed to build prediction client: {source}"))]
    BuildClient { source: DispatchError },
    #[snafu(display("failed to read input: {source}"))]
    ReadInput { source: std::io::Error },
}

enum Command<'a> {
    Quit,
    New,
    List,
    Open(&'a str),
    Say(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        _ if line == "/quit" => Command::Quit,
        _ if line == "/new" => Command::New,
        _ if line == "/list" => Command::List,
        _ if line == "/open" => Command::Open(""),
        Some(("/open", id)) => Command::Open(id.trim()),
        _ => Command::Say(line),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "murmur exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CliError> {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    if !settings.is_configured() {
        tracing::warn!(
            path = ?settings_store.config_path(),
            "no API key configured; set provider.api_key or MURMUR_PROVIDER__API_KEY"
        );
    }

    let location = settings.database_location();
    let store = SqliteStorage::open(&location)
        .await
        .context(OpenStorageSnafu {
            location: location.clone(),
        })?;
    let client =
        Arc::new(HttpPredictionClient::new(settings.backend_config()).context(BuildClientSnafu)?);

    let mut orchestrator = ConversationOrchestrator::new(
        Arc::new(store),
        client.clone(),
        client,
        settings.orchestrator_config(),
    );

    println!("murmur ready. Commands: /new, /list, /open <id>, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context(ReadInputSnafu)? {
        match parse_command(&line) {
            Command::Quit => break,
            Command::New => report(orchestrator.switch_conversation(None).await),
            Command::List => match orchestrator.conversations().await {
                Ok(conversations) => {
                    for conversation in conversations {
                        println!("{}  {}", conversation.id, conversation.title);
                    }
                }
                Err(error) => report::<()>(Err(error)),
            },
            Command::Open(raw) => match ConversationId::parse(raw) {
                Ok(conversation_id) => {
                    let opened = orchestrator.switch_conversation(Some(conversation_id)).await;
                    if opened.is_ok() {
                        orchestrator.messages().iter().for_each(print_message);
                    }
                    report(opened);
                }
                Err(error) => println!("! {error}"),
            },
            Command::Say(text) => {
                match orchestrator.send(text).await {
                    Ok(SendOutcome::Streaming { .. }) => {
                        stream_reply(&mut orchestrator).await;
                    }
                    Ok(SendOutcome::DispatchFailed { kind }) => println!("! {}", kind.user_message()),
                    Ok(SendOutcome::NotPersisted { .. }) => {
                        println!("! your message could not be saved")
                    }
                    Err(error) if error.is_rejection() => println!("! {error}"),
                    Err(error) => report::<()>(Err(error)),
                }
            }
        }
    }

    orchestrator.teardown();
    Ok(())
}

/// Prints each reply update as the suffix not yet shown; the reader already throttles updates.
async fn stream_reply(orchestrator: &mut ConversationOrchestrator) {
    let mut printed = 0usize;
    let mut render = |content: &str| {
        print!("{}", unprinted_suffix(content, printed));
        let _ = std::io::stdout().flush();
        printed = content.len();
    };

    while let Some(progress) = orchestrator.next_stream_event().await {
        match progress {
            StreamProgress::Updated { content, .. } => render(&content),
            StreamProgress::Completed { key } => {
                if let Some(message) = orchestrator.messages().iter().find(|m| m.key == key) {
                    render(&message.content);
                }
                println!();
                break;
            }
            StreamProgress::NotSaved { key } => {
                if let Some(message) = orchestrator.messages().iter().find(|m| m.key == key) {
                    render(&message.content);
                }
                println!("\n! reply shown but not saved");
                break;
            }
            StreamProgress::Failed { reason, .. } => {
                println!("\n! {reason}");
                break;
            }
        }
    }
}

/// Replies only grow, so everything past `printed` bytes is new text.
fn unprinted_suffix(content: &str, printed: usize) -> &str {
    content.get(printed..).unwrap_or_default()
}

fn print_message(message: &Message) {
    let marker = match message.status {
        MessageStatus::Error => "!",
        _ => ">",
    };
    println!("{marker} [{:?}] {}", message.role, message.content);
}

fn report<T>(result: Result<T, ChatError>) {
    if let Err(error) = result {
        tracing::warn!(stage = error.stage(), error = %error, "command failed");
        println!("! {error}");
    }
}
