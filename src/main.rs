use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tracing::info;

use voisemail::auth::OAuthClient;
use voisemail::classifier::{ContentClassifier, OpenAiClient};
use voisemail::config::Config;
use voisemail::db::Database;
use voisemail::gmail::GmailConnector;
use voisemail::logging;
use voisemail::models::TokenPair;
use voisemail::narration::{ElevenLabsClient, NarrationSynthesizer};
use voisemail::pipeline::Pipeline;
use voisemail::storage::{LocalObjectStore, ObjectStore};
use voisemail::vault::Vault;

const USAGE: &str = "Usage: voisemail [--debug] <command> [args]

Commands:
  init-key                                  Generate a vault key and store it in the OS keyring
  add-user <email>                          Create a user (or show the existing one)
  connect <user-id> <address> <access-token> [refresh-token]
                                            Store a mailbox connection
  sync <user-id>                            Fetch new inbox mail
  sync-junk <user-id>                       Fetch and classify new spam-folder mail
  process <user-id> <message-id>            Analyze and narrate one message
  batch <user-id> [limit]                   Process unprocessed inbox mail
  confirm-junk <user-id> <message-id> <junk|not-junk>
                                            Record a junk decision
  stats <user-id>                           Show dashboard counts
  accounts <user-id>                        List connected mailboxes
  delete-audio <user-id> <audio-id>         Delete a narration and its file
  voices                                    List available narration voices
  preview <user-id> <voice-id> <text>       Narrate sample text with a voice";

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| format!("Missing <{}>\n\n{}", name, USAGE))
}

async fn build_pipeline(config: &Config, db: Database) -> Result<Pipeline> {
    config.validate()?;

    let vault = Arc::new(Vault::load(config.vault.key.as_deref())?);
    let oauth = OAuthClient::from_config(&config.gmail).await?;
    let connector = GmailConnector::new(oauth, vault.clone())?;
    let classifier = ContentClassifier::new(OpenAiClient::new(&config.openai));
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::from_config(&config.storage));
    let synthesizer = NarrationSynthesizer::new(
        ElevenLabsClient::new(&config.elevenlabs),
        store.clone(),
        db.clone(),
        config.elevenlabs.bitrate_kbps,
    );

    Ok(Pipeline::new(
        db,
        Arc::new(connector),
        Arc::new(classifier),
        Arc::new(synthesizer),
        store,
        vault,
        config.pipeline,
    ))
}

async fn run(command: &str, args: &[String], config: &Config, db: &Database) -> Result<()> {
    match command {
        "add-user" => {
            let email = arg(args, 0, "email")?;
            let user = match db.user_by_email(email).await? {
                Some(user) => user,
                None => db.create_user(email).await?,
            };
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        "connect" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let tokens = TokenPair {
                access_token: arg(args, 2, "access-token")?.to_string(),
                refresh_token: args.get(3).cloned(),
                expires_at: None,
            };
            let connection = pipeline
                .connect_mailbox(arg(args, 0, "user-id")?, arg(args, 1, "address")?, &tokens)
                .await?;
            println!("{}", serde_json::to_string_pretty(&connection)?);
        }
        "sync" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let count = pipeline.sync_inbox(arg(args, 0, "user-id")?).await?;
            println!("Synced {} new messages", count);
        }
        "sync-junk" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let count = pipeline.sync_junk(arg(args, 0, "user-id")?).await?;
            println!("Synced {} new junk messages", count);
        }
        "process" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let owner = arg(args, 0, "user-id")?;
            let message_id = arg(args, 1, "message-id")?;
            match pipeline.process_message(message_id, owner).await? {
                Some(message) => println!("{}", serde_json::to_string_pretty(&message)?),
                None => println!("Message not found or already processed"),
            }
        }
        "batch" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let limit = args
                .get(1)
                .map(|l| l.parse::<u32>())
                .transpose()
                .context("limit must be a positive number")?;
            let processed = pipeline
                .batch_process(arg(args, 0, "user-id")?, limit)
                .await?;
            println!("Processed {} messages", processed.len());
            for message in &processed {
                println!(
                    "  {} [{}] {}",
                    message.id,
                    message
                        .urgency_level
                        .map(|u| u.to_string())
                        .unwrap_or_default(),
                    message.summary.as_deref().unwrap_or_default()
                );
            }
        }
        "confirm-junk" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let is_junk = match arg(args, 2, "junk|not-junk")? {
                "junk" => true,
                "not-junk" => false,
                other => bail!("Expected 'junk' or 'not-junk', got '{}'", other),
            };
            pipeline
                .confirm_junk(arg(args, 1, "message-id")?, arg(args, 0, "user-id")?, is_junk)
                .await?;
            println!("Junk decision recorded");
        }
        "stats" => {
            let stats = db.stats(arg(args, 0, "user-id")?).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "accounts" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let list = pipeline.connections(arg(args, 0, "user-id")?).await?;
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        "delete-audio" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            pipeline
                .delete_audio(arg(args, 0, "user-id")?, arg(args, 1, "audio-id")?)
                .await?;
            println!("Audio deleted");
        }
        "preview" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            let text = args.get(2..).map(|words| words.join(" ")).unwrap_or_default();
            let url = pipeline
                .preview_voice(
                    arg(args, 0, "user-id")?,
                    arg(args, 1, "voice-id")?,
                    &text,
                    None,
                    None,
                )
                .await?;
            println!("{}", url);
        }
        "voices" => {
            let pipeline = build_pipeline(config, db.clone()).await?;
            for voice in pipeline.available_voices().await {
                println!("{}  {}", voice.voice_id, voice.name);
            }
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--debug")
        .collect();
    logging::init(debug_logging)?;

    let Some((command, rest)) = args.split_first() else {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    };

    if command == "init-key" {
        Vault::init_keyring()?;
        println!("Stored a new vault key in the OS keyring");
        return Ok(());
    }

    let config = Config::load();
    let db = Database::new(&config.database.url).await?;
    db.run_migrations().await?;
    info!(command = %command, "Starting");

    let result = run(command, rest, &config, &db).await;
    db.close().await;
    result
}
