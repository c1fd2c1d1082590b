use std::env;
use tracing::debug;
use voisemail::config::Config;
use voisemail::db::Database;
use voisemail::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug_logging = env::args().any(|arg| arg == "--debug");
    let args: Vec<String> = env::args().filter(|arg| arg != "--debug").collect();
    logging::init(debug_logging)?;
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query>", args[0]);
        eprintln!("Search query matches against Sender or Subject.");
        std::process::exit(1);
    }

    let query = &args[1];
    let config = Config::load();
    debug!(database = %config.database.url, query = %query, "Inspecting database");
    let db = Database::new(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let Some(message) = db.latest_matching(query).await? else {
        println!("No messages found matching '{}'", query);
        db.close().await;
        return Ok(());
    };

    let insights = db.insights_for_message(&message.id).await?;
    let audio = db.audio_for_message(&message.id).await?;
    let rule = "-".repeat(80);

    println!("Found Message:");
    println!("ID: {}", message.id);
    println!("Owner: {}", message.owner_id);
    println!("Mailbox: {}", message.source_address);
    println!("External ID: {}", message.external_id);
    println!("From: {}", message.from);
    println!("Subject: {}", message.subject);
    println!("Received: {}", message.received_at.to_rfc3339());
    println!("Folder: {}", message.folder);
    println!("Labels: {}", message.labels.join(", "));
    println!(
        "Read: {}  Starred: {}  Attachments: {}",
        message.is_read, message.is_starred, message.has_attachments
    );
    println!("{}", rule);
    println!("Processed: {}", message.is_processed);
    println!("Summary: {:?}", message.summary);
    println!(
        "Urgency: {}",
        message
            .urgency_level
            .map(|u| u.to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("Lead: {}  Job offer: {}", message.is_lead, message.is_job_offer);
    if let Some(is_junk) = message.is_junk {
        println!(
            "Junk: {} (confidence {:?}, confirmed {}): {:?}",
            is_junk, message.confidence, message.junk_confirmed, message.ai_reason
        );
    }
    println!("Audio URL: {:?}", message.audio_url);
    for object in &audio {
        println!(
            "  {} ({} bytes, {:?}s, {})",
            object.filename, object.size, object.duration_seconds, object.mime_type
        );
    }
    println!("{}", rule);
    println!("INSIGHTS ({}):", insights.len());
    for insight in &insights {
        println!("  [{:.2}] {}: {}", insight.confidence, insight.kind, insight.value);
    }
    println!("{}", rule);
    println!("BODY TEXT (Raw Debug):");
    println!("{:?}", message.body_text);
    println!("{}", rule);
    println!("BODY HTML (Raw Debug):");
    println!("{:?}", message.body_html);
    println!("{}", rule);

    db.close().await;
    Ok(())
}
