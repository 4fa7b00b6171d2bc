/// CLI for hotelchat conversations
use colored::Colorize;
use hotelchat_core::messenger_types::{ConversationFilter, ConversationKind, Message};
use hotelchat_core::{Config, HttpApi, ImApi, SessionController, SseConnector};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = rest.first() else {
        print_usage();
        return Ok(());
    };
    if config.identity.token.is_empty() {
        eprintln!("✗ Error: no token (use --token or HOTELCHAT_TOKEN)");
        std::process::exit(1);
    }

    let api = Arc::new(HttpApi::new(&config)?);
    let connector = Arc::new(SseConnector::new(&config)?);
    let controller = SessionController::new(
        api.clone(),
        connector,
        config.identity.clone(),
        config.session_settings(),
    );

    match command.as_str() {
        "conversations" => {
            let filter = ConversationFilter {
                kind: match rest.get(1).map(String::as_str) {
                    Some("dm") => Some(ConversationKind::Dm),
                    Some("group") => Some(ConversationKind::Group),
                    _ => None,
                },
                hotel_id: rest.get(2).cloned(),
            };
            list_conversations(api.as_ref(), &filter).await?;
        }
        "dm" => {
            let Some(hotel_id) = rest.get(1) else {
                eprintln!("Usage: hotelchat dm <hotel_id> [owner_id] [admin_id]");
                return Ok(());
            };
            let conv = controller
                .create_dm(
                    hotel_id,
                    rest.get(2).map(String::as_str),
                    rest.get(3).map(String::as_str),
                )
                .await?;
            println!("✓ Conversation {}", conv.id);
        }
        "send" => {
            if rest.len() < 3 {
                eprintln!("Usage: hotelchat send <conversation_id> <message>");
                return Ok(());
            }
            let text = rest[2..].join(" ");
            let msg = controller.send_text(Some(&rest[1]), &text).await?;
            println!("✓ Message sent! ID: {}", msg.id);
        }
        "send-file" => {
            if rest.len() < 3 {
                eprintln!("Usage: hotelchat send-file <conversation_id> <path> [caption]");
                return Ok(());
            }
            let path = Path::new(&rest[2]);
            let content = tokio::fs::read(path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let attachment = api.upload(&file_name, &mime_type(path), &content).await?;
            let caption = rest[3..].join(" ");
            let msg = controller
                .send_file(Some(&rest[1]), &caption, vec![attachment])
                .await?;
            println!("✓ File sent! ID: {}", msg.id);
        }
        "history" => {
            let Some(conversation_id) = rest.get(1) else {
                eprintln!("Usage: hotelchat history <conversation_id>");
                return Ok(());
            };
            let page = api.history(conversation_id, config.page_size, None).await?;
            for msg in page.chronological() {
                print_message(&msg, &config.identity.user_id);
            }
            if let Some(cursor) = page.next_cursor {
                println!("{}", format!("… older messages before {}", cursor).dimmed());
            }
        }
        "tail" => {
            let Some(conversation_id) = rest.get(1) else {
                eprintln!("Usage: hotelchat tail <conversation_id>");
                return Ok(());
            };
            tail(&controller, conversation_id, &config.identity.user_id).await?;
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("hotelchat CLI");
    println!();
    println!("Usage: hotelchat [--api-url <url>] [--token <token>] [--user-id <id>] <command> [args]");
    println!();
    println!("Commands:");
    println!("  conversations [dm|group] [hotel_id]     List your conversations");
    println!("  dm <hotel_id> [owner_id] [admin_id]     Get or create the DM for a hotel");
    println!("  send <conversation_id> <message>        Send a text message");
    println!("  send-file <conversation_id> <path> [caption]  Upload and send a file");
    println!("  history <conversation_id>               Show the latest page of history");
    println!("  tail <conversation_id>                  Follow a conversation live (Ctrl+C to stop)");
}

async fn list_conversations(api: &dyn ImApi, filter: &ConversationFilter) -> anyhow::Result<()> {
    let conversations = api.list_conversations(filter).await?;
    if conversations.is_empty() {
        println!("No conversations found");
        return Ok(());
    }
    println!("Conversations ({}):", conversations.len());
    println!("{:-<60}", "");
    for conv in conversations {
        let preview = conv
            .last_message
            .as_ref()
            .and_then(|l| l.text.clone())
            .unwrap_or_else(|| "—".to_string());
        let label = conv
            .name
            .clone()
            .or_else(|| conv.subtype.clone())
            .unwrap_or_default();
        println!("  {} [{:?}] {} {}", conv.id, conv.kind, label, preview.dimmed());
    }
    Ok(())
}

async fn tail(controller: &SessionController, conversation_id: &str, me: &str) -> anyhow::Result<()> {
    let mut rx = controller.subscribe();
    controller.start_session(conversation_id)?;
    println!("{}", format!("Following {} (Ctrl+C to stop)", conversation_id).dimmed());

    let mut printed = HashSet::new();
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                for msg in snapshot.messages.iter() {
                    if printed.insert(msg.id.clone()) {
                        print_message(msg, me);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    controller.stop_session();
    Ok(())
}

fn print_message(msg: &Message, me: &str) {
    let time = msg.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
    let who = if msg.sender_id == me {
        "me".green().bold()
    } else {
        msg.sender_id.cyan()
    };
    let mut line = msg.text.clone().unwrap_or_default();
    for att in &msg.attachments {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&format!("[{}]", att.file_name));
    }
    println!("{} {}: {}", time.dimmed(), who, line);
}

/// MIME type from the file extension, octet-stream when unknown
fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_from_extension() {
        assert_eq!(mime_type(Path::new("photo.webp")), "image/webp");
        assert_eq!(mime_type(Path::new("data.json")), "application/json");
        assert_eq!(
            mime_type(Path::new("report.docx")),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(mime_type(Path::new("INVOICE.PDF")), "application/pdf");
        assert_eq!(mime_type(Path::new("blob")), "application/octet-stream");
    }
}
