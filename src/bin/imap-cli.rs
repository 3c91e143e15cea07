#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for poking an IMAP mailbox with the engine

use clap::{Parser, Subcommand};
use imap_engine::{
    FetchOptions, ImapConfig, Message, SearchCriterion, Session, WatchEvent,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imap-cli")]
#[command(about = "Query an IMAP mailbox from the command line")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Mailbox to operate on
    #[arg(long, global = true, default_value = "INBOX")]
    mailbox: String,
}

#[derive(Subcommand)]
enum Command {
    /// List mailboxes
    Mailboxes,

    /// List unseen messages (headers only)
    Unseen,

    /// Search with a single criterion keyword (e.g. ALL, UNSEEN)
    Search {
        /// Search keyword
        keyword: String,

        /// Maximum number of results
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show a message by UID
    Show {
        /// Message UID
        uid: u32,
    },

    /// Sit in IDLE (or NOOP polling) and print notifications
    Watch {
        /// Poll interval in seconds when IDLE is unavailable
        #[arg(long, default_value = "60")]
        poll_secs: u64,
    },
}

fn keyword_criterion(keyword: &str) -> SearchCriterion {
    match keyword.to_uppercase().as_str() {
        "UNSEEN" => SearchCriterion::Unseen,
        "SEEN" => SearchCriterion::Seen,
        "FLAGGED" => SearchCriterion::Flagged,
        "ANSWERED" => SearchCriterion::Answered,
        "DELETED" => SearchCriterion::Deleted,
        "DRAFT" => SearchCriterion::Draft,
        "NEW" => SearchCriterion::New,
        "RECENT" => SearchCriterion::Recent,
        _ => SearchCriterion::All,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ImapConfig::from_env()?;
    let mut session = Session::connect(config).await?;
    session.authenticate().await?;

    match &args.command {
        Command::Mailboxes => {
            let entries = session.list("", "*").await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{}", entry.name);
                }
            }
        }
        Command::Unseen => {
            session.open_box(&args.mailbox, true).await?;
            let messages = session
                .search_fetch(&[SearchCriterion::Unseen], &FetchOptions::bodies(&["HEADER"]))
                .await?;
            print_messages(&args, &messages)?;
        }
        Command::Search { keyword, limit } => {
            session.open_box(&args.mailbox, true).await?;
            let messages = session
                .search_fetch(
                    &[keyword_criterion(keyword)],
                    &FetchOptions::bodies(&["HEADER"]),
                )
                .await?;
            let limited: Vec<Message> = messages.into_iter().take(*limit).collect();
            print_messages(&args, &limited)?;
        }
        Command::Show { uid } => {
            session.open_box(&args.mailbox, true).await?;
            let messages = session
                .fetch(&[*uid], &FetchOptions::bodies(&["HEADER", "TEXT"]))
                .await?;
            match messages.first() {
                None => println!("UID {uid} not found"),
                Some(message) if args.json => {
                    println!("{}", serde_json::to_string_pretty(message)?);
                }
                Some(message) => {
                    if let Some(headers) = message.part("HEADER") {
                        println!("{}", headers.text());
                    }
                    if let Some(body) = message.part("TEXT") {
                        println!("{}", body.text());
                    }
                }
            }
        }
        Command::Watch { poll_secs } => {
            session.open_box(&args.mailbox, true).await?;
            let mut watch = session.watch(Duration::from_secs(*poll_secs)).await?;
            println!("watching {} (ctrl-c to quit)", args.mailbox);
            while let Some(event) = watch.recv().await {
                match event {
                    WatchEvent::Exists(n) => println!("EXISTS {n}"),
                    WatchEvent::Recent(n) => println!("RECENT {n}"),
                    WatchEvent::Expunge(n) => println!("EXPUNGE {n}"),
                    WatchEvent::Fetch { seqno, flags, .. } => {
                        println!("FETCH {seqno} {flags:?}");
                    }
                    WatchEvent::Notification(response) => println!("{}", response.raw),
                    WatchEvent::Error(e) => {
                        eprintln!("watch error: {e}");
                        break;
                    }
                    WatchEvent::End => break,
                }
            }
        }
    }

    session.logout().await?;
    Ok(())
}

fn print_messages(args: &Args, messages: &[Message]) -> anyhow::Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        println!("No messages found.");
        return Ok(());
    }
    for message in messages {
        let subject = message
            .part("HEADER")
            .map(|part| {
                let headers = imap_engine::mime::parse_headers(&part.text());
                headers.get("subject").unwrap_or("(no subject)").to_string()
            })
            .unwrap_or_else(|| "(no headers)".to_string());
        println!("{:<8} {:<24} {}", message.uid, flags_summary(message), subject);
    }
    println!("\n{} message(s)", messages.len());
    Ok(())
}

fn flags_summary(message: &Message) -> String {
    if message.flags.is_empty() {
        "-".to_string()
    } else {
        message.flags.join(",")
    }
}
