//! Binary entrypoint for the roomcast CLI.
//!
//! Commands:
//! - `init` - write a default `roomcast.toml` and create the data directory
//! - `status [--room <room>]` - record counts and process counters as JSON
//! - `create-room <creator> <members>... [--group]` - one-to-one or group room
//! - `add-members <room> <actor> <members>...`
//! - `send <room> <body> [--sender <user>]` - no sender sends a system message
//! - `redeliver <message>` - reconcile mailboxes and counters for a stored message
//! - `inbox <user>`, `history <user> <mailbox>`, `clear <user> <mailbox>`
//! - `room-log <user> <room>` - room-level history, independent of mailboxes
//! - `mark-read <user> <room> <message>`
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use roomcast::config::Config;
use roomcast::fanout::{Orchestrator, OrchestratorBuilder, SessionHub};
use roomcast::metrics;
use roomcast::storage::{ChatStore, ChatStoreBuilder, RoomDirectory};
use roomcast::tasks::{start_task_queue, LogNotifier};
use roomcast::types::MessageDraft;

#[derive(Parser)]
#[command(name = "roomcast")]
#[command(about = "Chat room message fan-out over an embedded store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "roomcast.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Show store and process counters
    Status {
        /// Also list the read tracking entries of this room
        #[arg(long)]
        room: Option<String>,
    },
    /// Create a room; a single member without --group makes a one-to-one room
    CreateRoom {
        creator: String,
        #[arg(required = true)]
        members: Vec<String>,
        #[arg(long)]
        group: bool,
    },
    /// Add members to a group room
    AddMembers {
        room: String,
        actor: String,
        #[arg(required = true)]
        members: Vec<String>,
    },
    /// Send a message to a room
    Send {
        room: String,
        body: String,
        /// Omit to send a system message
        #[arg(short, long)]
        sender: Option<String>,
    },
    /// Re-run mailbox and counter fan-out for a stored message
    Redeliver { message: String },
    /// List a user's conversations
    Inbox {
        user: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the messages in a user's mailbox, newest first
    History {
        user: String,
        mailbox: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show every message of a room the user belongs to, newest first
    RoomLog {
        user: String,
        room: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Clear a conversation from a user's mailbox list
    Clear { user: String, mailbox: String },
    /// Mark a room read up to a message
    MarkRead {
        user: String,
        room: String,
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        let config = Config::load(&cli.config).await?;
        tokio::fs::create_dir_all(&config.storage.data_dir).await?;
        info!(
            "Configuration file created at {} (data in {})",
            cli.config, config.storage.data_dir
        );
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);
    let store = ChatStoreBuilder::new(&config.storage.data_dir)
        .flush_on_write(config.storage.flush_on_write)
        .open()?;

    match cli.command {
        Commands::Init => {}
        Commands::Status { room } => {
            let stats = store.stats();
            let counters = metrics::snapshot();
            let read_tracking = match room {
                Some(room) => Some(store.read_tracking().list_room(&room)?),
                None => None,
            };
            let payload = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "data_dir": config.storage.data_dir,
                "messages": stats.messages,
                "rooms": stats.rooms,
                "mailboxes": stats.mailboxes,
                "links": stats.links,
                "read_tracking": stats.read_tracking,
                "degraded_total": counters.degraded_total(),
                "room_read_tracking": read_tracking,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::CreateRoom {
            creator,
            members,
            group,
        } => {
            let rooms = store.rooms();
            let room = if !group && members.len() == 1 {
                rooms.create_one_to_one(&creator, &members[0])?
            } else {
                rooms.create_group(&creator, &members)?
            };
            println!("{}", serde_json::to_string_pretty(&room)?);
        }
        Commands::AddMembers {
            room,
            actor,
            members,
        } => {
            let room = store.rooms().add_members(&room, &actor, &members)?;
            println!("{}", serde_json::to_string_pretty(&room)?);
        }
        Commands::Send { room, body, sender } => {
            let tasks = start_task_queue(config.tasks.queue_config());
            let orchestrator = orchestrator_builder(&store, &config)
                .notifier(tasks.clone(), Arc::new(LogNotifier))
                .build();
            let draft = MessageDraft::new(body);
            let message = match sender {
                Some(sender) => orchestrator.send_to_room(&draft, &room, &sender)?,
                None => {
                    let snapshot = store.rooms().snapshot(&room)?;
                    orchestrator.send_system_message(&draft, &snapshot)?
                }
            };
            tasks.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Commands::Redeliver { message } => {
            let outcome = orchestrator_builder(&store, &config).build().redeliver(&message)?;
            println!(
                "mailboxes={} credited={} degraded={}",
                outcome.mailboxes, outcome.credited, outcome.degraded
            );
        }
        Commands::Inbox {
            user,
            offset,
            limit,
        } => {
            let orchestrator = orchestrator_builder(&store, &config).build();
            let entries = orchestrator.mailboxes_for_user(&user, offset, limit)?;
            for entry in entries {
                let new = orchestrator.count_new_messages(&entry.mailbox.room_id, &user)?;
                let last = entry
                    .last_activity
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  room={}  unread={}  new={}  last={}",
                    entry.mailbox.id, entry.mailbox.room_id, entry.unread_count, new, last
                );
            }
        }
        Commands::History {
            user,
            mailbox,
            offset,
            limit,
        } => {
            let messages = orchestrator_builder(&store, &config)
                .build()
                .history(&mailbox, &user, offset, limit)?;
            for message in messages {
                println!(
                    "{} [{}] {}: {}",
                    message.created_at.format("%Y-%m-%d %H:%M:%S"),
                    message.id,
                    message.sender_id.as_deref().unwrap_or("system"),
                    message.body
                );
            }
        }
        Commands::RoomLog {
            user,
            room,
            offset,
            limit,
        } => {
            let messages = orchestrator_builder(&store, &config)
                .build()
                .room_messages(&room, &user, offset, limit)?;
            for message in messages {
                println!(
                    "{} [{}] {}: {}",
                    message.created_at.format("%Y-%m-%d %H:%M:%S"),
                    message.id,
                    message.sender_id.as_deref().unwrap_or("system"),
                    message.body
                );
            }
        }
        Commands::Clear { user, mailbox } => {
            let removed = orchestrator_builder(&store, &config)
                .build()
                .clear_mailbox(&mailbox, &user)?;
            println!("cleared {} ({} messages detached)", mailbox, removed);
        }
        Commands::MarkRead {
            user,
            room,
            message,
        } => {
            orchestrator_builder(&store, &config)
                .build()
                .mark_read(&user, &room, &message)?;
            println!("{} read {} up to {}", user, room, message);
        }
    }

    store.flush()?;
    Ok(())
}

fn orchestrator_builder(store: &ChatStore, config: &Config) -> OrchestratorBuilder {
    let hub = Arc::new(SessionHub::new(config.fanout.channel_capacity));
    Orchestrator::builder(store, hub)
        .topic(config.fanout.push_topic.clone())
        .max_body_bytes(config.fanout.max_body_bytes)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Console output only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
