use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mailroom::config::Config;
use mailroom::mail::cache::INBOX;
use mailroom::mail::{
  CredentialSource, GmailBackend, MailBackend, MailCoordinator, OutgoingEmail, ServerBackend,
  ServerClient, ServerCredentials, StaticCredential,
};
use mailroom::query::{collection_query, QueryState};

#[derive(Parser, Debug)]
#[command(name = "mailroom")]
#[command(about = "Cache-aware mailbox client with Gmail and proxy-server backends")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mailroom/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List a page of messages under a label
  List {
    #[arg(short, long, default_value = INBOX)]
    label: String,
    #[arg(long)]
    page_size: Option<usize>,
    /// Continuation token from a previous page
    #[arg(long)]
    page_token: Option<String>,
  },
  /// Show a full message
  Show { id: String },
  /// Send a message
  Send {
    #[arg(long)]
    to: String,
    #[arg(long, default_value = "")]
    subject: String,
    #[arg(long)]
    body: String,
    #[arg(long)]
    cc: Option<String>,
    #[arg(long)]
    bcc: Option<String>,
  },
  /// Mark a message read or unread
  Mark {
    id: String,
    #[arg(long, conflicts_with = "unread")]
    read: bool,
    #[arg(long)]
    unread: bool,
  },
  /// Move a message to trash
  Delete { id: String },
  /// Show the signed-in user
  Profile,
  /// List the mailbox labels
  Labels,
  /// Show per-label message counts
  Stats,
  /// Show how many messages arrived today
  Today,
  /// End the server session
  Logout,
}

fn setup_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailroom=info"));

  let Some(path) = log_file else {
    tracing_subscriber::registry()
      .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
      .with(filter)
      .init();
    return Ok(None);
  };

  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  let name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();
  Ok(Some(guard))
}

fn build_coordinator(config: &Config) -> Result<MailCoordinator> {
  let server = ServerClient::new(&config.server_url)?;
  let secondary: Arc<dyn MailBackend> = Arc::new(ServerBackend::new(server.clone()));

  let preferred: Option<Arc<dyn MailBackend>> = if config.native.enabled {
    Some(Arc::new(GmailBackend::new(&config.native.api_base)?))
  } else {
    None
  };

  let credentials: Arc<dyn CredentialSource> = match Config::access_token_from_env() {
    Some(token) => {
      debug!("using access token from environment");
      Arc::new(StaticCredential::new(token))
    }
    None => Arc::new(ServerCredentials::new(server)),
  };

  Ok(MailCoordinator::new(
    preferred,
    secondary,
    credentials,
    config.coordinator_options(),
  ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn run(command: Command, config: &Config, mail: &MailCoordinator) -> Result<()> {
  match command {
    Command::List {
      label,
      page_size,
      page_token: None,
    } => {
      let mut query = collection_query(mail.clone(), page_size.unwrap_or(config.page_size));
      query.fetch(&label);
      match query.settle().await {
        QueryState::Success(page) => print_json(page),
        QueryState::Error(e) => Err(e.clone().into()),
        QueryState::Idle | QueryState::Loading => Err(eyre!("list of {} did not settle", label)),
      }
    }
    Command::List {
      label,
      page_size,
      page_token: Some(token),
    } => {
      let page = mail
        .fetch_collection(&label, page_size.unwrap_or(config.page_size), Some(&token))
        .await?;
      print_json(&page.data)
    }
    Command::Show { id } => print_json(&mail.fetch_item(&id).await?.data),
    Command::Send {
      to,
      subject,
      body,
      cc,
      bcc,
    } => {
      let mut message = OutgoingEmail::new(to, subject, body);
      message.cc = cc;
      message.bcc = bcc;
      print_json(&mail.send_item(message).await?)
    }
    Command::Mark { id, read, unread } => {
      if !read && !unread {
        return Err(eyre!("Pass --read or --unread"));
      }
      mail.mutate_read_state(&id, read).await?;
      print_json(&serde_json::json!({ "id": id, "read": read }))
    }
    Command::Delete { id } => {
      mail.delete_item(&id).await?;
      print_json(&serde_json::json!({ "id": id, "deleted": true }))
    }
    Command::Profile => print_json(&mail.user_profile().await?),
    Command::Labels => print_json(&mail.labels().await?),
    Command::Stats => print_json(&mail.mailbox_stats().await?),
    Command::Today => print_json(&mail.today_stats().await?),
    Command::Logout => {
      mail.logout().await?;
      print_json(&serde_json::json!({ "success": true }))
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = setup_tracing(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  info!(server = %config.server_url, native = config.native.enabled, "starting");

  let mail = build_coordinator(&config)?;
  let result = run(args.command, &config, &mail).await;
  mail.dispose();
  result
}
