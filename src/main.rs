use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use dashq::config::Config;
use dashq::{dashboard, logging, CacheKey, HttpTransport, Observer, QueryClient, QueryState};

#[derive(Parser, Debug)]
#[command(name = "dashq")]
#[command(about = "Query cache for the classroom dashboard API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dashq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overrides the config file
  #[arg(long)]
  base_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Subscribe to the configured endpoints and log every change
  Watch,
  /// Fetch one endpoint and print the response
  Fetch {
    endpoint: String,
    /// Arguments as JSON
    #[arg(default_value = "null")]
    args: String,
  },
  /// Print the cache key for an endpoint call
  Key {
    endpoint: String,
    #[arg(default_value = "null")]
    args: String,
  },
}

fn parse_args(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON arguments {:?}: {}", raw, e))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  if let Command::Key { endpoint, args } = &args.command {
    println!("{}", CacheKey::new(endpoint, &parse_args(args)?));
    return Ok(());
  }

  let _guard = logging::init(matches!(args.command, Command::Watch))?;

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(base_url) = args.base_url {
    config.api.base_url = base_url;
  }

  let transport = HttpTransport::new(&config.api.base_url, config.get_api_token())?;
  let client = dashboard::client(
    Arc::new(transport),
    config.tag_relations()?,
    config.client_options(),
  );

  match args.command {
    Command::Watch => watch(&client, &config).await?,
    Command::Fetch { endpoint, args } => {
      let data = client.query(&endpoint, parse_args(&args)?).await?;
      println!("{}", serde_json::to_string_pretty(&*data)?);
    }
    Command::Key { .. } => {}
  }

  client.reset();
  Ok(())
}

fn report(observer: &Observer) {
  match observer.state() {
    QueryState::Idle | QueryState::Loading => info!(key = %observer.key(), "loading"),
    QueryState::Success(data) => info!(key = %observer.key(), bytes = data.to_string().len(), "updated"),
    QueryState::Fallback { error, .. } => {
      warn!(key = %observer.key(), kind = ?error.kind, "refresh failed, showing cached data")
    }
    QueryState::Error(error) => warn!(key = %observer.key(), error = %error, "fetch failed"),
  }
}

async fn watch(client: &QueryClient, config: &Config) -> Result<()> {
  let targets: Vec<(String, Value)> = if config.watch.is_empty() {
    vec![
      (dashboard::GET_DASHBOARD.to_string(), Value::Null),
      (dashboard::GET_MESSAGES.to_string(), Value::Null),
    ]
  } else {
    config
      .watch
      .iter()
      .map(|w| (w.endpoint.clone(), w.args.clone()))
      .collect()
  };

  // Listen before the first fetch starts
  let mut updates = client.updates();
  let mut notifications = client.notifications();

  let mut observers = Vec::with_capacity(targets.len());
  for (endpoint, args) in targets {
    let observer = Observer::new(client, &endpoint, args)?;
    info!(key = %observer.key(), "watching");
    observers.push(observer);
  }

  let unread = dashboard::unread_message_count();
  let inbox = [CacheKey::new(dashboard::GET_MESSAGES, &Value::Null)];
  let mut last_unread = None;

  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    tokio::select! {
      _ = &mut ctrl_c => {
        info!("interrupted");
        break;
      }
      note = notifications.recv() => match note {
        Ok(note) => info!(level = ?note.level, message = %note.message, "notification"),
        Err(RecvError::Lagged(missed)) => warn!(missed, "notifications dropped"),
        Err(RecvError::Closed) => break,
      },
      update = updates.recv() => match update {
        Ok(_) | Err(RecvError::Lagged(_)) => {
          for observer in &mut observers {
            if observer.poll() {
              report(observer);
            }
          }
          if let Some(count) = unread.select_in(client, &inbox) {
            if last_unread != Some(*count) {
              info!(unread = *count, "unread messages");
              last_unread = Some(*count);
            }
          }
        }
        Err(RecvError::Closed) => break,
      },
    }
  }

  Ok(())
}
