//! Terminal chat client.
//!
//! Logs in (or reuses a stored token), opens the channel and relays stdin
//! lines as chat turns. Agent responses are printed as they arrive.
//!
//!   agentchat --username alice --password secret
//!
//! Commands:
//!   /attach <path>   upload a file and send it with the next message
//!   /detach <id>     drop an attachment
//!   /files           list attachments
//!   /model           show the selected model
//!   /logout          forget the stored token and exit
//!   /quit            exit

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentchat_client::{
    AttachmentSet, ChatSession, ClientConfig, ConnectionEvent, CredentialStore, Credentials,
    FileCredentialStore, LocalId, UploadFile,
};
use agentchat_core::format_file_size;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agentchat", about = "Chat with an agent backend from the terminal")]
struct Args {
    /// TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Base URL of the HTTP API
    #[arg(long, env = "AGENTCHAT_API_URL")]
    api_url: Option<String>,

    /// URL of the chat channel
    #[arg(long, env = "AGENTCHAT_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "AGENTCHAT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "AGENTCHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Directory holding the stored token
    #[arg(long, env = "AGENTCHAT_STATE_DIR", default_value = ".agentchat")]
    state_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("agentchat_cli=info".parse()?)
                .add_directive("agentchat_client=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    std::fs::create_dir_all(&args.state_dir)?;
    let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::in_dir(&args.state_dir));
    let credentials = match (args.username, args.password) {
        (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
        _ => None,
    };

    tracing::info!(api = %config.api_url, ws = %config.ws_url, "starting session");
    let session = ChatSession::start(config, store, credentials.as_ref()).await?;

    session.on_event(|event| match event.response_text() {
        Some(text) => println!("{text}"),
        None => tracing::debug!(kind = ?event.kind(), "event"),
    });

    let mut events = session.connection().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::StateChanged { from, to } => {
                    tracing::info!("connection {from} -> {to}");
                }
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    tracing::info!("reconnecting in {delay:?} (attempt {attempt})");
                }
                ConnectionEvent::ReconnectFailed { attempt, error } => {
                    tracing::warn!("reconnect attempt {attempt} failed: {error}");
                }
            }
        }
    });

    match session.model() {
        Some(model) => tracing::info!("using {} ({})", model.llm_name, model.provider),
        None => tracing::warn!("no model available, messages cannot be sent"),
    }

    let mut attachments: AttachmentSet = AttachmentSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "/quit" => break,
            "/logout" => {
                session.logout()?;
                tracing::info!("logged out");
                return Ok(());
            }
            "/model" => match session.model() {
                Some(m) => println!("{} / {} ({})", m.provider, m.llm_name, m.model),
                None => println!("no model selected"),
            },
            "/files" => {
                for entry in attachments.iter() {
                    let status = match (&entry.uploaded, &entry.error) {
                        (Some(u), _) => format!("uploaded as {}", u.id),
                        (None, Some(e)) => format!("failed: {e}"),
                        (None, None) if entry.uploading => "uploading".to_string(),
                        (None, None) => "pending".to_string(),
                    };
                    println!(
                        "[{}] {} ({}) {status}",
                        entry.id,
                        entry.file.name,
                        format_file_size(entry.file.size())
                    );
                }
            }
            "/attach" => {
                if let Err(e) = attach(&session, &mut attachments, Path::new(rest.trim())).await {
                    eprintln!("attach failed: {e}");
                }
            }
            "/detach" => match rest.trim().parse::<LocalId>() {
                Ok(id) if attachments.dismiss(id) => println!("removed [{id}]"),
                _ => eprintln!("no such attachment: {rest}"),
            },
            _ => {
                if let Err(e) = session.send_message(line, &mut attachments) {
                    eprintln!("not sent: {e}");
                }
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    }
    .with_env_overrides();
    if let Some(url) = &args.api_url {
        config.api_url = url.clone();
    }
    if let Some(url) = &args.ws_url {
        config.ws_url = url.clone();
    }
    Ok(config)
}

async fn attach(
    session: &ChatSession,
    attachments: &mut AttachmentSet,
    path: &Path,
) -> anyhow::Result<()> {
    let file = UploadFile::from_path(path).await?;
    let id = session.attach(attachments, file, None)?;
    let uploaded = session.upload(attachments, id).await?;
    println!("[{id}] {} uploaded", uploaded.original_name);
    Ok(())
}
