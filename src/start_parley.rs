//! Startup helpers for the `parley` command line client.
//!
//! Signs in, opens (or creates) a conversation, sends one message and logs the
//! resulting transcript.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use crate::sync::{SyncConfig, SyncServices, UserId, init_tracing};

/// Identity to sign in as; a fresh one is generated when unset.
const USER_ID_ENV: &str = "PARLEY_USER_ID";
/// Title of the conversation created when the identity has none.
const DEFAULT_TITLE: &str = "New conversation";
/// Message sent when none is given on the command line.
const DEFAULT_MESSAGE: &str = "hello";

/// Sign in, open the latest conversation and send one message.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
#[command(about = "Send a message to the latest conversation", long_about = None)]
struct Invocation {
    /// File to upload and attach to the message
    #[arg(long, value_name = "PATH")]
    attach: Option<PathBuf>,

    /// Message text; defaults to "hello" when neither text nor a file is given
    words: Vec<String>,
}

impl Invocation {
    fn message(&self) -> String {
        if self.words.is_empty() && self.attach.is_none() {
            DEFAULT_MESSAGE.to_string()
        } else {
            self.words.join(" ")
        }
    }
}

/// Run the client.
///
/// # Returns
/// `ExitCode::SUCCESS` when the message was sent, `1` on failure, or the
/// argument parser's code for usage errors and `--help`.
#[must_use]
pub fn run() -> ExitCode {
    let invocation = match Invocation::try_parse() {
        Ok(invocation) => invocation,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1));
        }
    };

    init_tracing();
    tracing::info!("Starting parley v{}", env!("CARGO_PKG_VERSION"));

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(chat_once(config, invocation)) {
        tracing::error!("parley failed: {e:#}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

fn identity() -> anyhow::Result<UserId> {
    match std::env::var(USER_ID_ENV) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{USER_ID_ENV} is not a valid id: {raw}")),
        Err(_) => Ok(UserId::new()),
    }
}

async fn chat_once(config: SyncConfig, invocation: Invocation) -> anyhow::Result<()> {
    let services = SyncServices::from_config(config)
        .await
        .context("failed to build services")?;
    let user = identity()?;

    let session = services.session();
    session.sign_in(user).await.context("sign-in failed")?;
    let store = session
        .store()
        .await
        .context("sign-in did not produce a conversation store")?;

    let conversation = match store.conversations().await.into_iter().next() {
        Some(conversation) => conversation,
        None => store.create(DEFAULT_TITLE).await?,
    };
    store.select(conversation.id).await?;
    tracing::info!(%user, conversation = %conversation.id, title = %conversation.title, "Conversation open");

    let attachment = match &invocation.attach {
        Some(path) => {
            let pipeline = session
                .attachments()
                .await
                .context("sign-in did not produce an attachment pipeline")?;
            let attachment = pipeline
                .attach_path(path)
                .await
                .with_context(|| format!("failed to attach {}", path.display()))?;
            Some(attachment)
        }
        None => None,
    };

    store
        .stream()
        .send(&invocation.message(), attachment)
        .await
        .context("failed to send message")?;

    for message in store.messages().await {
        tracing::info!(
            role = %message.role,
            attachment = message.attachment.as_ref().map_or("", |a| a.url.as_str()),
            "{}",
            message.content
        );
    }

    session.sign_out().await;
    Ok(())
}
