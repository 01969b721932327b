use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin},
    sync::oneshot,
};
use tracing::warn;

use crate::{
    clock::LamportClock,
    listener::{FilterHandle, Listener},
    request::{CallError, RequestChannel},
    session::Session,
    wire::{ChannelEntry, Reply, ReplyStatus, Service},
};

/// One parsed line of the authenticated command loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    ListChannels,
    ListUsers,
    CreateChannel { title: String, description: String },
    Subscribe { channel: String },
    Publish { channel: String, body: String },
    DirectMessage { target: String, body: String },
    SyncTime,
    Help,
    Quit,
}

impl Command {
    /// Parses a command line into a command.
    ///
    /// `Ok(None)` means the line was empty: re-prompt, no request issued.
    /// Channel names are normalized to lowercase, matching the broker's
    /// storage convention; message bodies keep their case.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let (name, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (trimmed, ""),
        };

        let no_args = |command: Command| {
            if rest.is_empty() {
                Ok(Some(command))
            } else {
                Err(anyhow!("'{name}' takes no arguments"))
            }
        };

        match name {
            "list-channels" => no_args(Self::ListChannels),
            "list-users" => no_args(Self::ListUsers),
            "sync-time" => no_args(Self::SyncTime),
            "help" => no_args(Self::Help),
            "quit" => no_args(Self::Quit),
            "create-channel" => match split_arg(rest) {
                Some((title, description)) if !description.is_empty() => {
                    Ok(Some(Self::CreateChannel {
                        title: title.to_lowercase(),
                        description: description.to_string(),
                    }))
                }
                _ => Err(anyhow!("usage: create-channel <title> <description>")),
            },
            "subscribe" => match split_arg(rest) {
                Some((channel, "")) => Ok(Some(Self::Subscribe {
                    channel: channel.to_lowercase(),
                })),
                _ => Err(anyhow!("usage: subscribe <channel>")),
            },
            "publish" => match split_arg(rest) {
                Some((channel, body)) if !body.is_empty() => Ok(Some(Self::Publish {
                    channel: channel.to_lowercase(),
                    body: body.to_string(),
                })),
                _ => Err(anyhow!("usage: publish <channel> <body>")),
            },
            "direct-message" => match split_arg(rest) {
                Some((target, body)) if !body.is_empty() => Ok(Some(Self::DirectMessage {
                    target: target.to_string(),
                    body: body.to_string(),
                })),
                _ => Err(anyhow!("usage: direct-message <user> <body>")),
            },
            _ => Err(anyhow!(
                "unknown command '{name}'; type 'help' for the command list"
            )),
        }
    }
}

fn split_arg(rest: &str) -> Option<(&str, &str)> {
    if rest.is_empty() {
        return None;
    }
    match rest.split_once(char::is_whitespace) {
        Some((first, tail)) => Some((first, tail.trim())),
        None => Some((rest, "")),
    }
}

/// The interactive control loop.
///
/// Drives the pre-authentication menu, then the command loop, issuing one
/// request/reply exchange per command while the listener task interleaves
/// feed output. Owns the Session once login succeeds.
pub struct Dispatcher {
    channel: RequestChannel,
    clock: Arc<LamportClock>,
    feed_addr: SocketAddr,
}

impl Dispatcher {
    pub fn new(channel: RequestChannel, clock: Arc<LamportClock>, feed_addr: SocketAddr) -> Self {
        Self {
            channel,
            clock,
            feed_addr,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut stdin = BufReader::new(tokio::io::stdin());

        let session = match self.anonymous_phase(&mut stdin).await? {
            Some(session) => session,
            None => return Ok(()),
        };

        let (listener, filters) = Listener::connect(
            self.feed_addr,
            Arc::clone(&self.clock),
            Arc::clone(&session),
        )
        .await
        .context("failed to connect to the broadcast feed")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let listener_task = tokio::spawn(listener.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        let outcome = self.command_loop(&mut stdin, &session, &filters).await;

        let _ = shutdown_tx.send(());
        match listener_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(?err, "listener exited with an error"),
            Err(err) => warn!(?err, "listener task failed"),
        }

        outcome
    }

    /// Pre-authentication menu. Returns the session on successful login,
    /// or `None` when the user quits (or stdin closes).
    ///
    /// A transport failure here is fatal: there is no session to salvage,
    /// so the error propagates and the process exits non-zero.
    async fn anonymous_phase(
        &mut self,
        stdin: &mut BufReader<Stdin>,
    ) -> Result<Option<Arc<Session>>> {
        loop {
            out("").await?;
            out("1. Log in").await?;
            out("2. Register").await?;
            out("3. Quit").await?;
            let Some(choice) = prompt_line(stdin, "choice: ").await? else {
                return Ok(None);
            };

            let register = match choice.as_str() {
                "1" => false,
                "2" => true,
                "3" => {
                    out("goodbye").await?;
                    return Ok(None);
                }
                "" => continue,
                _ => {
                    out("invalid choice; pick 1, 2, or 3").await?;
                    continue;
                }
            };

            let Some(identity) = prompt_line(stdin, "identity: ").await? else {
                return Ok(None);
            };
            let Some(secret) = prompt_line(stdin, "secret: ").await? else {
                return Ok(None);
            };

            let mut data = Map::new();
            data.insert("identity".into(), identity.clone().into());
            data.insert("secret".into(), secret.into());
            let service = if register {
                Service::AddUser
            } else {
                Service::Login
            };

            let reply = match self.channel.call(service, data).await {
                Ok(reply) => reply,
                Err(CallError::Transport(err)) => {
                    out("cannot reach the broker; giving up").await?;
                    return Err(anyhow::Error::new(err)
                        .context("broker connection failed before sign-in"));
                }
                Err(err) => {
                    out(&format!("call failed: {err}")).await?;
                    continue;
                }
            };

            match reply.status {
                ReplyStatus::Error => out(&error_line(&reply)).await?,
                ReplyStatus::Ok if register => {
                    out("registered; log in to continue").await?;
                }
                ReplyStatus::Ok => {
                    let Some(token) = reply.token.clone() else {
                        warn!("login reply carried no session token");
                        out("unexpected response: login reply carried no token").await?;
                        continue;
                    };
                    let identity = reply.user.clone().unwrap_or(identity);
                    let session = Arc::new(Session::new(identity, token));
                    out(&format!("logged in as {}", session.identity)).await?;
                    if session.is_agent {
                        out("agent session: tracking every channel it learns about").await?;
                    }
                    return Ok(Some(session));
                }
            }
        }
    }

    async fn command_loop(
        &mut self,
        stdin: &mut BufReader<Stdin>,
        session: &Arc<Session>,
        filters: &FilterHandle,
    ) -> Result<()> {
        out("type 'help' for the command list").await?;
        loop {
            let prompt = format!("[{}] > ", session.identity);
            let Some(line) = prompt_line(stdin, &prompt).await? else {
                break;
            };

            let command = match Command::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(err) => {
                    out(&err.to_string()).await?;
                    continue;
                }
            };

            if !self.handle(command, session, filters).await? {
                break;
            }
        }
        Ok(())
    }

    /// Executes one command. Returns `false` when the loop should end.
    async fn handle(
        &mut self,
        command: Command,
        session: &Session,
        filters: &FilterHandle,
    ) -> Result<bool> {
        match command {
            Command::Quit => {
                out("goodbye").await?;
                return Ok(false);
            }
            Command::Help => render_help().await?,
            Command::ListChannels => {
                let data = base_data(session);
                if let Some(reply) = self.call_checked(Service::ListChannels, data).await? {
                    render_channels(&reply, session, filters).await?;
                }
            }
            Command::ListUsers => {
                let data = base_data(session);
                if let Some(reply) = self.call_checked(Service::ListUsers, data).await? {
                    render_users(&reply).await?;
                }
            }
            Command::CreateChannel { title, description } => {
                let mut data = base_data(session);
                data.insert("title".into(), title.clone().into());
                data.insert("description".into(), description.into());
                if let Some(reply) = self.call_checked(Service::AddChannel, data).await? {
                    match reply.status {
                        ReplyStatus::Ok => {
                            out(&format!("channel '{title}' created")).await?;
                            if session.is_agent {
                                filters.add(&title);
                            }
                        }
                        ReplyStatus::Error => out(&error_line(&reply)).await?,
                    }
                }
            }
            Command::Subscribe { channel } => {
                let mut data = base_data(session);
                data.insert("channelName".into(), channel.clone().into());
                if let Some(reply) = self.call_checked(Service::Subscribe, data).await? {
                    match reply.status {
                        ReplyStatus::Ok => {
                            filters.add(&channel);
                            let confirmation = reply
                                .message
                                .clone()
                                .unwrap_or_else(|| format!("subscribed to '{channel}'"));
                            out(&confirmation).await?;
                        }
                        ReplyStatus::Error => out(&error_line(&reply)).await?,
                    }
                }
            }
            Command::Publish { channel, body } => {
                let mut data = base_data(session);
                data.insert("channelName".into(), channel.clone().into());
                data.insert("body".into(), body.into());
                data.insert("timestamp".into(), Utc::now().to_rfc3339().into());
                if let Some(reply) = self.call_checked(Service::Publish, data).await? {
                    match reply.status {
                        ReplyStatus::Ok => out(&format!("published to '{channel}'")).await?,
                        ReplyStatus::Error => out(&error_line(&reply)).await?,
                    }
                }
            }
            Command::DirectMessage { target, body } => {
                let mut data = base_data(session);
                data.insert("targetIdentity".into(), target.clone().into());
                data.insert("body".into(), body.into());
                data.insert("timestamp".into(), Utc::now().to_rfc3339().into());
                if let Some(reply) = self.call_checked(Service::Message, data).await? {
                    match reply.status {
                        ReplyStatus::Ok => out(&format!("message sent to '{target}'")).await?,
                        ReplyStatus::Error => out(&error_line(&reply)).await?,
                    }
                }
            }
            Command::SyncTime => {
                let data = base_data(session);
                if let Some(reply) = self.call_checked(Service::GetTime, data).await? {
                    render_time(&reply).await?;
                }
            }
        }
        Ok(true)
    }

    /// Issues one call and renders any channel-level failure. After login
    /// no call failure is fatal; the user decides whether to retry.
    async fn call_checked(
        &mut self,
        service: Service,
        data: Map<String, Value>,
    ) -> Result<Option<Reply>> {
        match self.channel.call(service, data).await {
            Ok(reply) => Ok(Some(reply)),
            Err(err @ CallError::MalformedReply(_)) => {
                warn!(%err, "protocol error on the request channel");
                out(&format!("unexpected response: {err}")).await?;
                Ok(None)
            }
            Err(err) => {
                out(&format!("call failed: {err}")).await?;
                Ok(None)
            }
        }
    }
}

/// Data map every authenticated request starts from. The clock stamp is
/// added by the request channel at send time.
fn base_data(session: &Session) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("token".into(), session.token.clone().into());
    data.insert("user".into(), session.identity.clone().into());
    data
}

fn error_line(reply: &Reply) -> String {
    format!(
        "error: {}",
        reply.message.as_deref().unwrap_or("request rejected")
    )
}

async fn render_channels(reply: &Reply, session: &Session, filters: &FilterHandle) -> Result<()> {
    if reply.status == ReplyStatus::Error {
        out(&error_line(reply)).await?;
        return Ok(());
    }
    let channels: Vec<ChannelEntry> = match reply
        .data
        .get("channels")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(channels)) => channels,
        _ => {
            warn!("listChannels reply carried no channel list");
            out("unexpected response: reply carried no channel list").await?;
            return Ok(());
        }
    };

    out("--- channels ---").await?;
    if channels.is_empty() {
        out("  (none)").await?;
    }
    for channel in &channels {
        out(&format!("  {}: {}", channel.title, channel.description)).await?;
    }
    if session.is_agent {
        for channel in &channels {
            filters.add(&channel.title);
        }
    }
    Ok(())
}

async fn render_users(reply: &Reply) -> Result<()> {
    if reply.status == ReplyStatus::Error {
        out(&error_line(reply)).await?;
        return Ok(());
    }
    let users: Vec<String> = match reply.data.get("users").cloned().map(serde_json::from_value) {
        Some(Ok(users)) => users,
        _ => {
            warn!("listUsers reply carried no user list");
            out("unexpected response: reply carried no user list").await?;
            return Ok(());
        }
    };

    out("--- users ---").await?;
    if users.is_empty() {
        out("  (none)").await?;
    }
    for user in &users {
        out(&format!("  {user}")).await?;
    }
    Ok(())
}

async fn render_time(reply: &Reply) -> Result<()> {
    if reply.status == ReplyStatus::Error {
        out(&error_line(reply)).await?;
        return Ok(());
    }
    match reply.data.get("server_time_utc").and_then(Value::as_str) {
        Some(server) => {
            out(&format!("server: {server}")).await?;
            out(&format!("local:  {}", Utc::now().to_rfc3339())).await?;
        }
        None => {
            warn!("getTime reply carried no server time");
            out("unexpected response: reply carried no server time").await?;
        }
    }
    Ok(())
}

async fn render_help() -> io::Result<()> {
    out("commands:").await?;
    out("  list-channels                    list known channels").await?;
    out("  list-users                       list registered users").await?;
    out("  create-channel <title> <desc>    create a channel").await?;
    out("  subscribe <channel>              receive a channel's broadcasts").await?;
    out("  publish <channel> <body>         publish to a channel").await?;
    out("  direct-message <user> <body>     send a direct message").await?;
    out("  sync-time                        compare server and local clocks").await?;
    out("  help                             show this list").await?;
    out("  quit                             exit").await
}

async fn out(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn prompt_line(stdin: &mut BufReader<Stdin>, prompt: &str) -> io::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;

    let mut line = String::new();
    let bytes = stdin.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
