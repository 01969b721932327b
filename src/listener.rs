use std::{collections::HashSet, future::Future, io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    clock::LamportClock,
    session::Session,
    wire::{Notification, NotificationBody, SubscribeFrame, read_frame, write_frame},
};

/// Topic filters active on the feed connection.
///
/// The relay matches topics by exact or prefix comparison; the listener
/// applies the same rule locally so an over-delivering relay cannot leak
/// foreign topics into the terminal.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    filters: HashSet<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter. Returns `false` when it was already present, so
    /// repeated subscriptions stay idempotent.
    pub fn insert(&mut self, topic: &str) -> bool {
        self.filters.insert(topic.to_string())
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.filters
            .iter()
            .any(|filter| topic.starts_with(filter.as_str()))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Dispatcher-side handle for adding topic filters to a running listener.
///
/// Sends are non-blocking; the listener registers the filter upstream the
/// next time it is scheduled, without interrupting an in-progress receive.
#[derive(Debug, Clone)]
pub struct FilterHandle {
    additions: mpsc::UnboundedSender<String>,
}

impl FilterHandle {
    pub fn add(&self, topic: &str) {
        // A closed channel means the listener already shut down; nothing
        // left to subscribe on.
        let _ = self.additions.send(topic.to_string());
    }
}

/// Background receiver for the publish/subscribe feed.
///
/// Runs for the lifetime of an authenticated session: registers topic
/// filters upstream, receives notification lines, folds their clock stamps
/// into the shared Lamport clock, and renders them without corrupting the
/// interactive prompt.
pub struct Listener {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    clock: Arc<LamportClock>,
    session: Arc<Session>,
    filters: SubscriptionSet,
    additions: mpsc::UnboundedReceiver<String>,
}

impl Listener {
    /// Connects to the feed and registers the session's own identity, the
    /// topic its direct messages arrive on.
    pub async fn connect(
        addr: SocketAddr,
        clock: Arc<LamportClock>,
        session: Arc<Session>,
    ) -> io::Result<(Self, FilterHandle)> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut listener = Self {
            reader: BufReader::new(reader),
            writer,
            clock,
            session: Arc::clone(&session),
            filters: SubscriptionSet::new(),
            additions: rx,
        };
        register(
            &mut listener.filters,
            &mut listener.writer,
            session.identity.clone(),
        )
        .await?;

        Ok((listener, FilterHandle { additions: tx }))
    }

    /// Receive loop. Runs until `shutdown` resolves or the feed connection
    /// closes; filter additions are folded in between receives.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Listener {
            mut reader,
            mut writer,
            clock,
            session,
            mut filters,
            mut additions,
        } = self;
        tokio::pin!(shutdown);
        let mut additions_open = true;

        loop {
            select! {
                _ = &mut shutdown => {
                    debug!("listener shutting down");
                    break;
                }
                addition = additions.recv(), if additions_open => {
                    match addition {
                        Some(topic) => register(&mut filters, &mut writer, topic).await?,
                        None => additions_open = false,
                    }
                }
                frame = read_frame::<_, Notification>(&mut reader) => {
                    match frame {
                        Ok(Some(notification)) => {
                            handle_notification(&clock, &filters, &session, notification).await?;
                        }
                        Ok(None) => {
                            warn!("feed connection closed");
                            break;
                        }
                        // Best-effort feed: a payload we cannot make sense
                        // of is dropped without touching the clock.
                        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                            debug!(?err, "discarding malformed notification");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        Ok(())
    }
}

async fn register(
    filters: &mut SubscriptionSet,
    writer: &mut OwnedWriteHalf,
    topic: String,
) -> io::Result<()> {
    if !filters.insert(&topic) {
        return Ok(());
    }
    write_frame(writer, &SubscribeFrame { subscribe: topic }).await
}

async fn handle_notification(
    clock: &LamportClock,
    filters: &SubscriptionSet,
    session: &Session,
    notification: Notification,
) -> io::Result<()> {
    clock.observe(notification.lamport_clock);
    if !filters.matches(&notification.topic) {
        debug!(topic = %notification.topic, "ignoring unsubscribed topic");
        return Ok(());
    }
    render(&session.identity, &format_notification(&notification)).await
}

/// Renders one notification line without corrupting the prompt: erase the
/// current input line, print, redraw the prompt.
async fn render(identity: &str, text: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    let erase = format!("\r{}\r", " ".repeat(80));
    stdout.write_all(erase.as_bytes()).await?;
    stdout.write_all(text.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout
        .write_all(format!("[{identity}] > ").as_bytes())
        .await?;
    stdout.flush().await
}

fn format_notification(notification: &Notification) -> String {
    match &notification.body {
        NotificationBody::Direct { from, message } => format!("(dm) {from}: {message}"),
        NotificationBody::Broadcast { user, message } => {
            format!("[{}] {}: {}", notification.topic, user, message)
        }
    }
}
