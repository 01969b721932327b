use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Services exposed by the broker's request/reply endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Service {
    Login,
    AddUser,
    ListChannels,
    ListUsers,
    AddChannel,
    Subscribe,
    Publish,
    Message,
    GetTime,
}

/// Request envelope: a service name plus a free-form data map.
///
/// The data map always carries `lamport_clock`; after login it also carries
/// `token` and `user`. Built fresh for every call, never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub service: Service,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplyStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// Reply envelope from the broker.
///
/// `lamport_clock` is mandatory: a reply without it does not parse and is
/// reported as malformed rather than treated as a zero stamp. Service
/// specific fields (`channels`, `users`, `server_time_utc`) ride in `data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub lamport_clock: u64,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// One channel entry in a `listChannels` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEntry {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// A single feed delivery, topic-tagged by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub lamport_clock: u64,
    #[serde(flatten)]
    pub body: NotificationBody,
}

/// Payload shapes the feed carries. Direct messages are keyed by `from`,
/// channel broadcasts by `user`; anything else is non-conforming and gets
/// dropped by the listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NotificationBody {
    Direct { from: String, message: String },
    Broadcast { user: String, message: String },
}

/// Filter registration written upstream on the feed connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeFrame {
    pub subscribe: String,
}

/// Reads the next non-blank line and parses it as `T`.
///
/// Returns `Ok(None)` once the peer closes the connection. A line that is
/// not valid JSON for `T` surfaces as `InvalidData`; the line is already
/// consumed, so the caller may keep reading afterwards.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Serializes `frame` as one JSON line and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
