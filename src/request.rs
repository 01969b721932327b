use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use serde_json::{Map, Value};
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

use crate::{
    clock::LamportClock,
    wire::{Reply, Request, Service, read_frame, write_frame},
};

/// Failure modes of a single request/reply exchange.
///
/// An application-level `status=ERROR` reply is not represented here: it is
/// a well-formed [`Reply`] the caller renders. These variants cover the
/// cases where no usable reply exists at all, and the caller decides
/// whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
}

/// Synchronous call/response channel to the broker.
///
/// One TCP connection, strict request/reply discipline: `&mut self` on
/// [`call`] keeps at most one exchange in flight.
///
/// [`call`]: RequestChannel::call
pub struct RequestChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    clock: Arc<LamportClock>,
    reply_timeout: Duration,
}

impl RequestChannel {
    pub async fn connect(
        addr: SocketAddr,
        clock: Arc<LamportClock>,
        reply_timeout: Duration,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            clock,
            reply_timeout,
        })
    }

    /// Performs one exchange: tick the clock, stamp and send the request,
    /// await exactly one reply, fold its stamp back in, return it.
    pub async fn call(
        &mut self,
        service: Service,
        mut data: Map<String, Value>,
    ) -> Result<Reply, CallError> {
        data.insert("lamport_clock".into(), self.clock.tick().into());
        let request = Request { service, data };
        write_frame(&mut self.writer, &request)
            .await
            .map_err(CallError::Transport)?;

        let pending = read_frame::<_, Reply>(&mut self.reader);
        let reply = match timeout(self.reply_timeout, pending).await {
            Err(_) => return Err(CallError::TimedOut(self.reply_timeout)),
            Ok(Err(err)) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(CallError::MalformedReply(err.to_string()));
            }
            Ok(Err(err)) => return Err(CallError::Transport(err)),
            Ok(Ok(None)) => {
                return Err(CallError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed while awaiting a reply",
                )));
            }
            Ok(Ok(Some(reply))) => reply,
        };

        self.clock.observe(reply.lamport_clock);
        Ok(reply)
    }
}
