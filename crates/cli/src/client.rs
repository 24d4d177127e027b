use camino::Utf8PathBuf;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::api::codec::{Decoder, Encoder};
use crate::api::msg::OpResult;
use crate::api::{ApiError, Event, Op, Request, Response, ResponseBody};
use crate::CliError;

/// A connection to the control plane.
pub struct ControlClient {
    socket: Utf8PathBuf,
    token: Option<String>,
    next_id: u64,
}

/// An open, framed control connection.
struct Connection {
    reader: FramedRead<tokio::io::ReadHalf<UnixStream>, Decoder<Response>>,
    writer: FramedWrite<tokio::io::WriteHalf<UnixStream>, Encoder<Request>>,
}

impl ControlClient {
    pub fn new(socket: Utf8PathBuf, token: Option<String>) -> Self {
        ControlClient {
            socket,
            token,
            next_id: 1,
        }
    }

    async fn connect(&self) -> Result<Connection, CliError> {
        let stream =
            UnixStream::connect(self.socket.as_std_path())
                .await
                .map_err(|err| ApiError::Internal {
                    reason: format!("zonewalld is unreachable at '{}': {err}", self.socket),
                })?;
        let (read, write) = tokio::io::split(stream);
        Ok(Connection {
            reader: FramedRead::new(read, Decoder::default()),
            writer: FramedWrite::new(write, Encoder::default()),
        })
    }

    fn request(&mut self, op: Op) -> Request {
        let id = self.next_id;
        self.next_id += 1;
        Request {
            id,
            token: self.token.clone(),
            deadline_secs: Some(120),
            client_addr: None,
            op,
        }
    }

    /// One request/response round trip.
    pub async fn call(&mut self, op: Op) -> Result<OpResult, CliError> {
        let mut conn = self.connect().await?;
        let request = self.request(op);
        let id = request.id;

        conn.writer
            .send(&request)
            .await
            .map_err(|err| ApiError::Internal {
                reason: format!("could not send the request: {err}"),
            })?;

        loop {
            let frame = conn.reader.next().await.ok_or(ApiError::Internal {
                reason: "zonewalld hung up".into(),
            })?;
            let response = frame.map_err(|err| ApiError::Internal {
                reason: format!("bad frame from zonewalld: {err}"),
            })?;
            if response.id != id {
                continue;
            }
            if let ResponseBody::Result(result) = response.body {
                return result;
            }
        }
    }

    /// Subscribe and hand every event to `on_event` until the stream ends.
    pub async fn subscribe(
        &mut self,
        mut on_event: impl FnMut(Event),
    ) -> Result<(), CliError> {
        let mut conn = self.connect().await?;
        let request = self.request(Op::EventsSubscribe);
        let id = request.id;

        conn.writer
            .send(&request)
            .await
            .map_err(|err| ApiError::Internal {
                reason: format!("could not send the request: {err}"),
            })?;

        while let Some(frame) = conn.reader.next().await {
            let response = frame.map_err(|err| ApiError::Internal {
                reason: format!("bad frame from zonewalld: {err}"),
            })?;
            if response.id != id {
                continue;
            }
            match response.body {
                ResponseBody::Result(Ok(OpResult::Subscribed)) => continue,
                ResponseBody::Result(Ok(_)) => continue,
                ResponseBody::Result(Err(err)) => return Err(err),
                ResponseBody::Event(event) => on_event(event),
            }
        }
        Ok(())
    }
}
