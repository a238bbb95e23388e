//! Text-frame transports.
//!
//! The broker and both clients only ever see a [`Transport`]: a stream of
//! inbound frames and a sink for outbound ones. Two framings exist:
//!
//! - raw TCP with one JSON document per line, which keeps interoperability
//!   with netcat-style tools;
//! - WebSocket text frames, used by the browser viewer.

use std::{fmt, io, net::SocketAddr, pin::Pin, str::FromStr};

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{
    Sink, SinkExt, StreamExt, TryStreamExt, future,
    stream::BoxStream,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Upper bound on a single frame, in bytes.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

pub type FrameStream = BoxStream<'static, io::Result<String>>;
pub type FrameSink = Pin<Box<dyn Sink<String, Error = io::Error> + Send>>;

pub struct Transport {
    pub frames: FrameStream,
    pub sink: FrameSink,
    /// Remote address, for logging.
    pub peer: String,
}

impl Transport {
    pub fn tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();

        let frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH))
            .map_err(to_io_error)
            .try_filter(|line| future::ready(!line.trim().is_empty()))
            .boxed();
        let sink = SinkExt::<String>::sink_map_err(
            FramedWrite::new(writer, LinesCodec::new()),
            to_io_error,
        );

        Self {
            frames,
            sink: Box::pin(sink),
            peer,
        }
    }

    /// Wraps a socket upgraded by the broker's HTTP listener.
    pub fn axum_websocket(socket: WebSocket, peer: String) -> Self {
        let (sink, stream) = socket.split();

        let frames = stream
            .map_err(io::Error::other)
            .try_take_while(|message| future::ready(Ok(!matches!(message, AxumMessage::Close(_)))))
            .try_filter_map(|message| {
                future::ready(Ok(match message {
                    AxumMessage::Text(text) => Some(text),
                    _ => None,
                }))
            })
            .boxed();
        let sink = sink
            .sink_map_err(io::Error::other)
            .with(|frame: String| future::ready(Ok::<_, io::Error>(AxumMessage::Text(frame))));

        Self {
            frames,
            sink: Box::pin(sink),
            peer,
        }
    }

    /// Opens a client-side WebSocket to `url`.
    pub async fn connect_websocket(url: &str) -> io::Result<Self> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(io::Error::other)?;
        let (sink, stream) = socket.split();

        let frames = stream
            .map_err(io::Error::other)
            .try_take_while(|message| future::ready(Ok(!message.is_close())))
            .try_filter_map(|message| {
                future::ready(Ok(match message {
                    WsMessage::Text(text) => Some(text),
                    _ => None,
                }))
            })
            .boxed();
        let sink = sink
            .sink_map_err(io::Error::other)
            .with(|frame: String| future::ready(Ok::<_, io::Error>(WsMessage::Text(frame))));

        Ok(Self {
            frames,
            sink: Box::pin(sink),
            peer: url.to_string(),
        })
    }
}

/// Drains `outbound` into `sink` until every sender is dropped, writes the
/// frame left in `last`, if any, then closes the sink so the peer observes an
/// orderly shutdown.
pub async fn pump(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<String>,
    last: watch::Receiver<Option<String>>,
) -> io::Result<()> {
    while let Some(frame) = outbound.recv().await {
        sink.send(frame).await?;
    }

    let last = last.borrow().clone();
    if let Some(frame) = last {
        sink.send(frame).await?;
    }
    sink.close().await
}

/// Where a client connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Newline-delimited JSON over TCP.
    Tcp(SocketAddr),
    /// A `ws://` URL.
    WebSocket(String),
}

impl Endpoint {
    pub async fn open(&self) -> io::Result<Transport> {
        match self {
            Self::Tcp(addr) => Ok(Transport::tcp(TcpStream::connect(addr).await?)),
            Self::WebSocket(url) => Transport::connect_websocket(url).await,
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.starts_with("ws://") || value.starts_with("wss://") {
            return Ok(Self::WebSocket(value.to_string()));
        }

        let addr = value.strip_prefix("tcp://").unwrap_or(value);
        addr.parse()
            .map(Self::Tcp)
            .map_err(|err| format!("invalid endpoint '{value}': {err}"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::WebSocket(url) => f.write_str(url),
        }
    }
}

fn to_io_error(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(err) => err,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum length")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    async fn tcp_pair() -> (Transport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        (Transport::tcp(server), client)
    }

    #[tokio::test]
    async fn tcp_frames_skip_blank_lines_and_crlf() {
        let (mut transport, mut client) = tcp_pair().await;
        client
            .write_all(b"\n{\"a\":1}\r\n\r\n{\"b\":2}\n")
            .await
            .expect("write");

        let first = transport.frames.next().await.expect("first").expect("ok");
        let second = transport.frames.next().await.expect("second").expect("ok");
        assert_eq!(first, "{\"a\":1}");
        assert_eq!(second, "{\"b\":2}");

        drop(client);
        assert!(transport.frames.next().await.is_none());
    }

    #[tokio::test]
    async fn pump_writes_lines_then_the_last_frame_and_closes() {
        let (transport, client) = tcp_pair().await;
        let (tx, rx) = mpsc::channel(4);
        let (last, last_rx) = watch::channel(None);
        tx.send("one".to_string()).await.expect("queue");
        tx.send("two".to_string()).await.expect("queue");
        last.send_replace(Some("bye".to_string()));
        drop(tx);

        pump(transport.sink, rx, last_rx).await.expect("pump");

        let mut reader = Transport::tcp(client);
        for expected in ["one", "two", "bye"] {
            let frame = reader.frames.next().await.expect("frame").expect("ok");
            assert_eq!(frame, expected);
        }
        assert!(reader.frames.next().await.is_none());
    }

    #[test]
    fn parses_endpoints() {
        assert_eq!(
            "ws://127.0.0.1:7229/subscribe".parse::<Endpoint>(),
            Ok(Endpoint::WebSocket("ws://127.0.0.1:7229/subscribe".into()))
        );
        assert_eq!(
            "tcp://127.0.0.1:7228".parse::<Endpoint>(),
            Ok(Endpoint::Tcp("127.0.0.1:7228".parse().expect("addr")))
        );
        assert_eq!(
            "127.0.0.1:7228".parse::<Endpoint>(),
            Ok(Endpoint::Tcp("127.0.0.1:7228".parse().expect("addr")))
        );
        assert!("radar.example".parse::<Endpoint>().is_err());
    }
}
