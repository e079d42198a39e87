//! Frame transports between a connection and a host agent
//!
//! A [`Connector`] opens one transport per connection attempt. The connection
//! layer only sees a sink and a stream of JSON text frames, so it can run on top
//! of a real WebSocket or on in-process channels.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::channel::mpsc as frames;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::Uri},
};
use tracing::debug;

use crate::config::HostTarget;

/// Outbound half of a transport
pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;

/// Inbound half of a transport; ends when the remote side closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open transport to one agent
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens transports to host agents
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport to `target`.
    ///
    /// Returning `Ok` means the transport is open and frames can be sent.
    async fn connect(&self, target: &HostTarget) -> Result<Transport>;
}

/// Connects to agents over WebSocket (`ws://host:port/ws`)
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    user_agent: String,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            user_agent: format!("hostwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Transport> {
        let url = target.url();

        let uri: Uri = url.parse().context("Failed to parse WebSocket URL")?;

        let host = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("WebSocket URL missing host"))?
            .as_str()
            .to_string();

        let origin_scheme = if target.secure { "https" } else { "http" };
        let origin = format!("{}://{}", origin_scheme, host);

        // into_client_request() keeps the TLS/SNI configuration derived from the URL
        let mut request = url
            .as_str()
            .into_client_request()
            .context("Failed to create WebSocket request")?;

        let headers = request.headers_mut();
        headers.insert(
            "Origin",
            origin
                .parse()
                .context("Failed to parse Origin header value")?,
        );
        headers.insert(
            "User-Agent",
            self.user_agent
                .parse()
                .context("Failed to parse User-Agent header value")?,
        );

        debug!("connecting to WebSocket: url={}, origin={}", url, origin);

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("Failed to connect to WebSocket at {}", url))?;

        let (write, read) = ws_stream.split();

        let sink = write.with(|frame: String| future::ready(Ok::<_, anyhow::Error>(Message::Text(frame))));

        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    // ping/pong are answered by tungstenite, binary frames are not part of the protocol
                    Ok(_) => None,
                    Err(e) => Some(Err(anyhow::Error::from(e).context("WebSocket message error"))),
                })
            });

        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Agent side of an in-process transport opened by [`ChannelConnector`]
pub struct AgentEnd {
    pub target: HostTarget,

    /// Frames written by the connection
    received: frames::UnboundedReceiver<String>,

    /// Frames delivered to the connection
    replies: frames::UnboundedSender<Result<String>>,
}

impl AgentEnd {
    /// Deliver a text frame to the connection
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.replies.unbounded_send(Ok(frame.into())).is_ok()
    }

    /// Deliver a transport error to the connection
    pub fn fail(&self, reason: &str) -> bool {
        self.replies
            .unbounded_send(Err(anyhow::anyhow!(reason.to_string())))
            .is_ok()
    }

    /// Next frame written by the connection; `None` once it dropped the transport
    pub async fn recv(&mut self) -> Option<String> {
        self.received.next().await
    }

    /// Close the transport from the agent side
    pub fn close(self) {
        self.replies.close_channel();
    }
}

/// Connects over in-process channels, handing the agent side of every
/// transport to the receiver returned by [`ChannelConnector::new`]
pub struct ChannelConnector {
    accepted: mpsc::UnboundedSender<AgentEnd>,
    refusing: AtomicBool,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted,
            refusing: AtomicBool::new(false),
        };
        (connector, rx)
    }

    /// Refuse (or accept again) every following connection attempt
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Transport> {
        if self.refusing.load(Ordering::SeqCst) {
            anyhow::bail!("connection to {} refused", target.url());
        }

        let (sink_tx, sink_rx) = frames::unbounded::<String>();
        let (reply_tx, reply_rx) = frames::unbounded::<Result<String>>();

        self.accepted
            .send(AgentEnd {
                target: target.clone(),
                received: sink_rx,
                replies: reply_tx,
            })
            .map_err(|_| anyhow::anyhow!("no agent is accepting connections"))?;

        let sink = sink_tx.sink_map_err(anyhow::Error::from);
        Ok(Transport::new(Box::pin(sink), Box::pin(reply_rx)))
    }
}
