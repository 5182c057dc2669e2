//! Transport boundary.
//!
//! The endpoint consumes a stream of decoded JSON values and writes structured
//! [`Message`]s into a bounded channel. Framing and byte encoding live outside
//! this crate; [`ChannelTransport`] wires endpoints together in-process.

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{EndpointError, TransportError};
use crate::message::Message;

/// Inbound side: decoded values (or decode failures) in arrival order.
/// The end of the stream means the transport closed.
pub type InboundStream = BoxStream<'static, Result<Value, TransportError>>;

/// The two halves an endpoint is built from
pub struct EndpointIo {
    pub inbound: InboundStream,
    pub outbound: mpsc::Sender<Message>,
}

/// The remote side of an in-process channel transport
pub struct PeerIo {
    /// Feed values to the endpoint; dropping it closes the endpoint's inbound side
    pub to_endpoint: mpsc::Sender<Result<Value, TransportError>>,
    /// Messages written by the endpoint; yields `None` once the endpoint closed its outbound side
    pub from_endpoint: mpsc::Receiver<Message>,
}

impl PeerIo {
    pub async fn send(&self, value: Value) -> Result<(), TransportError> {
        self.to_endpoint
            .send(Ok(value))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.from_endpoint.recv().await
    }
}

/// Bounded in-process transport built on tokio channels
pub struct ChannelTransport;

impl ChannelTransport {
    /// An endpoint transport plus the handle a test or embedding peer drives it with
    pub fn pair(capacity: usize) -> (EndpointIo, PeerIo) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            EndpointIo {
                inbound: ReceiverStream::new(in_rx).boxed(),
                outbound: out_tx,
            },
            PeerIo {
                to_endpoint: in_tx,
                from_endpoint: out_rx,
            },
        )
    }

    /// Two endpoint transports wired to each other: whatever one side writes,
    /// the other side reads.
    pub fn connected(capacity: usize) -> (EndpointIo, EndpointIo) {
        let (a_tx, a_rx) = mpsc::channel::<Message>(capacity);
        let (b_tx, b_rx) = mpsc::channel::<Message>(capacity);
        (
            EndpointIo {
                inbound: encode_stream(b_rx),
                outbound: a_tx,
            },
            EndpointIo {
                inbound: encode_stream(a_rx),
                outbound: b_tx,
            },
        )
    }
}

fn encode_stream(rx: mpsc::Receiver<Message>) -> InboundStream {
    ReceiverStream::new(rx)
        .map(|message| serde_json::to_value(message).map_err(TransportError::from))
        .boxed()
}

/// Outbound sink shared by the pipeline and direct sends.
///
/// Each message is enqueued whole, so writes never interleave. Sends wait for
/// channel capacity. Once closed, the endpoint's sender is dropped and the
/// consumer observes the end of the channel after draining it.
#[derive(Debug)]
pub(crate) struct Outbound {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
}

impl Outbound {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) async fn send(&self, message: Message) -> Result<(), EndpointError> {
        let tx = self.tx.lock().clone().ok_or(EndpointError::TransportClosed)?;
        tx.send(message)
            .await
            .map_err(|_| EndpointError::TransportClosed)
    }

    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::JsonRpcNotification;
    use serde_json::json;

    #[tokio::test]
    async fn test_connected_transports_encode_messages() {
        let (a, mut b) = ChannelTransport::connected(4);
        a.outbound
            .send(JsonRpcNotification::new_no_params("initialized").into())
            .await
            .unwrap();

        let value = b.inbound.next().await.unwrap().unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "initialized"}));
    }

    #[tokio::test]
    async fn test_outbound_close_ends_consumer() {
        let (io, mut peer) = ChannelTransport::pair(4);
        let outbound = Outbound::new(io.outbound);

        outbound
            .send(JsonRpcNotification::new_no_params("a").into())
            .await
            .unwrap();
        outbound.close();

        assert!(outbound.is_closed());
        assert!(matches!(
            outbound
                .send(JsonRpcNotification::new_no_params("b").into())
                .await,
            Err(EndpointError::TransportClosed)
        ));
        assert!(peer.recv().await.is_some());
        assert!(peer.recv().await.is_none());
    }
}
