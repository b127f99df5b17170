// In-process client transport.
//
// A local client lives in the server process and skips TCP entirely:
// outbound server messages cross an `mpsc` channel instead of a socket,
// and client messages are injected straight into the server's internal
// event queue, tagged with the `ClientId` the session assigned. From the
// session's perspective a local client is indistinguishable from a
// remote one: same turn numbers, same command ordering, same lifecycle.

use std::io;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use cadence_protocol::message::{ClientMessage, ServerMessage};
use cadence_protocol::types::ClientId;

use crate::client::ClientTransport;
use crate::error::SyncError;
use crate::server::InternalEvent;
use crate::session::MessageSink;

/// Server-side sink for an in-process client. Reports 0 bytes written
/// since nothing touches a wire.
pub(crate) struct ChannelSink {
    tx: Sender<ServerMessage>,
}

impl ChannelSink {
    pub(crate) fn new(tx: Sender<ServerMessage>) -> Self {
        Self { tx }
    }
}

impl MessageSink for ChannelSink {
    fn send(&mut self, message: &ServerMessage) -> io::Result<usize> {
        self.tx
            .send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "local client gone"))?;
        Ok(0)
    }
}

/// Client-side transport for an in-process client. Obtained from
/// `ServerHandle::register_local_client`.
pub struct LocalTransport {
    client: ClientId,
    events: Sender<InternalEvent>,
    inbox: Receiver<ServerMessage>,
}

impl LocalTransport {
    pub(crate) fn new(
        client: ClientId,
        events: Sender<InternalEvent>,
        inbox: Receiver<ServerMessage>,
    ) -> Self {
        Self {
            client,
            events,
            inbox,
        }
    }
}

impl ClientTransport for LocalTransport {
    fn send(&mut self, message: &ClientMessage) -> Result<(), SyncError> {
        // Goodbye becomes a disconnect event, mirroring what the TCP
        // reader loop does for remote clients.
        let event = match message {
            ClientMessage::Goodbye => InternalEvent::Disconnected {
                client: self.client,
            },
            other => InternalEvent::MessageFrom {
                client: self.client,
                message: other.clone(),
            },
        };
        self.events
            .send(event)
            .map_err(|_| SyncError::TransportClosed)
    }

    fn poll(&mut self) -> Result<Vec<ServerMessage>, SyncError> {
        let mut messages = Vec::new();
        loop {
            match self.inbox.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Deliver what was buffered; the closure surfaces on
                    // the next poll.
                    if messages.is_empty() {
                        return Err(SyncError::TransportClosed);
                    }
                    break;
                }
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn messages_forward_with_client_id() {
        let (events_tx, events_rx) = mpsc::channel();
        let (_outbox_tx, outbox_rx) = mpsc::channel();
        let mut transport = LocalTransport::new(ClientId(3), events_tx, outbox_rx);

        transport
            .send(&ClientMessage::Ping { sent_ms: 42 })
            .unwrap();
        match events_rx.try_recv().unwrap() {
            InternalEvent::MessageFrom { client, message } => {
                assert_eq!(client, ClientId(3));
                assert_eq!(message, ClientMessage::Ping { sent_ms: 42 });
            }
            _ => panic!("expected MessageFrom"),
        }
    }

    #[test]
    fn goodbye_translates_to_disconnect() {
        let (events_tx, events_rx) = mpsc::channel();
        let (_outbox_tx, outbox_rx) = mpsc::channel();
        let mut transport = LocalTransport::new(ClientId(3), events_tx, outbox_rx);

        transport.send(&ClientMessage::Goodbye).unwrap();
        match events_rx.try_recv().unwrap() {
            InternalEvent::Disconnected { client } => assert_eq!(client, ClientId(3)),
            _ => panic!("expected Disconnected"),
        }
    }

    #[test]
    fn poll_drains_inbox_then_reports_closed() {
        let (events_tx, _events_rx) = mpsc::channel();
        let (outbox_tx, outbox_rx) = mpsc::channel();
        let mut transport = LocalTransport::new(ClientId(0), events_tx, outbox_rx);

        outbox_tx.send(ServerMessage::Pong { sent_ms: 1 }).unwrap();
        drop(outbox_tx);

        let drained = transport.poll().unwrap();
        assert_eq!(drained, vec![ServerMessage::Pong { sent_ms: 1 }]);
        assert!(matches!(transport.poll(), Err(SyncError::TransportClosed)));
    }

    #[test]
    fn channel_sink_reports_zero_bytes() {
        let (tx, rx) = mpsc::channel();
        let mut sink = ChannelSink::new(tx);

        let written = sink.send(&ServerMessage::Pong { sent_ms: 9 }).unwrap();
        assert_eq!(written, 0);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong { sent_ms: 9 });

        drop(rx);
        assert!(sink.send(&ServerMessage::Pong { sent_ms: 9 }).is_err());
    }
}
