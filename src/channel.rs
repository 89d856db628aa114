// src/channel.rs
use crate::protocol::{decode, encode_frame, Envelope, FrameDecoder, ProtocolError, ServerEvent};
use log::{debug, info, trace, warn};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot reach controller: {0}")]
    Connection(#[source] io::Error),
    #[error("channel is closed")]
    Closed,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot serialise envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What the receive thread hands to the engine, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    Event(ServerEvent),
    /// A frame or body that could not be decoded.
    Malformed(ProtocolError),
    /// The socket failed or the controller hung up.
    Disconnected(String),
}

/// Sending half of the controller connection, shared by the engine and the GUI.
pub trait Outbound: Send + Sync {
    fn is_connected(&self) -> bool;
    /// No-op when not connected.
    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError>;
    /// Idempotent.
    fn close(&self);
}

/// One TCP connection to the controller carrying length-prefixed json frames.
pub struct FramedChannel {
    peer: String,
    // 写端加锁，保证整帧写出
    writer: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl FramedChannel {
    pub fn connect(host: &str, port: u16) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect((host, port)).map_err(ChannelError::Connection)?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, ChannelError> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        info!("connected to controller at {}", peer);
        Ok(Self {
            peer,
            writer: Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Starts the blocking read loop on its own thread. Decoded events are
    /// forwarded to `tx` in the order they arrive.
    pub fn spawn_receiver(self: &Arc<Self>, tx: Sender<Inbound>) -> Result<JoinHandle<()>, ChannelError> {
        let reader = {
            let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(stream) => stream.try_clone()?,
                None => return Err(ChannelError::Closed),
            }
        };
        let channel = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tcp_reader".into())
            .spawn(move || channel.receive_loop(reader, tx))?;
        Ok(handle)
    }

    fn receive_loop(&self, mut reader: TcpStream, tx: Sender<Inbound>) {
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; READ_CHUNK];
        let reason = loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break "controller closed the connection".to_owned(),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break format!("read error: {e}"),
            };
            let mut messages = Vec::new();
            let framing = decoder.push(&chunk[..n], &mut messages);
            for message in messages {
                debug!("<- {}", message);
                let inbound = match decode(&message) {
                    Ok(event) => Inbound::Event(event),
                    Err(e) => Inbound::Malformed(e),
                };
                if tx.send(inbound).is_err() {
                    debug!("engine gone, receive loop exits");
                    return;
                }
            }
            if let Err(e) = framing {
                // 分帧状态已损坏，不再继续读
                warn!("dropping stream after framing error: {}", e);
                tx.send(Inbound::Malformed(e)).ok();
                return;
            }
        };
        if self.is_connected() {
            info!("receive loop ended: {}", reason);
            self.close();
            tx.send(Inbound::Disconnected(reason)).ok();
        } else {
            debug!("receive loop ended after local close");
        }
    }
}

impl Outbound for FramedChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stream) = guard.as_mut() else {
            return Ok(());
        };
        let body = envelope.to_json()?;
        let frame = encode_frame(&body)?;
        stream.write_all(&frame)?;
        trace!("-> {}", body);
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let stream = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stream) = stream {
            stream.shutdown(Shutdown::Both).ok();
            info!("channel to {} closed", self.peer);
        }
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory `Outbound` that records every envelope.
#[cfg(test)]
pub(crate) struct Outbox {
    sent: Mutex<Vec<Envelope>>,
    connected: AtomicBool,
}

#[cfg(test)]
impl Outbox {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.sent().iter().map(|e| e.event_type().to_owned()).collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.sent().iter().filter(|e| e.event_type() == event_type).count()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[cfg(test)]
impl Outbound for Outbox {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if self.is_connected() {
            self.sent.lock().unwrap().push(envelope.clone());
        }
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn pair() -> (Arc<FramedChannel>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = FramedChannel::connect("127.0.0.1", port).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Arc::new(client), server)
    }

    fn recv(rx: &std::sync::mpsc::Receiver<Inbound>) -> Inbound {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn unreachable_controller_is_a_connection_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(matches!(
            FramedChannel::connect("127.0.0.1", port),
            Err(ChannelError::Connection(_))
        ));
    }

    #[test]
    fn receives_split_frames_in_order() {
        let (client, mut server) = pair();
        let (tx, rx) = channel();
        client.spawn_receiver(tx).unwrap();

        let mut stream = encode_frame(r#"{"event_type":"play"}"#).unwrap();
        stream.extend(encode_frame(r#"{"event_type":"selection","selection_coords":[0,1,2]}"#).unwrap());
        let (a, b) = stream.split_at(7);
        server.write_all(a).unwrap();
        server.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        server.write_all(b).unwrap();

        assert!(matches!(recv(&rx), Inbound::Event(ServerEvent::Play)));
        assert!(matches!(recv(&rx), Inbound::Event(ServerEvent::Selection([0, 1, 2]))));
    }

    #[test]
    fn bad_bodies_are_reported_not_fatal_to_the_loop() {
        let (client, mut server) = pair();
        let (tx, rx) = channel();
        client.spawn_receiver(tx).unwrap();
        server.write_all(&encode_frame("{oops").unwrap()).unwrap();
        server.write_all(&encode_frame(r#"{"event_type":"stop"}"#).unwrap()).unwrap();
        assert!(matches!(recv(&rx), Inbound::Malformed(_)));
        assert!(matches!(recv(&rx), Inbound::Event(ServerEvent::Stop)));
    }

    #[test]
    fn frames_ahead_of_a_corrupt_header_are_delivered_first() {
        let (client, mut server) = pair();
        let (tx, rx) = channel();
        client.spawn_receiver(tx).unwrap();
        let mut stream = encode_frame(r#"{"event_type":"exception","exception":"amp lost"}"#).unwrap();
        stream.extend_from_slice(&[0, 4]);
        stream.extend_from_slice(b"{bad");
        server.write_all(&stream).unwrap();
        assert!(matches!(recv(&rx), Inbound::Event(ServerEvent::Exception(_))));
        assert!(matches!(recv(&rx), Inbound::Malformed(ProtocolError::MalformedHeader(_))));
    }

    #[test]
    fn sent_envelopes_arrive_whole() {
        let (client, mut server) = pair();
        client.send(&Envelope::waiting()).unwrap();
        client.send(&Envelope::test_onset(0, 12.5, 3, 0)).unwrap();

        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut messages = Vec::new();
        let mut buf = [0u8; 256];
        while messages.len() < 2 {
            let n = server.read(&mut buf).unwrap();
            assert!(n > 0);
            decoder.push(&buf[..n], &mut messages).unwrap();
        }
        assert_eq!(messages[0], r#"{"event_type":"waiting"}"#);
        let test: serde_json::Value = serde_json::from_str(&messages[1]).unwrap();
        assert_eq!(test["trial"], 3);
        assert_eq!(test["mode"], "Online");
    }

    #[test]
    fn peer_hangup_is_reported_once() {
        let (client, server) = pair();
        let (tx, rx) = channel();
        let handle = client.spawn_receiver(tx).unwrap();
        drop(server);
        assert!(matches!(recv(&rx), Inbound::Disconnected(_)));
        handle.join().unwrap();
        assert!(!client.is_connected());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_is_idempotent_and_silences_send() {
        let (client, _server) = pair();
        let (tx, rx) = channel();
        let handle = client.spawn_receiver(tx).unwrap();
        client.close();
        client.close();
        assert!(!client.is_connected());
        assert!(client.send(&Envelope::close()).is_ok());
        handle.join().unwrap();
        // Local close ends the loop without a disconnect notice.
        assert!(rx.try_recv().is_err());
        assert!(matches!(client.spawn_receiver(channel().0), Err(ChannelError::Closed)));
    }
}
