//! # Summary
//!
//! This module abstracts over connections to clients and peer servers.
//!
//! Uses `tokio-util`'s length-delimited codec on top of `tokio`'s TCP stream.
//! Every frame carries exactly one encoded `Message`, so both ends only deal
//! in whole messages. Frames that fail to decode are logged and skipped
//! without tearing down the connection.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::message::Message;

type Frames = Framed<TcpStream, LengthDelimitedCodec>;

/// Receiving half of a connection.
pub struct Rx(SplitStream<Frames>);

/// Transmitting half of a connection.
pub struct Tx(SplitSink<Frames, Bytes>);

pub fn split(stream: TcpStream) -> (Rx, Tx) {
    let (tx, rx) = Framed::new(stream, LengthDelimitedCodec::new()).split();
    (Rx(rx), Tx(tx))
}

impl Rx {
    /// Waits for the next well-formed message. Returns `None` once the
    /// connection is closed or broken.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.0.next().await? {
            | Ok(frame) => match Message::decode(&frame) {
                | Ok(message) => return Some(message),
                | Err(error) => warn!("dropping frame of {} bytes: {}", frame.len(), error),
            },
            | Err(error) => {
                debug!("connection failed: {}", error);
                return None
            }
            }
        }
    }
}

impl Tx {
    pub async fn send(&mut self, message: &Message) -> std::io::Result<()> {
        let bytes = message
            .encode()
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
        self.0.send(Bytes::from(bytes)).await
    }
}
