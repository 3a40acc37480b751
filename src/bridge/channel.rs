//! A bidirectional channel of serialized frames.
//!
//! The bridge only ever exchanges JSON strings, so the same client and server
//! work over an in-process pair (tests, embedding both contexts in one
//! process) or over a process boundary (see [`super::stdio`]).

use super::protocol::Frame;
use crate::error::AssistantError;
use tokio::sync::mpsc;

/// Default capacity of each direction.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

pub struct Channel {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl Channel {
    pub fn split(self) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        (self.outgoing, self.incoming)
    }
}

/// Two connected channel ends.
pub fn channel_pair(capacity: usize) -> (Channel, Channel) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        Channel {
            outgoing: a_tx,
            incoming: b_rx,
        },
        Channel {
            outgoing: b_tx,
            incoming: a_rx,
        },
    )
}

pub(crate) async fn send_frame(outgoing: &mpsc::Sender<String>, frame: &Frame) -> Result<(), AssistantError> {
    let json = frame.to_json()?;
    outgoing
        .send(json)
        .await
        .map_err(|_| AssistantError::protocol("bridge channel closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_cross_connected() {
        let (a, b) = channel_pair(4);
        let (a_out, mut a_in) = a.split();
        let (b_out, mut b_in) = b.split();

        send_frame(&a_out, &Frame::Ready).await.unwrap();
        assert_eq!(Frame::parse(&b_in.recv().await.unwrap()).unwrap(), Frame::Ready);

        b_out.send("pong".to_string()).await.unwrap();
        assert_eq!(a_in.recv().await.unwrap(), "pong");
    }
}
