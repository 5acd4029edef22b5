//! Inbound demultiplexer.
//!
//! One task owns the transport's receive side and fans every datagram out to
//! exactly one of three pipes, classified by message shape alone: STUN
//! messages (transaction responses and indications), TURN channel-data
//! frames, and opaque application data. The classifier never parses beyond
//! the first bytes, and a slow or closed consumer never stalls the others.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::chandata;
use crate::transport::{self, Conn};

/// Single-datagram read buffer, one MTU.
const READ_CAPACITY: usize = 1500;

/// Queue depth of each consumer pipe.
const PIPE_CAPACITY: usize = 32;

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

/// Receive ends of the three demultiplexed streams.
pub(crate) struct Pipes {
    pub(crate) stun: mpsc::Receiver<Vec<u8>>,
    pub(crate) chandata: mpsc::Receiver<Vec<u8>>,
    pub(crate) app: mpsc::Receiver<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Stun,
    ChannelData,
    App,
}

/// Whether `datagram` is a STUN message: the two most significant bits of
/// the type are zero and the magic cookie sits at offset 4.
fn is_stun_message(datagram: &[u8]) -> bool {
    datagram.len() >= 20 && datagram[0] & 0xC0 == 0 && datagram[4..8] == MAGIC_COOKIE
}

fn classify(datagram: &[u8]) -> Kind {
    if is_stun_message(datagram) {
        Kind::Stun
    } else if chandata::is_channel_data(datagram) {
        Kind::ChannelData
    } else {
        Kind::App
    }
}

/// Spawns the reader task and returns the consumer ends of its pipes.
///
/// The task runs until the transport fails a read or `token` is cancelled;
/// either way all three pipes are closed on exit.
pub(crate) fn spawn(conn: Arc<dyn Conn>, token: CancellationToken) -> Pipes {
    let (stun_tx, stun_rx) = mpsc::channel(PIPE_CAPACITY);
    let (chan_tx, chan_rx) = mpsc::channel(PIPE_CAPACITY);
    let (app_tx, app_rx) = mpsc::channel(PIPE_CAPACITY);

    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CAPACITY];
        loop {
            let n = tokio::select! {
                _ = token.cancelled() => break,
                result = transport::recv(conn.as_ref(), &mut buf) => match result {
                    Ok(n) => n,
                    Err(err) => {
                        info!(%err, "connection closed");
                        break;
                    }
                },
            };
            let datagram = &buf[..n];
            let kind = classify(datagram);
            trace!(len = n, ?kind, "demultiplexed datagram");
            let pipe = match kind {
                Kind::Stun => &stun_tx,
                Kind::ChannelData => &chan_tx,
                Kind::App => &app_tx,
            };
            // Non-blocking fan-out: drop on a full or closed pipe rather
            // than stalling the reader.
            if let Err(err) = pipe.try_send(datagram.to_vec()) {
                warn!(?kind, %err, "failed to forward datagram");
            }
        }
    });

    Pipes {
        stun: stun_rx,
        chandata: chan_rx,
        app: app_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;

    fn stun_header(first: u8) -> Vec<u8> {
        let mut datagram = vec![0u8; 20];
        datagram[0] = first;
        datagram[1] = 0x01;
        datagram[4..8].copy_from_slice(&MAGIC_COOKIE);
        datagram
    }

    #[test]
    fn classifies_by_shape() {
        assert_eq!(classify(&stun_header(0x00)), Kind::Stun);
        assert_eq!(classify(&stun_header(0x01)), Kind::Stun);
        // Channel-data leading bits win once the type bits are not 00.
        assert_eq!(classify(&stun_header(0x40)), Kind::ChannelData);
        assert_eq!(classify(&[0x40, 0x00, 0x00, 0x00]), Kind::ChannelData);
        // No magic cookie: not STUN, first bits 00: not channel data.
        assert_eq!(classify(&[1, 2, 3, 4]), Kind::App);
        assert_eq!(classify(&[0x80, 0x00, 0x00, 0x00]), Kind::App);
        assert_eq!(classify(&[]), Kind::App);
    }

    #[test]
    fn short_stun_lookalike_is_app_data() {
        let mut datagram = stun_header(0x00);
        datagram.truncate(12);
        assert_eq!(classify(&datagram), Kind::App);
    }

    #[tokio::test]
    async fn routes_each_stream_independently() {
        let (local, remote) = pipe();
        let mut pipes = spawn(Arc::new(local), CancellationToken::new());

        remote.send(&stun_header(0x00)).await.unwrap();
        remote.send(&[0x40, 0x01, 0x00, 0x01, 0xff]).await.unwrap();
        remote.send(&[1, 2, 3, 4]).await.unwrap();

        assert_eq!(pipes.stun.recv().await.unwrap(), stun_header(0x00));
        assert_eq!(
            pipes.chandata.recv().await.unwrap(),
            vec![0x40, 0x01, 0x00, 0x01, 0xff]
        );
        assert_eq!(pipes.app.recv().await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn read_error_closes_all_pipes() {
        let (local, remote) = pipe();
        let mut pipes = spawn(Arc::new(local), CancellationToken::new());
        drop(remote);
        assert!(pipes.stun.recv().await.is_none());
        assert!(pipes.chandata.recv().await.is_none());
        assert!(pipes.app.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_consumer_does_not_stall_the_rest() {
        let (local, remote) = pipe();
        let mut pipes = spawn(Arc::new(local), CancellationToken::new());
        drop(pipes.app);

        remote.send(&[1, 2, 3, 4]).await.unwrap(); // application data, dropped
        remote.send(&stun_header(0x00)).await.unwrap();
        assert_eq!(pipes.stun.recv().await.unwrap(), stun_header(0x00));
    }
}
