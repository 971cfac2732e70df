//! Accept loop and per-connection readers.

use crate::transport::{wait_for_shutdown, GossipEvent, Shared};
use forksim_messages::{read_frame, WireMessage};
use forksim_types::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Frames that fail to decode before the connection is dropped.
const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 3;

pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(read_loop(Arc::clone(&shared), stream));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Read frames from one accepted socket until it dies.
///
/// The peer is anonymous until its first `Hello`; frames arriving before
/// identification are dropped. Once identified, every frame passes the
/// inbound side of the link policy, so a partition filters traffic even
/// from peers that have not applied their own filter yet.
async fn read_loop(shared: Arc<Shared>, mut stream: TcpStream) {
    let mut peer: Option<NodeId> = None;
    let mut decode_failures = 0u32;
    let mut shutdown = shared.shutdown.clone();

    loop {
        let frame = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            frame = read_frame(&mut stream) => frame,
        };
        match frame {
            Ok(message) => {
                decode_failures = 0;
                if peer.is_none() {
                    let WireMessage::Hello { node_id, .. } = &message else {
                        debug!(kind = message.kind(), "frame before hello, dropping");
                        continue;
                    };
                    peer = Some(*node_id);
                    info!(peer = *node_id, "inbound link identified");
                    let _ = shared.events.send(GossipEvent::PeerConnected {
                        peer: *node_id,
                        inbound: true,
                    });
                }
                let from = peer.expect("identified above");
                if !shared.policy.inbound_allowed(from) {
                    debug!(from, kind = message.kind(), "inbound message filtered");
                    continue;
                }
                match message {
                    WireMessage::Ping { timestamp_ms } => {
                        shared.send_to(from, WireMessage::Pong { timestamp_ms });
                    }
                    WireMessage::Pong { .. } => shared.note_pong(from),
                    other => {
                        if shared
                            .events
                            .send(GossipEvent::Message {
                                from,
                                message: other,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            Err(err) if err.is_recoverable() => {
                decode_failures += 1;
                warn!(?peer, %err, decode_failures, "malformed frame");
                if decode_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                    info!(?peer, "closing link after repeated malformed frames");
                    break;
                }
            }
            Err(err) => {
                debug!(?peer, %err, "inbound link closed");
                break;
            }
        }
    }

    if let Some(peer) = peer {
        let _ = shared.events.send(GossipEvent::PeerDisconnected {
            peer,
            inbound: true,
        });
    }
}
