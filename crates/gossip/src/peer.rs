//! Per-peer outbound worker: dial, drain, probe, redial.

use crate::transport::{wait_for_shutdown, GossipEvent, Queued, Shared};
use forksim_messages::{write_frame, WireMessage};
use forksim_types::{unix_millis, NodeId};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use std::time::Duration;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// A write stuck longer than this drops the message and the connection;
/// the redial path takes over.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the dialed connection to one peer for the lifetime of the node.
///
/// Dials with exponential backoff, announces `Hello` on every (re)connect,
/// drains the delayed outbound queue in FIFO order, and probes the link
/// with `Ping`. Any write failure or missed `Pong` tears the link down and
/// restarts the dial loop; queued messages are not durable across the gap.
pub(crate) async fn outbound_loop(
    shared: Arc<Shared>,
    peer: NodeId,
    mut queue: mpsc::UnboundedReceiver<Queued>,
) {
    let addr = format!("127.0.0.1:{}", shared.config.port_of(peer));
    let mut shutdown = shared.shutdown.clone();
    let mut backoff = shared.config.dial_backoff_min;

    loop {
        let stream = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            connected = TcpStream::connect(&addr) => connected,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                debug!(peer, %err, next_retry_ms = backoff.as_millis() as u64, "dial failed");
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => return,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(shared.config.dial_backoff_max);
                continue;
            }
        };
        backoff = shared.config.dial_backoff_min;
        info!(peer, "outbound link up");
        let _ = shared.events.send(GossipEvent::PeerConnected {
            peer,
            inbound: false,
        });
        shared.note_pong(peer);
        let link_up_at = Instant::now();

        if !shared.policy.blocked(peer) {
            if let Err(err) = write_frame(&mut stream, &shared.hello_message()).await {
                info!(peer, %err, "hello failed");
                link_down(&shared, peer);
                continue;
            }
        }

        let mut ping_tick = interval(shared.config.ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // FIFO floor: no message may leave before its predecessor.
        let mut floor = Instant::now();

        'link: loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return,
                queued = queue.recv() => {
                    let Some(queued) = queued else { return };
                    floor = floor.max(queued.send_at);
                    sleep_until(floor).await;
                    match timeout(WRITE_TIMEOUT, write_frame(&mut stream, &queued.message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            info!(peer, %err, "outbound link lost");
                            break 'link;
                        }
                        Err(_) => {
                            info!(peer, kind = queued.message.kind(), "write stalled, dropping link");
                            break 'link;
                        }
                    }
                }
                _ = ping_tick.tick() => {
                    // A partitioned link is left silent rather than torn
                    // down; traffic resumes the instant the filter lifts.
                    if shared.policy.blocked(peer) {
                        shared.note_pong(peer);
                        continue;
                    }
                    let last = shared.last_pong_at(peer).unwrap_or(link_up_at);
                    if Instant::now().duration_since(last) > shared.config.pong_timeout {
                        info!(peer, "no pong within timeout, closing link");
                        break 'link;
                    }
                    let ping = WireMessage::Ping { timestamp_ms: unix_millis() };
                    if write_frame(&mut stream, &ping).await.is_err() {
                        break 'link;
                    }
                }
            }
        }
        link_down(&shared, peer);
    }
}

fn link_down(shared: &Shared, peer: NodeId) {
    let _ = shared.events.send(GossipEvent::PeerDisconnected {
        peer,
        inbound: false,
    });
}
