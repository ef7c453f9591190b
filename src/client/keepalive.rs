//! Keepalive monitor
//!
//! Sends PINGREQ once the connection has been idle for the keepalive interval
//! and declares the connection lost when that ping goes unanswered for a
//! further interval.

use super::coordinator::{wait_stopped, ClientInner, SessionShared};
use crate::error::ClientError;
use crate::packet::Packet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Upper bound on the time between liveness checks
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    Idle,
    SendPing,
    /// The outstanding ping was never answered
    Timeout,
}

/// Decide what to do on one check
///
/// `ping_age` is the time since the outstanding PINGREQ was written, `None`
/// when no ping is outstanding.
pub fn next_action(
    since_contact: Duration,
    ping_age: Option<Duration>,
    keep_alive: Duration,
) -> KeepaliveAction {
    match ping_age {
        Some(age) if age >= keep_alive => KeepaliveAction::Timeout,
        Some(_) => KeepaliveAction::Idle,
        None if since_contact >= keep_alive => KeepaliveAction::SendPing,
        None => KeepaliveAction::Idle,
    }
}

fn check_interval(keep_alive: Duration) -> Duration {
    CHECK_INTERVAL.min(keep_alive / 4).max(Duration::from_millis(10))
}

pub(crate) async fn run(inner: Arc<ClientInner>, shared: Arc<SessionShared>, keep_alive: Duration) {
    let mut stop = shared.stop_signal();
    let mut ticker = tokio::time::interval(check_interval(keep_alive));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_sent: Option<Instant> = None;
    debug!(keep_alive_secs = keep_alive.as_secs(), "Keepalive monitor started");

    loop {
        tokio::select! {
            biased;
            _ = wait_stopped(&mut stop) => break,
            _ = ticker.tick() => {}
        }

        if !shared.ping_outstanding.load(Ordering::SeqCst) {
            ping_sent = None;
        }
        let action = next_action(
            inner.status.since_last_contact(),
            ping_sent.map(|sent| sent.elapsed()),
            keep_alive,
        );
        match action {
            KeepaliveAction::Idle => {}
            KeepaliveAction::SendPing => {
                // Written directly so it cannot queue behind large publishes
                let result = shared.writer.lock().await.write_packet(&Packet::PingReq).await;
                if let Err(e) = result {
                    inner.connection_lost(&shared, ClientError::connection_lost(format!(
                        "PINGREQ write failed: {e}"
                    )));
                    break;
                }
                shared.ping_outstanding.store(true, Ordering::SeqCst);
                ping_sent = Some(Instant::now());
                debug!("PINGREQ sent");
            }
            KeepaliveAction::Timeout => {
                warn!("PINGRESP not received, disconnecting");
                inner.connection_lost(&shared, ClientError::PingTimeout);
                break;
            }
        }
    }
    debug!("Keepalive monitor stopped");
}
