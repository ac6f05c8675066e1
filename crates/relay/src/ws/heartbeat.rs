// Connection liveness sweeps.
//
// The monitor never touches room state. An expired connection gets the same
// LEAVE command any other disconnect produces, then its socket is closed.
// Closed connections whose socket task has not finished yet get their LEAVE
// repeated; rooms ignore departures they have already applied.

use std::{sync::Arc, time::Duration};

use picsync_common::types::LeaveReason;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, warn};

use super::{
    broadcast::{self, OutboundFrame},
    connection::{CloseReason, Connection, Liveness},
    registry::SessionRegistry,
    room::RoomCommand,
};
use crate::config::CollabConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub expired: usize,
    /// Already closed connections whose LEAVE was routed again.
    pub lingering: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<SessionRegistry>, config: &CollabConfig) -> Self {
        Self { registry, interval: config.heartbeat_interval, timeout: config.heartbeat_timeout }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.reset(); // skip immediate first tick

            loop {
                ticker.tick().await;
                self.sweep(Instant::now());
            }
        })
    }

    /// Probes idle connections and expires those that never answered.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for connection in self.registry.snapshot_connections() {
            if let Some(reason) = connection.close_reason() {
                debug!(
                    connection_id = %connection.id(),
                    reason = reason.description(),
                    "closed connection still registered"
                );
                self.leave(&connection, reason.leave_reason());
                report.lingering += 1;
                continue;
            }

            match connection.liveness(now, self.timeout) {
                Liveness::Alive => {}
                Liveness::ProbeDue => {
                    connection.mark_probe_sent(now);
                    if broadcast::enqueue(&connection, OutboundFrame::Ping) {
                        self.leave(&connection, LeaveReason::SlowConsumer);
                    }
                    report.probed += 1;
                }
                Liveness::Expired => {
                    warn!(
                        connection_id = %connection.id(),
                        picture_id = connection.picture_id(),
                        user_id = connection.user_id(),
                        "heartbeat timeout, disconnecting"
                    );
                    self.leave(&connection, LeaveReason::HeartbeatTimeout);
                    connection.close(CloseReason::HeartbeatTimeout);
                    report.expired += 1;
                }
            }
        }

        report
    }

    fn leave(&self, connection: &Connection, reason: LeaveReason) {
        self.registry.send_to_room(
            connection.picture_id(),
            RoomCommand::Leave { connection_id: connection.id(), reason },
        );
    }
}
