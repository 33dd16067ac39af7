//! Moving a live session onto a faster transport.
//!
//! The client opens the candidate next to the active transport, sends
//! `ping probe` over it, and, once answered, confirms with `upgrade`. Until
//! that confirmation the active transport keeps serving the session, and the
//! server keeps its parked poll cycling with `noop`s so nothing is left
//! stranded on it at the swap.

use eio_core::constants::PROBE;
use eio_core::{Packet, PacketType};
use tracing::{debug, error, info};

use super::{ReadyState, Session, SessionEvent, SocketEvent, TimerKind};
use crate::transport::{Transport, TransportEvent, TransportState};

impl Session {
    /// Start probing `candidate`, unless this session already upgraded or
    /// is mid-upgrade.
    pub(super) fn maybe_upgrade(&mut self, mut candidate: Transport) {
        if self.candidate.is_some() || self.upgraded {
            debug!(sid = %self.id, "upgrade already attempted, closing candidate");
            candidate.close();
            return;
        }

        debug!(
            sid = %self.id,
            from = %self.transport.kind(),
            to = %candidate.kind(),
            "might upgrade transport"
        );
        self.candidate = Some(candidate);
        self.upgrade_timeout
            .arm(self.engine.upgrade_timeout(), &self.inbox, |generation| {
                SessionEvent::Timer {
                    kind: TimerKind::UpgradeTimeout,
                    generation,
                }
            });
        self.publish();
    }

    pub(super) fn on_candidate_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Packet(packet) if packet.is_ping_with(PROBE) => self.on_probe(),
            TransportEvent::Packet(packet)
                if packet.kind() == PacketType::Upgrade && self.state != ReadyState::Closed =>
            {
                self.complete_upgrade();
            }
            TransportEvent::Packet(packet) => {
                debug!(sid = %self.id, kind = %packet.kind(), "unexpected packet during upgrade");
                self.abort_upgrade();
            }
            TransportEvent::Error(e) => {
                error!(sid = %self.id, error = %e, "client did not complete upgrade");
                self.abort_upgrade();
            }
            TransportEvent::Close { .. } => {
                debug!(sid = %self.id, "upgrade candidate closed");
                self.abort_upgrade();
            }
            TransportEvent::Drain | TransportEvent::CloseComplete => {}
        }
    }

    fn on_probe(&mut self) {
        let Some(candidate) = self.candidate.as_mut() else {
            return;
        };
        candidate.send(vec![Packet::new(PacketType::Pong, PROBE)]);
        self.nudge
            .arm_interval(self.engine.upgrade_probe_interval(), &self.inbox, |generation| {
                SessionEvent::Timer {
                    kind: TimerKind::UpgradeNudge,
                    generation,
                }
            });
    }

    /// Cycle a parked poll on the old transport.
    pub(super) fn on_nudge(&mut self) {
        if matches!(self.transport, Transport::Polling(_)) && self.transport.writable() {
            debug!(sid = %self.id, "writing a noop packet to polling for fast upgrade");
            self.transport.send(vec![Packet::empty(PacketType::Noop)]);
        }
    }

    fn complete_upgrade(&mut self) {
        let Some(candidate) = self.candidate.take() else {
            return;
        };
        self.cleanup_upgrade();

        let mut previous = std::mem::replace(&mut self.transport, candidate);
        previous.discard();
        previous.close();

        self.upgraded = true;
        self.publish();

        let kind = self.transport.kind();
        info!(sid = %self.id, transport = %kind, "session upgraded");
        self.emit(SocketEvent::Upgrade(kind));
        self.arm_heartbeat();
        self.flush();

        if self.state == ReadyState::Closing {
            self.transport.close();
        }
    }

    fn abort_upgrade(&mut self) {
        self.cleanup_upgrade();
        if let Some(mut candidate) = self.candidate.take() {
            candidate.close();
        }
        self.publish();
    }

    pub(super) fn on_upgrade_timeout(&mut self) {
        debug!(sid = %self.id, "client did not complete upgrade, closing transport");
        self.cleanup_upgrade();
        if let Some(mut candidate) = self.candidate.take() {
            if candidate.state() == TransportState::Open {
                candidate.close();
            }
        }
        self.publish();
    }

    /// Stop upgrade timers.
    pub(super) fn cleanup_upgrade(&mut self) {
        self.upgrade_timeout.cancel();
        self.nudge.cancel();
    }
}
