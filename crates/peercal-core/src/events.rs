//! Events emitted by rooms and the room manager

use crate::identity::WriterKey;
use crate::types::RoomId;

/// Events broadcast to application subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A room instance was opened (not yet online)
    Opened { room_id: RoomId },
    /// A room finished readying: host minted an invite, or candidate was
    /// admitted
    Ready { room_id: RoomId },
    /// A writer key joined the room's writer set
    WriterAdmitted { room_id: RoomId, writer: WriterKey },
    /// The derived schedule view changed
    ScheduleChanged { room_id: RoomId, ops_applied: usize },
    /// A peer connected on the room's topic
    PeerConnected { room_id: RoomId, peer_id: String },
    /// A peer disconnected from the room's topic
    PeerDisconnected { room_id: RoomId, peer_id: String },
    /// Replication hit an error worth surfacing
    Error { room_id: RoomId, message: String },
    /// The room was closed
    Closed { room_id: RoomId },
    /// The last open room closed
    Drained,
}

impl RoomEvent {
    /// The room this event concerns, if any
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            RoomEvent::Opened { room_id }
            | RoomEvent::Ready { room_id }
            | RoomEvent::WriterAdmitted { room_id, .. }
            | RoomEvent::ScheduleChanged { room_id, .. }
            | RoomEvent::PeerConnected { room_id, .. }
            | RoomEvent::PeerDisconnected { room_id, .. }
            | RoomEvent::Error { room_id, .. }
            | RoomEvent::Closed { room_id } => Some(room_id),
            RoomEvent::Drained => None,
        }
    }
}
