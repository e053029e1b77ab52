//! Pairing / room manager.
//!
//! A room is the exclusive grouping of the two endpoints of one allow-listed
//! pair. Its id is derived from the sorted member identities, so every
//! process agrees on it without coordination, and it can never hold more
//! than the pair's two members.
//!
//! Room state changes under one manager-wide lock. The cluster snapshot a
//! join needs is taken before that lock, and local members are re-checked
//! once it is held. Members owned by another process are joined and released
//! through the backplane ([`BackplaneMessage::RoomAssigned`] /
//! [`BackplaneMessage::RoomReleased`]); the owning process then runs the
//! same notify-then-clear sequence, and refuses an assignment for a member
//! that already sits in another room.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backplane::BackplaneMessage;
use crate::directory::ClusterDirectory;
use crate::error::HubError;
use crate::protocol::{Identity, RoomId, ServerEvent};
use crate::registry::ConnectionRegistry;

/// Static allow-list of pairable identities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingTable {
    pairs: Vec<(Identity, Identity)>,
}

impl PairingTable {
    pub fn new(pairs: impl IntoIterator<Item = (Identity, Identity)>) -> Self {
        Self {
            pairs: pairs.into_iter().collect(),
        }
    }

    /// First configured partner of `identity`.
    pub fn partner_of(&self, identity: &Identity) -> Option<&Identity> {
        self.pairs.iter().find_map(|(a, b)| {
            if a == identity {
                Some(b)
            } else if b == identity {
                Some(a)
            } else {
                None
            }
        })
    }

    pub fn allows(&self, a: &Identity, b: &Identity) -> bool {
        a != b
            && self
                .pairs
                .iter()
                .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    pub fn pairs(&self) -> &[(Identity, Identity)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    /// Sorted; always exactly the pair's two identities.
    pub members: Vec<Identity>,
}

impl Room {
    fn for_pair(a: &Identity, b: &Identity) -> Self {
        let mut members = vec![a.clone(), b.clone()];
        members.sort();
        Self {
            id: RoomId::for_pair(a, b),
            members,
        }
    }

    pub fn peer_of(&self, identity: &Identity) -> Option<&Identity> {
        self.members.iter().find(|member| *member != identity)
    }

    /// Rebuild a room from its id when only one member is known locally.
    fn from_id_and_member(room_id: &RoomId, member: &Identity) -> Self {
        let members = room_id
            .as_str()
            .strip_prefix("pair:")
            .map(|rest| {
                let lo = rest.strip_prefix(member.as_str()).and_then(|r| r.strip_prefix(':'));
                let hi = rest
                    .strip_suffix(member.as_str())
                    .and_then(|r| r.strip_suffix(':'));
                match (lo, hi) {
                    (Some(other), _) | (None, Some(other)) => {
                        vec![member.clone(), Identity::from(other)]
                    }
                    (None, None) => vec![member.clone()],
                }
            })
            .unwrap_or_else(|| vec![member.clone()]);
        Self {
            id: room_id.clone(),
            members,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(Room),
    /// Both members already occupy this room; nothing changed.
    AlreadyPaired(RoomId),
}

pub struct PairingManager {
    directory: Arc<ClusterDirectory>,
    registry: Arc<ConnectionRegistry>,
    table: PairingTable,
    /// Rooms with at least one member on this process.
    rooms: Mutex<HashMap<RoomId, Room>>,
}

impl PairingManager {
    pub fn new(directory: Arc<ClusterDirectory>, table: PairingTable) -> Self {
        Self {
            registry: directory.registry().clone(),
            directory,
            table,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &PairingTable {
        &self.table
    }

    /// Best-effort pairing with the configured partner. Rejections are
    /// silent.
    pub async fn auto_pair(&self, identity: &Identity) -> Option<Room> {
        let partner = self.table.partner_of(identity)?.clone();
        match self.try_join(identity, &partner).await {
            Ok(JoinOutcome::Joined(room)) => Some(room),
            Ok(JoinOutcome::AlreadyPaired(_)) => None,
            Err(e) => {
                log::debug!("Auto-pair of '{identity}' skipped: {e}");
                None
            }
        }
    }

    /// Explicit pairing request, gated by the allow-list.
    pub async fn pair_with(
        &self,
        identity: &Identity,
        peer: &Identity,
    ) -> Result<JoinOutcome, HubError> {
        if !self.table.allows(identity, peer) {
            return Err(HubError::PairNotAllowed {
                identity: identity.clone(),
                peer: peer.clone(),
            });
        }
        self.try_join(identity, peer).await
    }

    async fn try_join(&self, a: &Identity, b: &Identity) -> Result<JoinOutcome, HubError> {
        let room = Room::for_pair(a, b);
        let view = self.directory.snapshot().await;
        let snapshot_room = |identity: &Identity| {
            view.find_live(identity)
                .map(|record| record.room.clone())
                .ok_or_else(|| HubError::PeerUnavailable(identity.clone()))
        };
        let (snap_a, snap_b) = (snapshot_room(a)?, snapshot_room(b)?);

        let mut rooms = self.rooms.lock().await;
        let room_a = self.current_room(a, snap_a).await?;
        let room_b = self.current_room(b, snap_b).await?;

        if room_a.as_ref() == Some(&room.id) && room_b.as_ref() == Some(&room.id) {
            return Ok(JoinOutcome::AlreadyPaired(room.id));
        }
        let busy = |current: &Option<RoomId>| current.as_ref().is_some_and(|r| *r != room.id);
        if busy(&room_a) || busy(&room_b) {
            return Err(HubError::RoomFull {
                identity: a.clone(),
                peer: b.clone(),
            });
        }

        for member in &room.members {
            if self.registry.set_room(member, Some(room.id.clone())).await {
                self.registry
                    .send(
                        member,
                        ServerEvent::RoomJoined {
                            room_id: room.id.clone(),
                            members: room.members.clone(),
                        },
                    )
                    .await;
            } else {
                self.directory.publish(BackplaneMessage::RoomAssigned {
                    identity: member.clone(),
                    room_id: room.id.clone(),
                    members: room.members.clone(),
                });
            }
        }
        rooms.insert(room.id.clone(), room.clone());
        log::info!("Room {} opened for {} and {}", room.id, a, b);
        Ok(JoinOutcome::Joined(room))
    }

    /// Room of a join member as of now. Local members are read from the
    /// registry, remote ones keep their snapshot row.
    async fn current_room(
        &self,
        identity: &Identity,
        snapshot: Option<RoomId>,
    ) -> Result<Option<RoomId>, HubError> {
        if !self.registry.is_local(identity).await {
            return Ok(snapshot);
        }
        if !self.registry.is_live(identity).await {
            return Err(HubError::PeerUnavailable(identity.clone()));
        }
        Ok(self.registry.room_of(identity).await)
    }

    /// Take `identity` out of its room. The peer is told before either
    /// membership is cleared; the room is then destroyed.
    pub async fn leave(&self, identity: &Identity) -> Option<RoomId> {
        let mut rooms = self.rooms.lock().await;
        let room_id = self.registry.room_of(identity).await?;
        let room = rooms
            .remove(&room_id)
            .unwrap_or_else(|| Room::from_id_and_member(&room_id, identity));

        if let Some(peer) = room.peer_of(identity) {
            let notice = ServerEvent::PeerLeft {
                identity: identity.clone(),
                room_id: room_id.clone(),
            };
            if self.registry.is_local(peer).await {
                self.registry.send(peer, notice).await;
                self.registry.set_room(peer, None).await;
            } else {
                self.directory.publish(BackplaneMessage::RoomReleased {
                    identity: peer.clone(),
                    room_id: room_id.clone(),
                    departed: identity.clone(),
                });
            }
        }
        self.registry.set_room(identity, None).await;
        log::info!("Room {room_id} closed: '{identity}' left");
        Some(room_id)
    }

    /// A remote process joined our `identity` into a room.
    ///
    /// If `identity` already sits in another room the assignment is refused
    /// and the assigning side is told to release its half.
    pub async fn apply_assigned(&self, identity: &Identity, room_id: RoomId, members: Vec<Identity>) {
        let mut rooms = self.rooms.lock().await;
        if let Some(current) = self.registry.room_of(identity).await {
            if current != room_id {
                log::info!("Refusing room {room_id} for '{identity}': already in {current}");
                for member in members.iter().filter(|member| *member != identity) {
                    self.directory.publish(BackplaneMessage::RoomReleased {
                        identity: member.clone(),
                        room_id: room_id.clone(),
                        departed: identity.clone(),
                    });
                }
                return;
            }
        }
        if !self.registry.set_room(identity, Some(room_id.clone())).await {
            log::debug!("Room assignment for absent '{identity}' ignored");
            return;
        }
        self.registry
            .send(
                identity,
                ServerEvent::RoomJoined {
                    room_id: room_id.clone(),
                    members: members.clone(),
                },
            )
            .await;
        rooms.insert(room_id.clone(), Room { id: room_id, members });
    }

    /// A remote process reports that `departed` left our `identity`'s room.
    pub async fn apply_released(&self, identity: &Identity, room_id: RoomId, departed: Identity) {
        let mut rooms = self.rooms.lock().await;
        if self.registry.room_of(identity).await.as_ref() != Some(&room_id) {
            return;
        }
        self.registry
            .send(
                identity,
                ServerEvent::PeerLeft {
                    identity: departed,
                    room_id: room_id.clone(),
                },
            )
            .await;
        self.registry.set_room(identity, None).await;
        rooms.remove(&room_id);
    }

    /// The room `identity` occupies and the other members in it.
    pub async fn room_peers(&self, identity: &Identity) -> Option<(RoomId, Vec<Identity>)> {
        let rooms = self.rooms.lock().await;
        let room_id = self.registry.room_of(identity).await?;
        let room = rooms
            .get(&room_id)
            .cloned()
            .unwrap_or_else(|| Room::from_id_and_member(&room_id, identity));
        let peers = room
            .members
            .into_iter()
            .filter(|member| member != identity)
            .collect();
        Some((room_id, peers))
    }

    pub async fn rooms(&self) -> Vec<Room> {
        self.rooms.lock().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
