//! Packets exchanged between client and server.
//!
//! Every packet is a one byte type tag followed by a type-specific payload.
//! TCP carries connection lifecycle, chat and scene control; UDP carries
//! actions and snapshots.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{
    action::{NetAction, MIN_ACTION_LEN},
    ids::ClientId,
    object::ObjectTree,
    replication::{decode_tree, encode_tree},
    wire::{DecodeError, WireReader, WireWriter},
};

/// Reason sent when a disconnect carries none.
pub const DEFAULT_DISCONNECT_REASON: &str = "No Reason";

/// Wire tags of every packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionAccept = 1,
    Disconnect = 2,
    Chat = 3,
    SceneChange = 4,
    Action = 50,
    Snapshot = 51,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        Ok(match tag {
            0 => PacketType::ConnectionRequest,
            1 => PacketType::ConnectionAccept,
            2 => PacketType::Disconnect,
            3 => PacketType::Chat,
            4 => PacketType::SceneChange,
            50 => PacketType::Action,
            51 => PacketType::Snapshot,
            other => return Err(DecodeError::UnknownPacketType(other)),
        })
    }
}

/// Authoritative world state plus sequencing metadata.
#[derive(Debug, Clone)]
pub struct SnapshotPacket {
    pub scene_epoch: i32,
    pub tick: u32,
    /// Highest applied action sequence per client.
    pub last_processed: BTreeMap<ClientId, u32>,
    pub world: ObjectTree,
}

impl SnapshotPacket {
    pub fn last_processed_for(&self, client: ClientId) -> Option<u32> {
        self.last_processed.get(&client).copied()
    }
}

#[derive(Debug, Clone)]
pub enum Packet {
    /// Client to server: first frame of every connection.
    ConnectionRequest { name: String, udp_port: u16 },
    /// Server to client: handshake reply with everything a late joiner needs.
    ConnectionAccept {
        client_id: ClientId,
        server_name: String,
        server_udp_port: u16,
        scene_key: String,
        scene_epoch: i32,
    },
    Disconnect { reason: String },
    Chat { sender: String, message: String },
    SceneChange { scene_epoch: i32, scene_key: String },
    Action {
        client_id: ClientId,
        actions: Vec<NetAction>,
    },
    Snapshot(SnapshotPacket),
}

impl Packet {
    pub fn disconnect(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Packet::Disconnect {
            reason: if reason.is_empty() {
                DEFAULT_DISCONNECT_REASON.to_string()
            } else {
                reason
            },
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConnectionRequest { .. } => PacketType::ConnectionRequest,
            Packet::ConnectionAccept { .. } => PacketType::ConnectionAccept,
            Packet::Disconnect { .. } => PacketType::Disconnect,
            Packet::Chat { .. } => PacketType::Chat,
            Packet::SceneChange { .. } => PacketType::SceneChange,
            Packet::Action { .. } => PacketType::Action,
            Packet::Snapshot(_) => PacketType::Snapshot,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::with_capacity(64);
        w.put_u8(self.packet_type() as u8);
        match self {
            Packet::ConnectionRequest { name, udp_port } => {
                w.put_str(name);
                w.put_u16(*udp_port);
            }
            Packet::ConnectionAccept {
                client_id,
                server_name,
                server_udp_port,
                scene_key,
                scene_epoch,
            } => {
                w.put_i32(client_id.0);
                w.put_str(server_name);
                w.put_u16(*server_udp_port);
                w.put_str(scene_key);
                w.put_i32(*scene_epoch);
            }
            Packet::Disconnect { reason } => w.put_str(reason),
            Packet::Chat { sender, message } => {
                w.put_str(sender);
                w.put_str(message);
            }
            Packet::SceneChange {
                scene_epoch,
                scene_key,
            } => {
                w.put_i32(*scene_epoch);
                w.put_str(scene_key);
            }
            Packet::Action { client_id, actions } => {
                w.put_i32(client_id.0);
                w.put_len(actions.len());
                for action in actions {
                    action.encode(&mut w);
                }
            }
            Packet::Snapshot(snap) => {
                return encode_snapshot(snap.scene_epoch, snap.tick, &snap.last_processed, &snap.world);
            }
        }
        w.finish()
    }

    /// Decodes a whole message. Unread trailing bytes are an error.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        if r.remaining() == 0 {
            return Err(DecodeError::Empty);
        }

        let packet = match PacketType::from_u8(r.u8()?)? {
            PacketType::ConnectionRequest => Packet::ConnectionRequest {
                name: r.string()?,
                udp_port: r.u16()?,
            },
            PacketType::ConnectionAccept => Packet::ConnectionAccept {
                client_id: ClientId(r.i32()?),
                server_name: r.string()?,
                server_udp_port: r.u16()?,
                scene_key: r.string()?,
                scene_epoch: r.i32()?,
            },
            PacketType::Disconnect => Packet::Disconnect { reason: r.string()? },
            PacketType::Chat => Packet::Chat {
                sender: r.string()?,
                message: r.string()?,
            },
            PacketType::SceneChange => Packet::SceneChange {
                scene_epoch: r.i32()?,
                scene_key: r.string()?,
            },
            PacketType::Action => {
                let client_id = ClientId(r.i32()?);
                let count = r.count(MIN_ACTION_LEN)?;
                let actions = (0..count)
                    .map(|_| NetAction::decode(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                Packet::Action { client_id, actions }
            }
            PacketType::Snapshot => {
                let scene_epoch = r.i32()?;
                let tick = r.u32()?;
                let acks = r.count(8)?;
                let mut last_processed = BTreeMap::new();
                for _ in 0..acks {
                    let client = ClientId(r.i32()?);
                    last_processed.insert(client, r.u32()?);
                }
                let world = decode_tree(&mut r)?;
                Packet::Snapshot(SnapshotPacket {
                    scene_epoch,
                    tick,
                    last_processed,
                    world,
                })
            }
        };
        r.finish()?;
        Ok(packet)
    }
}

/// Encodes a snapshot straight from a borrowed world tree.
pub fn encode_snapshot(
    scene_epoch: i32,
    tick: u32,
    last_processed: &BTreeMap<ClientId, u32>,
    world: &ObjectTree,
) -> Bytes {
    let mut w = WireWriter::with_capacity(256);
    w.put_u8(PacketType::Snapshot as u8);
    w.put_i32(scene_epoch);
    w.put_u32(tick);
    w.put_len(last_processed.len());
    for (client, seq) in last_processed {
        w.put_i32(client.0);
        w.put_u32(*seq);
    }
    encode_tree(world, &mut w);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ids::NetworkId,
        math::Vec2,
        object::{NetObject, ObjectKind},
    };

    fn roundtrip(p: &Packet) -> Packet {
        Packet::decode(&p.encode()).unwrap()
    }

    #[test]
    fn connection_request_roundtrip() {
        let p = Packet::ConnectionRequest {
            name: String::new(),
            udp_port: u16::MAX,
        };
        match roundtrip(&p) {
            Packet::ConnectionRequest { name, udp_port } => {
                assert_eq!(name, "");
                assert_eq!(udp_port, u16::MAX);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn connection_accept_roundtrip() {
        let p = Packet::ConnectionAccept {
            client_id: ClientId(3),
            server_name: "lan party".into(),
            server_udp_port: 7778,
            scene_key: "arena".into(),
            scene_epoch: 4,
        };
        match roundtrip(&p) {
            Packet::ConnectionAccept {
                client_id,
                server_name,
                server_udp_port,
                scene_key,
                scene_epoch,
            } => {
                assert_eq!(client_id, ClientId(3));
                assert_eq!(server_name, "lan party");
                assert_eq!(server_udp_port, 7778);
                assert_eq!(scene_key, "arena");
                assert_eq!(scene_epoch, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_defaults_reason() {
        match roundtrip(&Packet::disconnect("")) {
            Packet::Disconnect { reason } => assert_eq!(reason, DEFAULT_DISCONNECT_REASON),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_keeps_given_reason() {
        match roundtrip(&Packet::disconnect("Server Full")) {
            Packet::Disconnect { reason } => assert_eq!(reason, "Server Full"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chat_and_scene_change_use_their_own_tags() {
        let chat = Packet::Chat {
            sender: "alice".into(),
            message: "hi there".into(),
        };
        let scene = Packet::SceneChange {
            scene_epoch: 2,
            scene_key: "garden".into(),
        };
        assert_eq!(chat.encode()[0], 3);
        assert_eq!(scene.encode()[0], 4);

        match roundtrip(&chat) {
            Packet::Chat { sender, message } => {
                assert_eq!(sender, "alice");
                assert_eq!(message, "hi there");
            }
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&scene) {
            Packet::SceneChange {
                scene_epoch,
                scene_key,
            } => {
                assert_eq!(scene_epoch, 2);
                assert_eq!(scene_key, "garden");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_action_list_roundtrip() {
        let p = Packet::Action {
            client_id: ClientId(1),
            actions: Vec::new(),
        };
        match roundtrip(&p) {
            Packet::Action { client_id, actions } => {
                assert_eq!(client_id, ClientId(1));
                assert!(actions.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn action_list_keeps_order() {
        let mut a = NetAction::movement(Vec2::new(1.0, 0.0));
        a.sequence = 1;
        let mut b = NetAction::movement(Vec2::new(0.0, 1.0));
        b.sequence = 2;
        b.tick = 9;
        let p = Packet::Action {
            client_id: ClientId(2),
            actions: vec![a, b],
        };
        match roundtrip(&p) {
            Packet::Action { actions, .. } => assert_eq!(actions, vec![a, b]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn snapshot_roundtrip_keeps_acks_and_tree() {
        let mut root = NetObject::new(ObjectKind::SceneRoot);
        root.network_id = NetworkId(1);
        let mut world = ObjectTree::new(root);
        let mut pawn = NetObject::new(ObjectKind::Player);
        pawn.network_id = NetworkId(2);
        pawn.owner = ClientId(1);
        pawn.state.name = "ana".into();
        pawn.state.score = 12;
        let rk = world.root();
        world.add_child(rk, pawn);

        let acks = BTreeMap::from([(ClientId(1), 6u32), (ClientId(2), 0)]);
        let bytes = encode_snapshot(3, 1000, &acks, &world);
        match Packet::decode(&bytes).unwrap() {
            Packet::Snapshot(snap) => {
                assert_eq!(snap.scene_epoch, 3);
                assert_eq!(snap.tick, 1000);
                assert_eq!(snap.last_processed, acks);
                assert_eq!(snap.last_processed_for(ClientId(1)), Some(6));
                let k = snap.world.find_by_network_id(NetworkId(2)).unwrap();
                let obj = snap.world.get(k).unwrap();
                assert_eq!(obj.owner, ClientId(1));
                assert_eq!(obj.state.name, "ana");
                assert_eq!(obj.state.score, 12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            Packet::decode(&[9]),
            Err(DecodeError::UnknownPacketType(9))
        ));
        assert!(matches!(Packet::decode(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let bytes = Packet::Chat {
            sender: "someone".into(),
            message: "hello".into(),
        }
        .encode();
        assert!(Packet::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Packet::disconnect("bye").encode().to_vec();
        bytes.push(0);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::TrailingBytes(1))
        ));
    }
}
