//! Snapshot tree encoding and the snapshot merge.
//!
//! A world tree travels as a pre-order walk of its replicated nodes:
//!
//! ```text
//! node := kind u8 | network_id i32 | owner i32 | properties | child_count u32 | node*
//! ```
//!
//! Non-replicated children (and their whole subtrees) are skipped on encode.
//! Every node decoded from a snapshot is replicated.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::{
    ids::{ClientId, NetworkId},
    object::{NetObject, ObjectKey, ObjectKind, ObjectTree},
    wire::{DecodeError, WireReader, WireWriter},
};

/// Deepest tree a snapshot may describe.
pub const MAX_TREE_DEPTH: usize = 64;

// kind + network id + owner + property count + child count
const MIN_NODE_LEN: usize = 1 + 4 + 4 + 4 + 4;

/// Encodes the replicated part of `tree`, rooted at its root.
pub fn encode_tree(tree: &ObjectTree, w: &mut WireWriter) {
    encode_node(tree, tree.root(), w);
}

fn encode_node(tree: &ObjectTree, key: ObjectKey, w: &mut WireWriter) {
    let Some(obj) = tree.get(key) else {
        return;
    };
    w.put_u8(obj.kind().as_u8());
    w.put_i32(obj.network_id.0);
    w.put_i32(obj.owner.0);
    obj.encode_properties(w, false);

    let children: Vec<ObjectKey> = tree
        .children(key)
        .iter()
        .copied()
        .filter(|c| tree.get(*c).is_some_and(NetObject::is_replicated))
        .collect();
    w.put_len(children.len());
    for child in children {
        encode_node(tree, child, w);
    }
}

/// Decodes a tree written by [`encode_tree`]. The root must be a scene root.
pub fn decode_tree(r: &mut WireReader<'_>) -> Result<ObjectTree, DecodeError> {
    let tag = r.u8()?;
    if tag != ObjectKind::SceneRoot.as_u8() {
        return Err(DecodeError::InvalidRoot(tag));
    }

    let mut root = NetObject::with_replication(ObjectKind::SceneRoot, true);
    let child_count = decode_body(r, &mut root)?;
    let mut tree = ObjectTree::new(root);
    let root_key = tree.root();
    for _ in 0..child_count {
        decode_node(r, &mut tree, root_key, 1)?;
    }
    Ok(tree)
}

fn decode_node(
    r: &mut WireReader<'_>,
    tree: &mut ObjectTree,
    parent: ObjectKey,
    depth: usize,
) -> Result<(), DecodeError> {
    if depth >= MAX_TREE_DEPTH {
        return Err(DecodeError::TreeTooDeep(MAX_TREE_DEPTH));
    }

    let kind = ObjectKind::from_u8(r.u8()?)?;
    let mut obj = NetObject::with_replication(kind, true);
    let child_count = decode_body(r, &mut obj)?;
    let Some(key) = tree.add_child(parent, obj) else {
        return Ok(());
    };
    for _ in 0..child_count {
        decode_node(r, tree, key, depth + 1)?;
    }
    Ok(())
}

/// Reads identity and properties into `obj` and returns the child count.
fn decode_body(r: &mut WireReader<'_>, obj: &mut NetObject) -> Result<u32, DecodeError> {
    obj.network_id = NetworkId(r.i32()?);
    obj.owner = ClientId(r.i32()?);
    obj.decode_properties(r)?;
    // Each child still needs its own header, so huge counts fail fast.
    r.count(MIN_NODE_LEN)
}

/// What a merge changed in the live tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub created: usize,
    pub reparented: usize,
    pub removed: usize,
}

/// Patches `live` so its replicated nodes mirror `snapshot`.
///
/// Live nodes are matched by network id. Matches are moved under the parent
/// the snapshot implies, missing nodes are created and live replicated nodes
/// absent from the snapshot are removed. Property values move through the
/// wire contract. Non-replicated live nodes are left alone unless their
/// replicated ancestor is removed.
pub fn merge_snapshot(
    live: &mut ObjectTree,
    snapshot: &ObjectTree,
) -> Result<MergeReport, DecodeError> {
    let mut report = MergeReport::default();
    let live_root = live.root();
    let snap_root = snapshot.root();

    let mut index: HashMap<NetworkId, ObjectKey> = live
        .iter()
        .filter(|(k, o)| *k != live_root && o.is_replicated() && o.network_id.is_assigned())
        .map(|(k, o)| (o.network_id, k))
        .collect();

    let mut alive = HashSet::new();
    if let (Some(src), Some(dst)) = (snapshot.get(snap_root), live.get_mut(live_root)) {
        dst.network_id = src.network_id;
        dst.owner = src.owner;
        dst.copy_properties_from(src)?;
        alive.insert(src.network_id);
    }

    // (snapshot node, live parent it belongs under)
    let mut stack: Vec<(ObjectKey, ObjectKey)> = snapshot
        .children(snap_root)
        .iter()
        .rev()
        .map(|c| (*c, live_root))
        .collect();

    while let Some((snap_key, parent)) = stack.pop() {
        let Some(src) = snapshot.get(snap_key) else {
            continue;
        };
        let id = src.network_id;

        let reusable = index
            .remove(&id)
            .filter(|k| live.get(*k).is_some_and(|o| o.kind() == src.kind()));
        let placed = match reusable {
            Some(key) if live.parent(key) == Some(parent) => Some(key),
            Some(key) if live.reparent(key, parent) => {
                report.reparented += 1;
                Some(key)
            }
            _ => None,
        };
        let key = match placed {
            Some(key) => key,
            None => {
                if let Some(stale) = live.find_by_network_id(id).filter(|k| *k != live_root) {
                    if !alive.contains(&id) {
                        live.remove(stale);
                    }
                }
                let Some(key) =
                    live.add_child(parent, NetObject::with_replication(src.kind(), true))
                else {
                    continue;
                };
                report.created += 1;
                key
            }
        };

        if let Some(dst) = live.get_mut(key) {
            dst.network_id = id;
            dst.owner = src.owner;
            dst.copy_properties_from(src)?;
        }
        alive.insert(id);

        stack.extend(snapshot.children(snap_key).iter().rev().map(|c| (*c, key)));
    }

    let despawned: Vec<ObjectKey> = live
        .iter()
        .filter(|(k, o)| *k != live_root && o.is_replicated() && !alive.contains(&o.network_id))
        .map(|(k, _)| k)
        .collect();
    for key in despawned {
        if live.remove(key).is_some() {
            report.removed += 1;
        }
    }

    trace!(?report, "Merged snapshot");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec2;

    fn player(id: i32, x: f32) -> NetObject {
        let mut p = NetObject::new(ObjectKind::Player);
        p.network_id = NetworkId(id);
        p.state.position = Vec2::new(x, 0.0);
        p
    }

    fn root(id: i32) -> ObjectTree {
        let mut r = NetObject::new(ObjectKind::SceneRoot);
        r.network_id = NetworkId(id);
        ObjectTree::new(r)
    }

    fn ids(tree: &ObjectTree) -> Vec<i32> {
        tree.iter().map(|(_, o)| o.network_id.0).collect()
    }

    fn roundtrip(tree: &ObjectTree) -> ObjectTree {
        let mut w = WireWriter::new();
        encode_tree(tree, &mut w);
        let bytes = w.into_vec();
        let mut r = WireReader::new(&bytes);
        let out = decode_tree(&mut r).unwrap();
        r.finish().unwrap();
        out
    }

    #[test]
    fn encode_skips_non_replicated_subtrees() {
        let mut t = root(1);
        let rk = t.root();
        let deco = t.add_child(rk, NetObject::new(ObjectKind::GameObject)).unwrap();
        t.add_child(deco, player(5, 0.0));
        t.add_child(rk, player(2, 3.0));

        let decoded = roundtrip(&t);
        assert_eq!(ids(&decoded), vec![1, 2]);
        assert!(decoded.iter().all(|(_, o)| o.is_replicated()));
    }

    #[test]
    fn root_only_tree_roundtrips() {
        let decoded = roundtrip(&root(7));
        assert_eq!(decoded.len(), 1);
        assert_eq!(ids(&decoded), vec![7]);
    }

    #[test]
    fn non_scene_root_is_rejected() {
        let t = ObjectTree::new(player(1, 0.0));
        let mut w = WireWriter::new();
        encode_tree(&t, &mut w);
        let bytes = w.into_vec();
        assert!(matches!(
            decode_tree(&mut WireReader::new(&bytes)),
            Err(DecodeError::InvalidRoot(2))
        ));
    }

    #[test]
    fn overly_deep_tree_is_rejected() {
        let mut t = root(1);
        let mut parent = t.root();
        for i in 0..(MAX_TREE_DEPTH as i32 + 1) {
            parent = t.add_child(parent, player(i + 2, 0.0)).unwrap();
        }
        let mut w = WireWriter::new();
        encode_tree(&t, &mut w);
        let bytes = w.into_vec();
        assert!(matches!(
            decode_tree(&mut WireReader::new(&bytes)),
            Err(DecodeError::TreeTooDeep(MAX_TREE_DEPTH))
        ));
    }

    #[test]
    fn huge_child_count_fails_fast() {
        let mut w = WireWriter::new();
        w.put_u8(ObjectKind::SceneRoot.as_u8());
        w.put_i32(1);
        w.put_i32(-1);
        w.put_u32(0);
        w.put_u32(u32::MAX);
        let bytes = w.into_vec();
        assert!(matches!(
            decode_tree(&mut WireReader::new(&bytes)),
            Err(DecodeError::CountTooLarge { .. })
        ));
    }

    #[test]
    fn merge_removes_missing_and_updates_survivors() {
        let mut live = root(10);
        let lr = live.root();
        let k1 = live.add_child(lr, player(1, 0.0)).unwrap();
        live.add_child(lr, player(2, 0.0));
        let k3 = live.add_child(lr, player(3, 0.0)).unwrap();

        let mut snap = root(10);
        let sr = snap.root();
        snap.add_child(sr, player(1, 5.0));
        snap.add_child(sr, player(3, 6.0));

        let report = merge_snapshot(&mut live, &snap).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.created, 0);
        assert_eq!(ids(&live), vec![10, 1, 3]);
        assert_eq!(live.get(k1).unwrap().state.position, Vec2::new(5.0, 0.0));
        assert_eq!(live.get(k3).unwrap().state.position, Vec2::new(6.0, 0.0));
    }

    #[test]
    fn merge_creates_new_node_under_matching_parent() {
        let mut live = root(10);
        let lr = live.root();
        let k1 = live.add_child(lr, player(1, 0.0)).unwrap();

        let mut snap = root(10);
        let sr = snap.root();
        let s1 = snap.add_child(sr, player(1, 0.0)).unwrap();
        snap.add_child(s1, player(4, 9.0));

        let report = merge_snapshot(&mut live, &snap).unwrap();
        assert_eq!(report.created, 1);
        let k4 = live.find_by_network_id(NetworkId(4)).unwrap();
        assert_eq!(live.parent(k4), Some(k1));
        assert!(live.get(k4).unwrap().is_replicated());
    }

    #[test]
    fn merge_reparents_to_snapshot_parent() {
        let mut live = root(10);
        let lr = live.root();
        let k1 = live.add_child(lr, player(1, 0.0)).unwrap();
        let k2 = live.add_child(k1, player(2, 0.0)).unwrap();

        let mut snap = root(10);
        let sr = snap.root();
        let s2 = snap.add_child(sr, player(2, 0.0)).unwrap();
        snap.add_child(s2, player(1, 0.0));

        let report = merge_snapshot(&mut live, &snap).unwrap();
        assert_eq!(report.reparented, 2);
        assert_eq!(live.parent(k2), Some(lr));
        assert_eq!(live.parent(k1), Some(k2));
    }

    #[test]
    fn merge_leaves_local_only_nodes_alone() {
        let mut live = root(10);
        let lr = live.root();
        let deco = live.add_child(lr, NetObject::new(ObjectKind::GameObject)).unwrap();

        merge_snapshot(&mut live, &root(10)).unwrap();
        assert!(live.contains(deco));
    }

    #[test]
    fn merge_adopts_snapshot_root_identity() {
        let mut live = root(-1);
        merge_snapshot(&mut live, &root(3)).unwrap();
        assert_eq!(live.get(live.root()).unwrap().network_id, NetworkId(3));
    }

    #[test]
    fn merge_recreates_node_whose_kind_changed() {
        let mut live = root(10);
        let lr = live.root();
        let mut obj = NetObject::with_replication(ObjectKind::GameObject, true);
        obj.network_id = NetworkId(1);
        let old = live.add_child(lr, obj).unwrap();

        let mut snap = root(10);
        let sr = snap.root();
        snap.add_child(sr, player(1, 2.0));

        merge_snapshot(&mut live, &snap).unwrap();
        assert!(!live.contains(old));
        let k = live.find_by_network_id(NetworkId(1)).unwrap();
        assert_eq!(live.get(k).unwrap().kind(), ObjectKind::Player);
    }
}
