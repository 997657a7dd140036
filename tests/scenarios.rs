//! Integration tests against the concrete scenarios (spec.md §8 "Concrete scenarios").
//! Scenario 1 (shared text convergence across two exchanged stores) needs base-sequence-CRDT
//! concurrent-insert placement, which is explicitly out of scope (spec.md §1) — skipped here.

use blockmesh::{DocType, ItemContent, MapRef, Origin, TextRef, WorkspaceCell, WorkspaceOptions};
use std::cell::RefCell;
use std::rc::Rc;

/// Scenario 2: "Local ref conflict". A single block used in two map keys of the same root; after
/// the closing transaction exactly one key holds the original child, the other a clone.
#[test]
fn local_ref_conflict_leaves_exactly_one_key_holding_the_original() {
    let ws = WorkspaceCell::new(WorkspaceOptions::new());
    let root = ws.get_or_create_root_doc("R", DocType::Map).unwrap();
    let root_id = root.borrow().id.clone();
    let child = ws.create_doc(DocType::Array);
    let child_id = child.borrow().id.clone();

    ws.transact(None, |wtx| {
        let txn = wtx.doc(&root_id).unwrap();
        let branch = txn.doc.clone().borrow_mut().root();
        txn.set_ref(branch, "a", child_id.clone(), DocType::Array).unwrap();
        txn.set_ref(branch, "b", child_id.clone(), DocType::Array).unwrap();
    });

    let map = MapRef::from(root.borrow_mut().root());
    let a_doc_id = match map.get("a").unwrap() {
        ItemContent::DocRef(r) => r.doc_id.clone(),
        _ => panic!("expected a DocRef at key \"a\""),
    };
    let b_doc_id = match map.get("b").unwrap() {
        ItemContent::DocRef(r) => r.doc_id.clone(),
        _ => panic!("expected a DocRef at key \"b\""),
    };

    // exactly one of the two keys still points at the original child; the other was cloned away.
    assert_ne!(a_doc_id, b_doc_id, "both keys must not share the same target after resolution");
    assert!(a_doc_id == child_id || b_doc_id == child_id);

    // invariant I1: the child doc has exactly one live referrer.
    let winner_key = if a_doc_id == child_id { "a" } else { "b" };
    let winner_ref = match map.get(winner_key).unwrap() {
        ItemContent::DocRef(r) => r.clone(),
        _ => unreachable!(),
    };
    assert_eq!(child.borrow().owner_doc.as_ref(), Some(&root_id));
    let _ = winner_ref;
}

/// Scenario 3: "Cycle prevention". B1 refs B2 in one transaction, then B2 refs B1 back in a
/// second transaction — the second ref must be removed rather than close the loop.
#[test]
fn cycle_prevention_removes_the_closing_ref() {
    let ws = WorkspaceCell::new(WorkspaceOptions::new());
    let b1 = ws.create_doc(DocType::Map);
    let b2 = ws.create_doc(DocType::Map);
    let b1_id = b1.borrow().id.clone();
    let b2_id = b2.borrow().id.clone();

    ws.transact(None, |wtx| {
        let txn = wtx.doc(&b1_id).unwrap();
        let branch = txn.doc.clone().borrow_mut().root();
        txn.set_ref(branch, "x", b2_id.clone(), DocType::Map).unwrap();
    });

    ws.transact(None, |wtx| {
        let txn = wtx.doc(&b2_id).unwrap();
        let branch = txn.doc.clone().borrow_mut().root();
        txn.set_ref(branch, "y", b1_id.clone(), DocType::Map).unwrap();
    });

    let map_b2 = MapRef::from(b2.borrow_mut().root());
    assert!(map_b2.get("y").is_none(), "the closing ref must have been removed");

    let map_b1 = MapRef::from(b1.borrow_mut().root());
    assert!(map_b1.contains_key("x"), "the original, non-cyclic ref is untouched");
}

/// Scenario 4: "Unref emission". Assigning then deleting a ref on the same key emits exactly one
/// `DocUnref` (appended to the owning doc's internal `"_unrefs"` array, spec.md §3 I5 / §4.6) and
/// leaves the original Ref marked deleted.
#[test]
fn deleting_a_ref_emits_exactly_one_unref() {
    let ws = WorkspaceCell::new(WorkspaceOptions::new());
    let root = ws.get_or_create_root_doc("R", DocType::Map).unwrap();
    let root_id = root.borrow().id.clone();
    let child = ws.create_doc(DocType::Array);
    let child_id = child.borrow().id.clone();

    ws.transact(None, |wtx| {
        let txn = wtx.doc(&root_id).unwrap();
        let branch = txn.doc.clone().borrow_mut().root();
        txn.set_ref(branch, "c", child_id.clone(), DocType::Array).unwrap();
        txn.delete_key(branch, "c").unwrap();
    });

    let map = MapRef::from(root.borrow_mut().root());
    assert!(map.get("c").is_none(), "the deleted Ref item no longer shows as live");

    let mut unref_count = 0;
    let mut unref_matches = false;
    let unrefs = root.borrow_mut().get_or_create_type("_unrefs", DocType::Array);
    let mut cursor = unrefs.start;
    while let Some(item) = cursor {
        if let ItemContent::DocUnref(u) = &item.content {
            unref_count += 1;
            if u.doc_id == child_id {
                unref_matches = true;
            }
        }
        cursor = item.right;
    }
    assert_eq!(unref_count, 1, "exactly one Unref must have been appended to \"_unrefs\"");
    assert!(unref_matches, "the Unref must reference the deleted child doc");

    let root_map = MapRef::from(root.borrow_mut().root());
    assert!(
        root_map.get("_unrefs").is_none(),
        "the Unref must not leak onto the root map's own keys"
    );
}

/// Scenario 5 (adapted): nested `transact` calls invoked from an `afterTransaction` observer run
/// to completion and their own origin is observed distinctly from the outer one. This crate
/// doesn't synthesize a "cleanup" pseudo-transaction the way the literal scenario's middle origin
/// implies (DESIGN.md "Known simplifications"), so only the outer/nested ordering is asserted.
#[test]
fn nested_transact_from_after_transaction_observer_runs_and_is_ordered() {
    let doc = blockmesh::Doc::detached(DocType::Text, &blockmesh::DocOptions::new());
    let seen_origins: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let nested_already_ran = Rc::new(RefCell::new(false));
    let _sub = {
        let seen = seen_origins.clone();
        let doc_for_nested = doc.clone();
        let nested_already_ran = nested_already_ran.clone();
        doc.borrow().on_after_transaction(move |txn| {
            let origin = txn.origin.as_ref().map(|o| o.0.to_string()).unwrap_or_default();
            seen.borrow_mut().push(origin.clone());
            if origin == "first" && !*nested_already_ran.borrow() {
                *nested_already_ran.borrow_mut() = true;
                doc_for_nested.transact(Some(Origin::from("nested")), |txn| {
                    let branch = txn.doc.clone().borrow_mut().root();
                    txn.push_str(branch, "!").unwrap();
                });
            }
        })
    };

    doc.transact(Some(Origin::from("first")), |txn| {
        let branch = txn.doc.clone().borrow_mut().root();
        txn.push_str(branch, "0").unwrap();
    });

    let origins = seen_origins.borrow();
    assert_eq!(origins.as_slice(), ["first".to_string(), "nested".to_string()]);

    let text = TextRef::from(doc.borrow_mut().root());
    assert_eq!(text.len(), 2);
}

/// Scenario 6: "Remote ref wins". A receiver workspace already has a local ref to a child doc;
/// a remote peer independently sets its own ref to the same child under the same key. Once the
/// remote peer's update is applied, its ref wins and the receiver's pre-existing ref is cloned away
/// (spec.md §4.6 step 4, remote branch).
#[test]
fn remote_ref_conflict_keeps_the_incoming_ref_and_clones_the_pre_existing_one() {
    let receiver = WorkspaceCell::new(WorkspaceOptions::new());
    let root = receiver.get_or_create_root_doc("R", DocType::Map).unwrap();
    let root_id = root.borrow().id.clone();
    let child = receiver.create_doc(DocType::Array);
    let child_id = child.borrow().id.clone();

    receiver.transact(None, |wtx| {
        let txn = wtx.doc(&root_id).unwrap();
        let branch = txn.doc.clone().borrow_mut().root();
        txn.set_ref(branch, "x", child_id.clone(), DocType::Array).unwrap();
    });

    let original_ref_item = child.borrow().referrer;
    assert!(original_ref_item.is_some());

    // a remote peer, independently, also sets a ref to the same child under the same key.
    let remote = WorkspaceCell::new(WorkspaceOptions::new());
    let remote_root = remote.get_or_create_root_doc("R", DocType::Map).unwrap();
    let remote_root_id = remote_root.borrow().id.clone();
    assert_eq!(remote_root_id, root_id, "deterministic root doc ids must match across peers");
    remote.get_or_create_doc(&child_id, DocType::Array);

    remote.transact(None, |wtx| {
        let txn = wtx.doc(&remote_root_id).unwrap();
        let branch = txn.doc.clone().borrow_mut().root();
        txn.set_ref(branch, "x", child_id.clone(), DocType::Array).unwrap();
    });

    let bytes = remote.encode_state_as_update_v2(&remote_root_id, None).unwrap();
    receiver.apply_update(&root_id, DocType::Map, &bytes, None).unwrap();

    // exactly one referrer on the child after resolution, and it is not the original item.
    let winner = child.borrow().referrer;
    assert!(winner.is_some());
    assert_ne!(winner, original_ref_item, "the incoming remote ref must have won");

    let map = MapRef::from(root.borrow_mut().root());
    match map.get("x").unwrap() {
        ItemContent::DocRef(r) => assert_eq!(r.doc_id, child_id),
        _ => panic!("expected a DocRef at key \"x\""),
    }
}
