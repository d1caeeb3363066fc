use elasticsync_types::{InstanceTag, WorkerId};
use std::collections::HashSet;
use std::str::FromStr;

// ── InstanceTag ───────────────────────────────────────────────────

#[test]
fn instance_tags_are_unique() {
    let tags: HashSet<_> = (0..100).map(|_| InstanceTag::new()).collect();
    assert_eq!(tags.len(), 100);
}

#[test]
fn instance_tag_is_short() {
    assert_eq!(InstanceTag::new().as_str().len(), 8);
}

#[test]
fn instance_tag_from_static() {
    let tag = InstanceTag::from_static("node-a");
    assert_eq!(tag.to_string(), "node-a");
}

// ── WorkerId ──────────────────────────────────────────────────────

#[test]
fn worker_id_is_one_based() {
    let tag = InstanceTag::from_static("abc");
    assert_eq!(WorkerId::new(&tag, 0).as_str(), "abc:worker_1");
    assert_eq!(WorkerId::new(&tag, 3).to_string(), "abc:worker_4");
}

#[test]
fn worker_id_instance_part() {
    let tag = InstanceTag::from_static("abc");
    assert_eq!(WorkerId::new(&tag, 1).instance(), Some("abc"));
    assert_eq!(WorkerId::from_str("worker_1").unwrap().instance(), None);
}

#[test]
fn worker_ids_differ_across_instances() {
    let a = WorkerId::new(&InstanceTag::new(), 0);
    let b = WorkerId::new(&InstanceTag::new(), 0);
    assert_ne!(a, b);
}

#[test]
fn worker_id_from_str_rejects_blank() {
    assert!(WorkerId::from_str("   ").is_err());
    assert!(WorkerId::from_str("ops:manual").is_ok());
}
