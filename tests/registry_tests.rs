//! Ownership tracking through the allocator

use bytepool_core::{OwnerId, Pointer, PoolConfig};
use bytepool_mem::{AllocationRegistry, Allocator};

struct RecordView;
struct StringView;

fn tracked_pool(len: usize) -> Allocator<Vec<u8>> {
    let config = PoolConfig {
        track_ownership: true,
        ..Default::default()
    };
    Allocator::from_config(vec![0u8; len], &config).unwrap()
}

#[test]
fn test_free_reparents_children() {
    let mut a = tracked_pool(4096);
    let record = OwnerId::of::<RecordView>();
    let string = OwnerId::of::<StringView>();

    let root = a.allocate_owned(64, record, None).unwrap();
    let mid = a.allocate_owned(32, record, Some(root)).unwrap();
    let leaf = a.allocate_owned(16, string, Some(mid)).unwrap();

    a.free(mid).unwrap();

    let reg = a.registry().unwrap();
    assert!(!reg.contains(mid));
    assert_eq!(reg.get_node(leaf).unwrap().parent, Some(root));
    assert!(reg.get_node(root).unwrap().children.contains(&leaf));
    assert_eq!(reg.get_owner(leaf), Some(string));
    assert_eq!(reg.get_root_pointers(), vec![root]);
}

#[test]
fn test_free_recursive_releases_subtree() {
    let mut a = tracked_pool(4096);
    let owner = OwnerId::from_name("tree");

    let root = a.allocate_owned(64, owner, None).unwrap();
    let left = a.allocate_owned(32, owner, Some(root)).unwrap();
    let right = a.allocate_owned(32, owner, Some(root)).unwrap();
    let _grandchild = a.allocate_owned(16, owner, Some(left)).unwrap();
    let unrelated = a.allocate_owned(16, owner, None).unwrap();

    assert_eq!(a.free_recursive(root).unwrap(), 4);

    let reg = a.registry().unwrap();
    assert_eq!(reg.len(), 1);
    assert_eq!(reg.get_root_pointers(), vec![unrelated]);
    assert!(!a.is_valid_memory_range(right, 1));
    a.check_integrity().unwrap();
}

#[test]
fn test_realloc_move_keeps_node() {
    let mut a = tracked_pool(2048);
    let owner = OwnerId::from_name("array");

    let parent = a.allocate_owned(32, owner, None).unwrap();
    let child = a.allocate_owned(32, owner, Some(parent)).unwrap();
    let _blocker = a.allocate(32).unwrap();

    let moved = a.reallocate(child, 512).unwrap();
    assert_ne!(moved, child);

    let reg = a.registry().unwrap();
    assert!(!reg.contains(child));
    assert_eq!(reg.get_node(moved).unwrap().parent, Some(parent));
    assert!(reg.get_node(parent).unwrap().children.contains(&moved));
    assert_eq!(reg.get_owner(moved), Some(owner));
}

#[test]
fn test_reallocate_owned_registers_untracked() {
    let mut a = tracked_pool(2048);
    let owner = OwnerId::from_name("late");

    let p = a.allocate(32).unwrap();
    assert!(!a.registry().unwrap().contains(p));

    let q = a.reallocate_owned(p, 48, owner, None).unwrap();
    assert_eq!(a.registry().unwrap().get_owner(q), Some(owner));

    let fresh = a.reallocate_owned(Pointer::NULL, 16, owner, Some(q)).unwrap();
    assert_eq!(
        a.registry().unwrap().get_node(fresh).unwrap().parent,
        Some(q)
    );
}

#[test]
fn test_untracked_allocations_stay_out_of_registry() {
    let mut a = tracked_pool(1024);
    let p = a.allocate(32).unwrap();
    let _q = a.allocate_zeroed(32).unwrap();
    assert!(a.registry().unwrap().is_empty());
    a.free(p).unwrap();
}

#[test]
fn test_registry_can_be_supplied_prepopulated() {
    let mut registry = AllocationRegistry::new();
    registry.register(Pointer::new(9999), OwnerId::new(1), None);

    let mut a = Allocator::with_region(vec![0u8; 1024], 0, None, Some(registry)).unwrap();
    let p = a.allocate_owned(16, OwnerId::new(2), Some(Pointer::new(9999))).unwrap();

    let reg = a.registry_mut().unwrap();
    assert_eq!(reg.get_node(p).unwrap().parent, Some(Pointer::new(9999)));
    reg.clear();
    assert!(a.registry().unwrap().is_empty());
}

#[test]
fn test_flat_view_serializes() {
    let mut a = tracked_pool(1024);
    let p = a.allocate_owned(16, OwnerId::new(5), None).unwrap();
    let json = serde_json::to_string(&a.registry().unwrap().get_all_allocations()).unwrap();
    assert_eq!(json, format!(r#"{{"{}":5}}"#, p.get()));
}

#[cfg(debug_assertions)]
#[test]
fn test_free_recursive_checks_subtree_before_freeing() {
    let mut a = tracked_pool(2048);
    let owner = OwnerId::from_name("tree");

    let root = a.allocate_owned(64, owner, None).unwrap();
    let child = a.allocate_owned(32, owner, Some(root)).unwrap();

    // A pointer that was never handed out, attached under the child
    let stale = Pointer::new(child.get() + 8);
    a.registry_mut().unwrap().register(stale, owner, Some(child));

    assert!(a.free_recursive(root).is_err());

    // Nothing in the subtree was released
    assert!(a.is_valid_memory_range(root, 64));
    assert!(a.is_valid_memory_range(child, 32));
    assert_eq!(a.registry().unwrap().len(), 3);
    a.check_integrity().unwrap();
}
