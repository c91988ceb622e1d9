use super::{OwnerKey, ValuePool, VarKey};
use crate::fiber::Fault;
use crate::runtime::value::Value;

#[test]
fn value_dropped_when_strong_reaches_zero() {
    let mut pool = ValuePool::new();
    let handle = pool.alloc_temporary(Value::Int(1)).unwrap();
    pool.add_strong(handle).unwrap();
    assert_eq!(pool.counts(handle), Some((2, 0)));

    pool.release_strong(handle).unwrap();
    assert_eq!(pool.get(handle), Ok(&Value::Int(1)));

    pool.release_strong(handle).unwrap();
    assert_eq!(pool.get(handle), Err(Fault::ValueFreed));
    assert_eq!(pool.counts(handle), None);
    assert!(pool.is_empty());
}

#[test]
fn weak_holder_keeps_slot_but_not_value() {
    let mut pool = ValuePool::new();
    let handle = pool.alloc_temporary(Value::from("hello")).unwrap();
    let weak = pool.downgrade(handle).unwrap();

    pool.release_strong(handle).unwrap();
    // The slot is still reserved, but its value is gone.
    assert_eq!(pool.counts(handle), Some((0, 1)));
    assert_eq!(pool.get_weak(weak), None);
    assert_eq!(pool.upgrade(weak), None);
    assert_eq!(pool.len(), 1);

    pool.release_weak(weak.handle()).unwrap();
    assert_eq!(pool.counts(handle), None);
    assert!(pool.is_empty());
}

#[test]
fn recycled_slot_is_not_visible_through_stale_handle() {
    let mut pool = ValuePool::new();
    let stale = pool.alloc_temporary(Value::Int(1)).unwrap();
    let weak = pool.downgrade(stale).unwrap();
    pool.release_strong(stale).unwrap();
    pool.release_weak(weak.handle()).unwrap();

    let fresh = pool.alloc_temporary(Value::Int(2)).unwrap();
    assert_ne!(stale, fresh);
    assert_eq!(pool.get(stale), Err(Fault::ValueFreed));
    assert_eq!(pool.get_weak(weak), None);
    assert_eq!(pool.add_strong(stale), Err(Fault::ValueFreed));
    assert_eq!(pool.get(fresh), Ok(&Value::Int(2)));
}

#[test]
fn counts_never_go_negative() {
    let mut pool = ValuePool::new();
    let handle = pool.alloc_temporary(Value::Nil).unwrap();
    let weak = pool.downgrade(handle).unwrap();
    pool.release_strong(handle).unwrap();
    assert_eq!(pool.release_strong(handle), Err(Fault::ValueFreed));
    pool.release_weak(weak.handle()).unwrap();
    assert_eq!(pool.release_weak(weak.handle()), Err(Fault::ValueFreed));
}

#[test]
fn arrays_release_elements_transitively() {
    let mut pool = ValuePool::new();
    let first = pool.alloc_temporary(Value::Int(1)).unwrap();
    let inner_element = pool.alloc_temporary(Value::Int(2)).unwrap();
    let inner = pool
        .alloc_temporary(Value::Array(vec![inner_element]))
        .unwrap();
    let outer = pool
        .alloc_temporary(Value::Array(vec![first, inner]))
        .unwrap();
    assert_eq!(pool.len(), 4);

    let copy = pool.copy_of(outer).unwrap();
    assert_eq!(pool.counts(first), Some((2, 0)));
    pool.release_value(copy);
    assert_eq!(pool.counts(first), Some((1, 0)));

    pool.release_strong(outer).unwrap();
    assert!(pool.is_empty());
}

#[test]
fn capacity_is_never_exceeded() {
    let mut pool = ValuePool::with_capacity(2);
    let a = pool.alloc_temporary(Value::Int(1)).unwrap();
    let _b = pool.alloc_temporary(Value::Int(2)).unwrap();
    assert_eq!(
        pool.alloc_temporary(Value::Int(3)),
        Err(Fault::PoolExhausted)
    );

    // A slot pinned by a weak holder still counts against capacity.
    let weak = pool.downgrade(a).unwrap();
    pool.release_strong(a).unwrap();
    assert_eq!(
        pool.alloc_temporary(Value::Int(3)),
        Err(Fault::PoolExhausted)
    );
    pool.release_weak(weak.handle()).unwrap();
    assert!(pool.alloc_temporary(Value::Int(3)).is_ok());
}

#[test]
fn exhausted_alloc_releases_its_value() {
    let mut pool = ValuePool::with_capacity(2);
    let element = pool.alloc_temporary(Value::Int(1)).unwrap();
    pool.add_strong(element).unwrap();
    let _filler = pool.alloc_temporary(Value::Nil).unwrap();
    assert_eq!(
        pool.alloc_temporary(Value::Array(vec![element])),
        Err(Fault::PoolExhausted)
    );
    assert_eq!(pool.counts(element), Some((1, 0)));
}

#[test]
fn directory_lookup_by_name_and_index() {
    let mut pool = ValuePool::new();
    let owner = OwnerKey::Machine("counter".into());
    let count = pool.declare(owner.clone(), "count", Value::Int(0)).unwrap();
    let label = pool
        .declare(owner.clone(), "label", Value::from("c"))
        .unwrap();

    assert_eq!(pool.lookup(&owner, VarKey::Name("count")), Some(count));
    assert_eq!(pool.lookup(&owner, VarKey::Index(1)), Some(label));
    assert_eq!(pool.lookup(&owner, VarKey::Name("missing")), None);
    assert_eq!(pool.lookup(&OwnerKey::Global, VarKey::Index(0)), None);
    assert_eq!(
        pool.variables(&owner).map(|name| name.as_str()).collect::<Vec<_>>(),
        ["count", "label"]
    );

    pool.set(count, Value::Int(5)).unwrap();
    assert_eq!(pool.get(count), Ok(&Value::Int(5)));

    pool.release_owner(&owner);
    assert_eq!(pool.lookup(&owner, VarKey::Name("count")), None);
    assert!(pool.is_empty());
}

#[test]
fn display_follows_array_elements() {
    let mut pool = ValuePool::new();
    let a = pool.alloc_temporary(Value::Int(1)).unwrap();
    let b = pool.alloc_temporary(Value::Real(2.5)).unwrap();
    let c = pool.alloc_temporary(Value::from("three")).unwrap();
    let array = Value::Array(vec![a, b, c]);
    assert_eq!(pool.display(&array), "[1, 2.5, three]");
    pool.release_value(array);
    assert!(pool.is_empty());
}

#[test]
fn releasing_an_array_tolerates_freed_elements() {
    let mut pool = ValuePool::new();
    let element = pool.alloc_temporary(Value::Int(1)).unwrap();
    let array = pool.alloc_temporary(Value::Array(vec![element])).unwrap();
    // The array's reference to its element is released out from under it.
    pool.release_strong(element).unwrap();

    pool.release_strong(array).unwrap();
    assert_eq!(pool.get(array), Err(Fault::ValueFreed));
    assert!(pool.is_empty());
}
