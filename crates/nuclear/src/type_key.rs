//! Opaque type identity, used for message routing and sync-group keys.
//!
//! The bus and the sync-group registry both need to route by "type" at
//! runtime, not just at compile time. [`TypeKey`] wraps `std::any::TypeId`
//! for that purpose, matching the way [`crate::object_pool::ObjectPool`]
//! already keys its internal slab map.
//!
//! Network routing additionally needs a *stable* 64-bit hash that two
//! processes can agree on without sharing a `TypeId` (which is only stable
//! within one compiled binary). [`type_hash`] provides that by hashing the
//! type's fully qualified name with FNV-1a.

use std::any::TypeId;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TypeKey(TypeId);

impl TypeKey {
    pub fn of<T: 'static>() -> Self {
        TypeKey(TypeId::of::<T>())
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 64-bit hash of a type's name, used as the wire `type_hash` in
/// §4.6/§6. Stable across processes running the same binary/crate version;
/// *not* stable across Rust compiler versions since `type_name` is not a
/// guaranteed ABI, which is an accepted limitation of a `TypeId`-free wire
/// format (see DESIGN.md).
pub fn type_hash<T: 'static>() -> u64 {
    fnv1a(std::any::type_name::<T>().as_bytes())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Foo;
    struct Bar;

    #[test]
    fn distinct_types_get_distinct_keys() {
        assert_ne!(TypeKey::of::<Foo>(), TypeKey::of::<Bar>());
        assert_eq!(TypeKey::of::<Foo>(), TypeKey::of::<Foo>());
    }

    #[test]
    fn type_hash_is_stable_within_process() {
        assert_eq!(type_hash::<Foo>(), type_hash::<Foo>());
        assert_ne!(type_hash::<Foo>(), type_hash::<Bar>());
    }
}
