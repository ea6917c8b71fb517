use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{CodecError, Result};
use crate::packet::{Packet, PacketId};

type Factory = Box<dyn Fn() -> Box<dyn Packet> + Send + Sync>;

struct Entry {
    name: &'static str,
    factory: Factory,
}

/// Closed mapping between packet types and their wire IDs.
///
/// Built once at startup with [`PacketRegistry::builder`]; after `build` no
/// type can be added, so every decode sees the same set of IDs.
pub struct PacketRegistry {
    by_id: HashMap<PacketId, Entry>,
    by_type: HashMap<TypeId, PacketId>,
}

impl PacketRegistry {
    pub fn builder() -> PacketRegistryBuilder {
        PacketRegistryBuilder {
            registry: Self {
                by_id: HashMap::new(),
                by_type: HashMap::new(),
            },
        }
    }

    /// Instantiate an empty packet for `id`, ready for `read_payload`.
    pub fn create(&self, id: PacketId) -> Option<Box<dyn Packet>> {
        self.by_id.get(&id).map(|entry| (entry.factory)())
    }

    /// Wire ID of the concrete type behind `packet`.
    pub fn id_of(&self, packet: &dyn Packet) -> Option<PacketId> {
        self.by_type.get(&packet.as_any().type_id()).copied()
    }

    /// Wire ID registered for `T`.
    pub fn id_for<T: Packet>(&self) -> Option<PacketId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn name_of(&self, id: PacketId) -> Option<&'static str> {
        self.by_id.get(&id).map(|entry| entry.name)
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Registered IDs in ascending order.
    pub fn ids(&self) -> Vec<PacketId> {
        let mut ids: Vec<_> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for id in self.ids() {
            if let Some(entry) = self.by_id.get(&id) {
                map.entry(&id, &entry.name);
            }
        }
        map.finish()
    }
}

/// Collects registrations and validates that IDs and types are unique.
pub struct PacketRegistryBuilder {
    registry: PacketRegistry,
}

impl PacketRegistryBuilder {
    /// Register `T` under `id`, constructing inbound instances with `T::default()`.
    pub fn register<T: Packet + Default>(self, id: PacketId) -> Result<Self> {
        self.register_with(id, T::default)
    }

    /// Register `T` under `id` with an explicit factory.
    pub fn register_with<T, F>(mut self, id: PacketId, factory: F) -> Result<Self>
    where
        T: Packet,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let name = std::any::type_name::<T>();
        if let Some(existing) = self.registry.by_id.get(&id) {
            return Err(CodecError::DuplicateId {
                id,
                existing: existing.name,
            });
        }
        let type_id = TypeId::of::<T>();
        if self.registry.by_type.contains_key(&type_id) {
            return Err(CodecError::DuplicateType(name));
        }

        debug!(id, packet = name, "registered packet type");
        self.registry.by_type.insert(type_id, id);
        self.registry.by_id.insert(
            id,
            Entry {
                name,
                factory: Box::new(move || Box::new(factory()) as Box<dyn Packet>),
            },
        );
        Ok(self)
    }

    /// Close registration.
    pub fn build(self) -> Arc<PacketRegistry> {
        Arc::new(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{PayloadReader, PayloadWriter};

    #[derive(Debug, Default)]
    struct Alpha;

    #[derive(Debug)]
    struct Beta {
        tag: u8,
    }

    impl Packet for Alpha {
        fn payload_size(&self) -> usize {
            0
        }
        fn write_payload(&self, _out: &mut PayloadWriter<'_>) -> Result<()> {
            Ok(())
        }
        fn read_payload(&mut self, _input: &mut PayloadReader) -> Result<()> {
            Ok(())
        }
    }

    impl Packet for Beta {
        fn payload_size(&self) -> usize {
            1
        }
        fn write_payload(&self, out: &mut PayloadWriter<'_>) -> Result<()> {
            out.put_u8(self.tag);
            Ok(())
        }
        fn read_payload(&mut self, input: &mut PayloadReader) -> Result<()> {
            self.tag = input.get_u8()?;
            Ok(())
        }
    }

    fn registry() -> Arc<PacketRegistry> {
        PacketRegistry::builder()
            .register::<Alpha>(1)
            .unwrap()
            .register_with(7, || Beta { tag: 0xEE })
            .unwrap()
            .build()
    }

    #[test]
    fn test_lookup_both_ways() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_for::<Alpha>(), Some(1));
        assert_eq!(registry.id_for::<Beta>(), Some(7));
        assert_eq!(registry.id_of(&Beta { tag: 1 }), Some(7));
        assert_eq!(registry.ids(), vec![1, 7]);
        assert!(registry.contains(7));
        assert!(!registry.contains(2));
    }

    #[test]
    fn test_factory_creates_concrete_type() {
        let registry = registry();
        let packet = registry.create(7).unwrap();
        assert_eq!(packet.downcast_ref::<Beta>().map(|b| b.tag), Some(0xEE));
        assert!(registry.create(3).is_none());
    }

    #[test]
    fn test_id_of_boxed_packet_uses_concrete_type() {
        let registry = registry();
        let boxed: Box<dyn Packet> = Box::new(Alpha);
        assert_eq!(registry.id_of(boxed.as_ref()), Some(1));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = PacketRegistry::builder()
            .register::<Alpha>(1)
            .unwrap()
            .register_with(1, || Beta { tag: 0 })
            .err()
            .unwrap();
        assert!(matches!(err, CodecError::DuplicateId { id: 1, .. }));
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let err = PacketRegistry::builder()
            .register::<Alpha>(1)
            .unwrap()
            .register::<Alpha>(2)
            .err()
            .unwrap();
        assert!(matches!(err, CodecError::DuplicateType(_)));
    }

    #[test]
    fn test_debug_lists_names() {
        let shown = format!("{:?}", registry());
        assert!(shown.contains("Alpha"));
        assert!(shown.contains("Beta"));
    }
}
