//! Object arena and pin tokens.

use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use inet_util::InetAddress;
use tracing::debug;

use super::kind::{ObjectClass, ObjectId, ObjectKind, ZoneId};
use super::object::ManagedObject;
use crate::config::PollIntervals;

/// Counted reference to a managed object.
///
/// Creating a pin increments the object's pin count and dropping it
/// decrements the count, so every path out of a task (normal return, early
/// error, cancellation, panic unwind) releases exactly once.
pub struct ObjectPin {
    object: Arc<ManagedObject>,
}

impl ObjectPin {
    fn new(object: Arc<ManagedObject>) -> Self {
        object.pins.fetch_add(1, Ordering::AcqRel);
        Self { object }
    }

    pub fn object(&self) -> &Arc<ManagedObject> {
        &self.object
    }
}

impl Deref for ObjectPin {
    type Target = ManagedObject;

    fn deref(&self) -> &Self::Target {
        &self.object
    }
}

impl Clone for ObjectPin {
    fn clone(&self) -> Self {
        Self::new(self.object.clone())
    }
}

impl Drop for ObjectPin {
    fn drop(&mut self) {
        self.object.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ObjectPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObjectPin").field(&self.object.id()).finish()
    }
}

/// Arena of all managed objects, keyed by id.
pub struct ObjectIndex {
    objects: DashMap<ObjectId, Arc<ManagedObject>>,
    next_id: AtomicU32,
    intervals: PollIntervals,
}

impl Default for ObjectIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self::with_intervals(PollIntervals::default())
    }

    /// Index whose new objects use the given poll intervals.
    pub fn with_intervals(intervals: PollIntervals) -> Self {
        Self {
            objects: DashMap::new(),
            next_id: AtomicU32::new(1),
            intervals,
        }
    }

    pub fn intervals(&self) -> &PollIntervals {
        &self.intervals
    }

    /// Create and insert an object with a freshly allocated id.
    pub fn create(&self, name: impl Into<String>, kind: ObjectKind) -> Arc<ManagedObject> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let object = Arc::new(ManagedObject::new(id, name, kind, &self.intervals));
        self.objects.insert(id, object.clone());
        debug!(object_id = id, name = object.name(), class = %object.class(), "Object created");
        object
    }

    /// Insert an object built elsewhere (e.g. loaded from storage).
    pub fn insert(&self, object: ManagedObject) -> Arc<ManagedObject> {
        let id = object.id();
        self.next_id.fetch_max(id.saturating_add(1), Ordering::AcqRel);
        let object = Arc::new(object);
        self.objects.insert(id, object.clone());
        object
    }

    /// Remove an object. Outstanding pins keep it alive but it is marked
    /// deleted so no new work is admitted for it.
    pub fn remove(&self, id: ObjectId) -> Option<Arc<ManagedObject>> {
        let (_, object) = self.objects.remove(&id)?;
        object.mark_deleted();
        debug!(object_id = id, pins = object.pin_count(), "Object removed");
        Some(object)
    }

    pub fn get(&self, id: ObjectId) -> Option<Arc<ManagedObject>> {
        self.objects.get(&id).map(|e| e.value().clone())
    }

    /// Pin a live object by id.
    pub fn checkout(&self, id: ObjectId) -> Option<ObjectPin> {
        self.get(id)
            .filter(|o| !o.is_deleted())
            .map(ObjectPin::new)
    }

    /// Pin an object already in hand.
    pub fn pin(&self, object: &Arc<ManagedObject>) -> ObjectPin {
        ObjectPin::new(object.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All objects ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<ManagedObject>> {
        let mut objects: Vec<_> = self.objects.iter().map(|e| e.value().clone()).collect();
        objects.sort_by_key(|o| o.id());
        objects
    }

    pub fn objects_of(&self, class: ObjectClass) -> Vec<Arc<ManagedObject>> {
        let mut objects: Vec<_> = self
            .objects
            .iter()
            .filter(|e| e.value().class() == class)
            .map(|e| e.value().clone())
            .collect();
        objects.sort_by_key(|o| o.id());
        objects
    }

    pub fn nodes(&self) -> Vec<Arc<ManagedObject>> {
        self.objects_of(ObjectClass::Node)
    }

    /// Live objects that own data collection items, ordered by id.
    pub fn data_collection_targets(&self) -> Vec<Arc<ManagedObject>> {
        let mut objects: Vec<_> = self
            .objects
            .iter()
            .filter(|e| {
                let object = e.value();
                object.class().is_data_collection_target() && !object.is_deleted()
            })
            .map(|e| e.value().clone())
            .collect();
        objects.sort_by_key(|o| o.id());
        objects
    }

    /// Node owning `ip` in `zone`.
    pub fn find_node_by_ip(&self, zone: ZoneId, ip: IpAddr) -> Option<Arc<ManagedObject>> {
        self.objects
            .iter()
            .filter(|e| !e.value().is_deleted())
            .find(|e| {
                e.value()
                    .with_node(|n| n.zone == zone && n.has_address(ip))
                    .unwrap_or(false)
            })
            .map(|e| e.value().clone())
    }

    /// Whether `ip` is a resource address of a cluster in `zone`.
    pub fn is_cluster_address(&self, zone: ZoneId, ip: IpAddr) -> bool {
        self.objects.iter().any(|e| {
            e.value().with_kind(|k| match k {
                ObjectKind::Cluster(c) => c.zone == zone && c.resource_addresses.contains(&ip),
                _ => false,
            })
        })
    }

    /// Network of the subnet object in `zone` enclosing `ip`.
    ///
    /// When subnets overlap the most specific one wins.
    pub fn find_subnet(&self, zone: ZoneId, ip: IpAddr) -> Option<InetAddress> {
        self.objects
            .iter()
            .filter_map(|e| {
                e.value().with_kind(|k| match k {
                    ObjectKind::Subnet(s) if s.zone == zone && s.network.contains(ip) => {
                        Some(s.network)
                    }
                    _ => None,
                })
            })
            .max_by_key(|net| net.mask_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ClusterData, Interface, NodeData, SubnetData};

    #[test]
    fn test_pin_counts() {
        let index = ObjectIndex::new();
        let obj = index.create("n1", ObjectKind::Node(NodeData::new(0)));
        assert_eq!(obj.pin_count(), 0);

        let pin = index.checkout(obj.id()).unwrap();
        let second = pin.clone();
        assert_eq!(obj.pin_count(), 2);
        drop(pin);
        drop(second);
        assert_eq!(obj.pin_count(), 0);
    }

    #[test]
    fn test_removed_object_not_checked_out() {
        let index = ObjectIndex::new();
        let obj = index.create("n1", ObjectKind::Node(NodeData::new(0)));
        let pin = index.pin(&obj);

        index.remove(obj.id());
        assert!(obj.is_deleted());
        assert!(index.checkout(obj.id()).is_none());
        // existing pins stay valid
        assert_eq!(pin.name(), "n1");
    }

    #[test]
    fn test_find_node_by_ip_respects_zone() {
        let index = ObjectIndex::new();
        let node = NodeData::new(0).with_interface(
            Interface::new(1, "eth0").with_address("10.0.0.1/24".parse().unwrap()),
        );
        let obj = index.create("n1", ObjectKind::Node(node));

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(index.find_node_by_ip(0, ip).map(|o| o.id()), Some(obj.id()));
        assert!(index.find_node_by_ip(5, ip).is_none());
    }

    #[test]
    fn test_cluster_and_subnet_lookup() {
        let index = ObjectIndex::new();
        index.create(
            "cluster",
            ObjectKind::Cluster(ClusterData {
                zone: 0,
                resource_addresses: vec!["10.0.0.100".parse().unwrap()],
                members: vec![],
            }),
        );
        index.create(
            "wide",
            ObjectKind::Subnet(SubnetData {
                zone: 0,
                network: "10.0.0.0/16".parse().unwrap(),
            }),
        );
        index.create(
            "narrow",
            ObjectKind::Subnet(SubnetData {
                zone: 0,
                network: "10.0.0.0/24".parse().unwrap(),
            }),
        );

        assert!(index.is_cluster_address(0, "10.0.0.100".parse().unwrap()));
        assert!(!index.is_cluster_address(0, "10.0.0.101".parse().unwrap()));
        let subnet = index.find_subnet(0, "10.0.0.7".parse().unwrap()).unwrap();
        assert_eq!(subnet.mask_bits(), 24);
        assert!(index.find_subnet(0, "192.168.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_insert_advances_id_allocation() {
        let index = ObjectIndex::new();
        index.insert(ManagedObject::new(
            40,
            "loaded",
            ObjectKind::Condition,
            &PollIntervals::default(),
        ));
        let created = index.create("new", ObjectKind::Condition);
        assert_eq!(created.id(), 41);
    }
}
