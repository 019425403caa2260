use crate::cache::{AccessoryCache, CacheError};
use crate::platform_accessory::PlatformAccessory;
use crate::protocol::AccessoryFactory;
use bridgehost_core::PluginIdentifier;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("accessory {uuid} is already registered")]
    DuplicateUuid { uuid: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// The accessories one bridge publishes, persisted to that bridge's cache partition.
///
/// Only the host mutates this set. Every change is written to the cache
/// first and applied in memory only once the write succeeded, so a failed
/// call leaves the set as it was.
pub struct AccessoryRegistry {
    cache: AccessoryCache,
    factory: Arc<dyn AccessoryFactory>,
    accessories: Vec<PlatformAccessory>,
}

impl AccessoryRegistry {
    pub fn new(cache: AccessoryCache, factory: Arc<dyn AccessoryFactory>) -> Self {
        Self {
            cache,
            factory,
            accessories: Vec::new(),
        }
    }

    /// Replace the in-memory set with what the cache holds.
    pub fn restore(&mut self) -> Result<usize, RegistryError> {
        let records = self.cache.load()?;
        self.accessories = records
            .iter()
            .filter_map(
                |record| match PlatformAccessory::deserialize(record, self.factory.as_ref()) {
                    Ok(accessory) => Some(accessory),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            uuid = %record.accessory.uuid,
                            "dropping cached accessory that could not be restored"
                        );
                        None
                    }
                },
            )
            .collect();
        tracing::info!(
            accessories = self.accessories.len(),
            path = %self.cache.path().display(),
            "restored cached accessories"
        );
        Ok(self.accessories.len())
    }

    /// Add platform accessories, filling in the plugin/platform association.
    ///
    /// Fails without changing anything if any UUID is already present or the
    /// cache cannot be written.
    pub fn register(
        &mut self,
        plugin: &PluginIdentifier,
        platform: &str,
        mut accessories: Vec<PlatformAccessory>,
    ) -> Result<(), RegistryError> {
        let mut seen: HashSet<&str> = self.accessories.iter().map(|a| a.uuid()).collect();
        for accessory in &accessories {
            if !seen.insert(accessory.uuid()) {
                return Err(RegistryError::DuplicateUuid {
                    uuid: accessory.uuid().to_string(),
                });
            }
        }

        for accessory in &mut accessories {
            if accessory.associated_plugin().is_none() || accessory.associated_platform().is_none() {
                accessory.associate(plugin.clone(), Some(platform.to_string()));
            }
        }

        let staged: Vec<_> = self
            .accessories
            .iter()
            .chain(&accessories)
            .map(PlatformAccessory::serialize)
            .collect();
        self.cache.save(&staged)?;

        for accessory in accessories {
            tracing::debug!(
                uuid = %accessory.uuid(),
                name = %accessory.display_name(),
                plugin = %plugin,
                platform,
                "registered platform accessory"
            );
            self.accessories.push(accessory);
        }
        Ok(())
    }

    /// Swap in new state for accessories that are already registered.
    pub fn update(&mut self, accessories: Vec<PlatformAccessory>) -> Result<(), RegistryError> {
        let mut replacements = Vec::with_capacity(accessories.len());
        for accessory in accessories {
            match self
                .accessories
                .iter()
                .position(|existing| existing.uuid() == accessory.uuid())
            {
                Some(index) => replacements.push((index, accessory)),
                None => tracing::warn!(
                    uuid = %accessory.uuid(),
                    "ignoring update for unregistered accessory"
                ),
            }
        }

        let staged: Vec<_> = self
            .accessories
            .iter()
            .enumerate()
            .map(|(index, existing)| {
                replacements
                    .iter()
                    .rev()
                    .find(|(slot, _)| *slot == index)
                    .map_or(existing, |(_, replacement)| replacement)
                    .serialize()
            })
            .collect();
        self.cache.save(&staged)?;

        for (index, accessory) in replacements {
            self.accessories[index] = accessory;
        }
        Ok(())
    }

    /// Remove accessories by UUID and return them.
    pub fn unregister(&mut self, uuids: &[String]) -> Result<Vec<PlatformAccessory>, RegistryError> {
        let wanted: HashSet<&str> = uuids.iter().map(String::as_str).collect();
        let removed = self.remove_where(|accessory| wanted.contains(accessory.uuid()))?;

        if removed.len() != wanted.len() {
            tracing::warn!(
                requested = wanted.len(),
                removed = removed.len(),
                "some accessories to unregister were not registered"
            );
        }
        Ok(removed)
    }

    /// Drop accessories nobody claims, unless `keep_orphans` is set.
    ///
    /// `is_claimed` decides whether a loaded platform still owns an accessory.
    pub fn prune_orphans<F>(
        &mut self,
        is_claimed: F,
        keep_orphans: bool,
    ) -> Result<Vec<PlatformAccessory>, RegistryError>
    where
        F: Fn(&PlatformAccessory) -> bool,
    {
        let orphaned = |accessory: &PlatformAccessory| !is_claimed(accessory);

        if keep_orphans {
            for accessory in self.accessories.iter().filter(|a| orphaned(*a)) {
                tracing::warn!(
                    uuid = %accessory.uuid(),
                    name = %accessory.display_name(),
                    "keeping cached accessory that no loaded platform claims"
                );
            }
            return Ok(Vec::new());
        }

        if !self.accessories.iter().any(orphaned) {
            return Ok(Vec::new());
        }
        let removed = self.remove_where(orphaned)?;

        for accessory in &removed {
            tracing::info!(
                uuid = %accessory.uuid(),
                name = %accessory.display_name(),
                plugin = ?accessory.associated_plugin().map(PluginIdentifier::as_str),
                "removing orphaned cached accessory"
            );
        }
        Ok(removed)
    }

    pub fn get(&self, uuid: &str) -> Option<&PlatformAccessory> {
        self.accessories.iter().find(|a| a.uuid() == uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut PlatformAccessory> {
        self.accessories.iter_mut().find(|a| a.uuid() == uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlatformAccessory> {
        self.accessories.iter()
    }

    /// Accessories belonging to one platform of one plugin.
    pub fn for_platform_mut<'a>(
        &'a mut self,
        plugin: &'a PluginIdentifier,
        platform: &'a str,
    ) -> impl Iterator<Item = &'a mut PlatformAccessory> + 'a {
        self.accessories.iter_mut().filter(move |a| {
            a.associated_plugin() == Some(plugin) && a.associated_platform() == Some(platform)
        })
    }

    pub fn len(&self) -> usize {
        self.accessories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessories.is_empty()
    }

    pub fn cache(&self) -> &AccessoryCache {
        &self.cache
    }

    /// Persist the set without the matching accessories, then drop them from memory.
    fn remove_where<F>(&mut self, matches: F) -> Result<Vec<PlatformAccessory>, RegistryError>
    where
        F: Fn(&PlatformAccessory) -> bool,
    {
        let staged: Vec<_> = self
            .accessories
            .iter()
            .filter(|accessory| !matches(accessory))
            .map(PlatformAccessory::serialize)
            .collect();
        self.cache.save(&staged)?;

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.accessories)
            .into_iter()
            .partition(|accessory| matches(accessory));
        self.accessories = kept;
        Ok(removed)
    }

    pub fn save(&self) -> Result<(), CacheError> {
        let records: Vec<_> = self.accessories.iter().map(PlatformAccessory::serialize).collect();
        self.cache.save(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::generate_uuid;
    use crate::local::LocalAccessoryFactory;
    use tempfile::tempdir;

    fn plugin(name: &str) -> PluginIdentifier {
        PluginIdentifier::parse(name).unwrap()
    }

    fn accessory(name: &str) -> PlatformAccessory {
        PlatformAccessory::new(&LocalAccessoryFactory, name, &generate_uuid(name), None).unwrap()
    }

    fn open_registry(dir: &std::path::Path) -> AccessoryRegistry {
        AccessoryRegistry::new(
            AccessoryCache::main_bridge(dir),
            Arc::new(LocalAccessoryFactory),
        )
    }

    #[test]
    fn register_fills_associations_and_persists() {
        let dir = tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        registry
            .register(&plugin("homebridge-a"), "PlatformA", vec![accessory("one")])
            .unwrap();

        let stored = registry.get(&generate_uuid("one")).unwrap();
        assert_eq!(stored.associated_plugin(), Some(&plugin("homebridge-a")));
        assert_eq!(stored.associated_platform(), Some("PlatformA"));

        let mut reloaded = open_registry(dir.path());
        assert_eq!(reloaded.restore().unwrap(), 1);
    }

    #[test]
    fn duplicate_uuid_rejected_without_changes() {
        let dir = tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let id = plugin("homebridge-a");
        registry.register(&id, "P", vec![accessory("one")]).unwrap();

        let err = registry
            .register(&id, "P", vec![accessory("two"), accessory("one")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateUuid { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_replaces_existing() {
        let dir = tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let id = plugin("homebridge-a");
        registry.register(&id, "P", vec![accessory("one")]).unwrap();

        let mut changed = accessory("one");
        changed.associate(id.clone(), Some("P".into()));
        changed
            .context_mut()
            .insert("on".into(), serde_json::Value::Bool(true));
        registry.update(vec![changed, accessory("stranger")]).unwrap();

        assert_eq!(registry.len(), 1);
        let stored = registry.get(&generate_uuid("one")).unwrap();
        assert_eq!(stored.context()["on"], serde_json::Value::Bool(true));
    }

    #[test]
    fn unregister_removes_and_persists() {
        let dir = tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let id = plugin("homebridge-a");
        registry
            .register(&id, "P", vec![accessory("one"), accessory("two")])
            .unwrap();

        let removed = registry.unregister(&[generate_uuid("one")]).unwrap();
        assert_eq!(removed.len(), 1);

        let mut reloaded = open_registry(dir.path());
        reloaded.restore().unwrap();
        assert!(reloaded.get(&generate_uuid("one")).is_none());
        assert!(reloaded.get(&generate_uuid("two")).is_some());
    }

    #[test]
    fn prune_orphans_respects_keep_flag() {
        let dir = tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        registry
            .register(&plugin("homebridge-a"), "P", vec![accessory("kept")])
            .unwrap();
        registry
            .register(&plugin("homebridge-gone"), "P", vec![accessory("orphan")])
            .unwrap();

        let loaded = |a: &PlatformAccessory| {
            a.associated_plugin()
                .is_some_and(|id| id.as_str() == "homebridge-a")
        };
        assert!(registry.prune_orphans(loaded, true).unwrap().is_empty());
        assert_eq!(registry.len(), 2);

        let removed = registry.prune_orphans(loaded, false).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].display_name(), "orphan");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failed_writes_leave_memory_untouched() {
        let dir = tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let id = plugin("homebridge-a");
        registry.register(&id, "P", vec![accessory("one")]).unwrap();

        let blocker = dir.path().join("cachedAccessories.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let err = registry
            .register(&id, "P", vec![accessory("two")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::Cache(_)));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&generate_uuid("two")).is_none());

        let mut changed = accessory("one");
        changed.context_mut().insert("on".into(), serde_json::Value::Bool(true));
        assert!(registry.update(vec![changed]).is_err());
        assert!(registry.get(&generate_uuid("one")).unwrap().context().is_empty());

        assert!(registry.unregister(&[generate_uuid("one")]).is_err());
        assert_eq!(registry.len(), 1);

        std::fs::remove_dir(&blocker).unwrap();
        registry.register(&id, "P", vec![accessory("two")]).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn for_platform_filters_by_owner() {
        let dir = tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let id = plugin("homebridge-a");
        registry.register(&id, "P1", vec![accessory("one")]).unwrap();
        registry.register(&id, "P2", vec![accessory("two")]).unwrap();

        let names: Vec<_> = registry
            .for_platform_mut(&id, "P2")
            .map(|a| a.display_name().to_string())
            .collect();
        assert_eq!(names, vec!["two".to_string()]);
    }
}
