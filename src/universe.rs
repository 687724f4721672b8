use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::esi::EsiClient;
use crate::models::EntityCategory;

const LY_PER_M: f64 = 1.0 / 9_460_730_472_580_800.0;

// J-space systems occupy a dedicated id band.
const W_SPACE_ID_RANGE: std::ops::Range<u32> = 31_000_000..32_000_000;

const CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityClass {
    High,
    Low,
    Null,
    WSpace,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolarSystem {
    pub id: u32,
    pub name: String,
    pub security_status: f64,
    pub constellation_id: u32,
    pub region_id: u32,
    pub region_name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SolarSystem {
    pub fn security_class(&self) -> SecurityClass {
        if W_SPACE_ID_RANGE.contains(&self.id) {
            SecurityClass::WSpace
        } else if self.security_status >= 0.45 {
            SecurityClass::High
        } else if self.security_status > 0.0 {
            SecurityClass::Low
        } else {
            SecurityClass::Null
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShipType {
    pub id: u32,
    pub name: String,
    pub group_id: u32,
    pub group_name: String,
    pub category_id: u32,
    pub published: bool,
}

/// Read-through cache over the universe reference data the evaluator and
/// formatter need. A miss that cannot be fetched resolves to `None`; callers
/// treat any location-derived fact as simply absent.
pub struct UniverseResolver {
    esi: EsiClient,
    systems: Cache<u32, Arc<SolarSystem>>,
    types: Cache<u32, Arc<ShipType>>,
    routes: Cache<(u32, u32), Option<u32>>,
}

impl UniverseResolver {
    pub fn new(esi: EsiClient) -> Self {
        UniverseResolver {
            esi,
            systems: Cache::new(CACHE_CAPACITY),
            types: Cache::new(CACHE_CAPACITY),
            routes: Cache::new(CACHE_CAPACITY),
        }
    }

    pub async fn solar_system(&self, system_id: u32) -> Option<Arc<SolarSystem>> {
        if let Some(system) = self.systems.get(&system_id) {
            return Some(system);
        }
        let fetched = self.fetch_solar_system(system_id).await;
        match fetched {
            Ok(system) => {
                let system = Arc::new(system);
                self.systems.insert(system_id, system.clone()).await;
                Some(system)
            }
            Err(e) => {
                warn!("Failed to resolve solar system {}: {}", system_id, e);
                None
            }
        }
    }

    async fn fetch_solar_system(
        &self,
        system_id: u32,
    ) -> Result<SolarSystem, Box<dyn std::error::Error + Send + Sync>> {
        let system = self.esi.get_solar_system(system_id).await?;
        let constellation = self.esi.get_constellation(system.constellation_id).await?;
        let region = self.esi.get_region(constellation.region_id).await?;
        Ok(SolarSystem {
            id: system_id,
            name: system.name,
            security_status: system.security_status,
            constellation_id: system.constellation_id,
            region_id: constellation.region_id,
            region_name: region.name,
            x: system.position.x,
            y: system.position.y,
            z: system.position.z,
        })
    }

    pub async fn ship_type(&self, type_id: u32) -> Option<Arc<ShipType>> {
        if let Some(ship_type) = self.types.get(&type_id) {
            return Some(ship_type);
        }
        let fetched = self.fetch_ship_type(type_id).await;
        match fetched {
            Ok(ship_type) => {
                let ship_type = Arc::new(ship_type);
                self.types.insert(type_id, ship_type.clone()).await;
                Some(ship_type)
            }
            Err(e) => {
                warn!("Failed to resolve type {}: {}", type_id, e);
                None
            }
        }
    }

    async fn fetch_ship_type(
        &self,
        type_id: u32,
    ) -> Result<ShipType, Box<dyn std::error::Error + Send + Sync>> {
        let esi_type = self.esi.get_type(type_id).await?;
        let group = self.esi.get_group(esi_type.group_id).await?;
        Ok(ShipType {
            id: type_id,
            name: esi_type.name,
            group_id: esi_type.group_id,
            group_name: group.name,
            category_id: group.category_id,
            published: esi_type.published,
        })
    }

    /// Shortest-path jump count between two systems, or `None` when either
    /// system is unreachable (wormholes) or the route service is unavailable.
    pub async fn route_jumps(&self, origin_id: u32, destination_id: u32) -> Option<u32> {
        if origin_id == destination_id {
            return Some(0);
        }
        let key = (origin_id, destination_id);
        if let Some(jumps) = self.routes.get(&key) {
            return jumps;
        }
        match self.esi.get_route(origin_id, destination_id).await {
            Ok(route) => {
                let jumps = route.map(|path| (path.len().saturating_sub(1)) as u32);
                self.routes.insert(key, jumps).await;
                jumps
            }
            Err(e) => {
                warn!(
                    "Failed to resolve route {} -> {}: {}",
                    origin_id, destination_id, e
                );
                None
            }
        }
    }

    /// Straight-line distance between two systems in lightyears.
    pub async fn distance_ly(&self, origin_id: u32, destination_id: u32) -> Option<f64> {
        let origin = self.solar_system(origin_id).await?;
        let destination = self.solar_system(destination_id).await?;
        let dx = origin.x - destination.x;
        let dy = origin.y - destination.y;
        let dz = origin.z - destination.z;
        Some((dx * dx + dy * dy + dz * dz).sqrt() * LY_PER_M)
    }

    pub async fn prime_system(&self, system: SolarSystem) {
        self.systems.insert(system.id, Arc::new(system)).await;
    }

    pub async fn prime_ship_type(&self, ship_type: ShipType) {
        self.types.insert(ship_type.id, Arc::new(ship_type)).await;
    }

    pub async fn prime_route(&self, origin_id: u32, destination_id: u32, jumps: Option<u32>) {
        self.routes.insert((origin_id, destination_id), jumps).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntity {
    pub id: u64,
    pub name: String,
    pub category: EntityCategory,
}

impl ResolvedEntity {
    pub fn zkb_url(&self) -> Option<String> {
        self.category
            .zkb_path()
            .map(|path| format!("https://zkillboard.com/{}/{}/", path, self.id))
    }

    /// Markdown link to the entity's zKillboard page, or the plain name when
    /// the category has no page there.
    pub fn zkb_link(&self) -> String {
        match self.zkb_url() {
            Some(url) => format!("[{}]({})", self.name, url),
            None => self.name.clone(),
        }
    }
}

/// Read-through cache over the ESI name service.
pub struct EntityResolver {
    esi: EsiClient,
    entities: Cache<u64, Arc<ResolvedEntity>>,
}

impl EntityResolver {
    pub fn new(esi: EsiClient) -> Self {
        EntityResolver {
            esi,
            entities: Cache::new(CACHE_CAPACITY),
        }
    }

    pub async fn resolve(&self, id: u64) -> Option<Arc<ResolvedEntity>> {
        if let Some(entity) = self.entities.get(&id) {
            return Some(entity);
        }
        self.resolve_missing(&HashSet::from([id])).await;
        self.entities.get(&id)
    }

    /// Bulk-resolves every id not yet cached. The bulk endpoint rejects the
    /// whole request when a single id is unknown, so on failure the ids are
    /// retried one by one and unresolvable ones are skipped.
    pub async fn resolve_missing(&self, ids: &HashSet<u64>) {
        let missing: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| !self.entities.contains_key(id))
            .collect();
        if missing.is_empty() {
            return;
        }
        match self.esi.get_names(&missing).await {
            Ok(names) => {
                for name in names {
                    self.prime(ResolvedEntity {
                        id: name.id,
                        name: name.name,
                        category: name.category,
                    })
                    .await;
                }
            }
            Err(e) => {
                if missing.len() == 1 {
                    warn!("Failed to resolve entity {}: {}", missing[0], e);
                    return;
                }
                warn!(
                    "Bulk name resolution failed for {} ids, retrying individually: {}",
                    missing.len(),
                    e
                );
                for id in missing {
                    if let Ok(names) = self.esi.get_names(&[id]).await {
                        for name in names {
                            self.prime(ResolvedEntity {
                                id: name.id,
                                name: name.name,
                                category: name.category,
                            })
                            .await;
                        }
                    }
                }
            }
        }
    }

    pub async fn name(&self, id: u64) -> Option<String> {
        self.resolve(id).await.map(|e| e.name.clone())
    }

    pub async fn prime(&self, entity: ResolvedEntity) {
        self.entities.insert(entity.id, Arc::new(entity)).await;
    }
}

/// Maps character ids to their auth-state id. Characters without a mapping
/// never satisfy a "require state" clause.
#[derive(Debug, Clone, Default)]
pub struct UserStateLookup {
    states: HashMap<u64, u64>,
}

impl UserStateLookup {
    pub fn from_map(states: HashMap<u64, u64>) -> Self {
        UserStateLookup { states }
    }

    pub fn state_of(&self, character_id: u64) -> Option<u64> {
        self.states.get(&character_id).copied()
    }
}
