use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed upstream package: {0}")]
    MalformedUpstream(String),
    #[error("killmail JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Categories used by the entity resolver and for counted entities in
/// [`TrackerInfo`]. Serialized in lowercase to match the ESI name service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Alliance,
    Character,
    Constellation,
    Corporation,
    Faction,
    InventoryType,
    InventoryGroup,
    Region,
    SolarSystem,
    Station,
    #[serde(other)]
    Other,
}

impl EntityCategory {
    /// zKillboard URL path for this category, if it has a page there.
    pub fn zkb_path(&self) -> Option<&'static str> {
        match self {
            EntityCategory::Alliance => Some("alliance"),
            EntityCategory::Character => Some("character"),
            EntityCategory::Corporation => Some("corporation"),
            EntityCategory::Region => Some("region"),
            EntityCategory::SolarSystem => Some("system"),
            _ => None,
        }
    }
}

/// An organization or ship group counted across a killmail's attackers,
/// e.g. "alliance 3001 appears 3 times".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCount {
    pub id: u64,
    pub category: EntityCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub count: u32,
}

/// Annotation attached to a killmail that survived a tracker's evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerInfo {
    pub tracker_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jumps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_org: Option<EntityCount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_ship_group: Option<EntityCount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matching_ship_type_ids: Vec<u32>,
    #[serde(default)]
    pub is_fleet_kill: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Victim {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_type_id: Option<u32>,
    #[serde(default)]
    pub damage_taken: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attacker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_type_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weapon_type_id: Option<u32>,
    #[serde(default)]
    pub damage_done: u64,
    #[serde(default)]
    pub security_status: f64,
    #[serde(default)]
    pub is_final_blow: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Source-side metadata from the zkb aggregator. All values may be absent
/// upstream; comparisons treat a missing value as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZkbMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fitted_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i64>,
    #[serde(default)]
    pub is_npc: bool,
    #[serde(default)]
    pub is_solo: bool,
    #[serde(default)]
    pub is_awox: bool,
}

impl ZkbMeta {
    pub fn total_value_or_zero(&self) -> f64 {
        self.total_value.unwrap_or(0.0)
    }
}

/// Immutable record of one combat event. This is the canonical form passed
/// between pipeline stages as JSON; every stage re-parses its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Killmail {
    pub id: i64,
    pub time: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solar_system_id: Option<u32>,
    pub victim: Victim,
    pub attackers: Vec<Attacker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub zkb: ZkbMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_info: Option<TrackerInfo>,
}

impl Killmail {
    pub fn from_package(package: Package) -> Result<Self, CodecError> {
        let time = DateTime::parse_from_rfc3339(&package.killmail.killmail_time).map_err(|e| {
            CodecError::MalformedUpstream(format!(
                "bad killmail_time '{}': {}",
                package.killmail.killmail_time, e
            ))
        })?;
        if package.killmail.attackers.is_empty() {
            return Err(CodecError::MalformedUpstream(format!(
                "killmail {} has no attackers",
                package.killmail.killmail_id
            )));
        }

        let wire = package.killmail;
        let victim = Victim {
            character_id: wire.victim.character_id,
            corporation_id: wire.victim.corporation_id,
            alliance_id: wire.victim.alliance_id,
            faction_id: wire.victim.faction_id,
            ship_type_id: wire.victim.ship_type_id,
            damage_taken: wire.victim.damage_taken,
        };
        let attackers = wire
            .attackers
            .into_iter()
            .map(|a| Attacker {
                character_id: a.character_id,
                corporation_id: a.corporation_id,
                alliance_id: a.alliance_id,
                faction_id: a.faction_id,
                ship_type_id: a.ship_type_id,
                weapon_type_id: a.weapon_type_id,
                damage_done: a.damage_done,
                security_status: a.security_status,
                is_final_blow: a.final_blow,
            })
            .collect();
        let zkb = package
            .zkb
            .map(|z| ZkbMeta {
                location_id: z.location_id,
                hash: z.hash,
                fitted_value: z.fitted_value,
                total_value: z.total_value,
                points: z.points,
                is_npc: z.npc,
                is_solo: z.solo,
                is_awox: z.awox,
            })
            .unwrap_or_default();

        Ok(Killmail {
            id: wire.killmail_id,
            time,
            solar_system_id: wire.solar_system_id,
            victim,
            attackers,
            position: wire.victim.position,
            zkb,
            tracker_info: None,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("killmail serialization is infallible")
    }

    /// All character/corporation/alliance/faction/type/system ids referenced
    /// by this killmail. Used to bulk-warm the resolvers before rendering.
    pub fn entity_ids(&self) -> HashSet<u64> {
        let mut ids: Vec<Option<u64>> = vec![
            self.victim.character_id,
            self.victim.corporation_id,
            self.victim.alliance_id,
            self.victim.faction_id,
            self.victim.ship_type_id.map(u64::from),
            self.solar_system_id.map(u64::from),
        ];
        for attacker in &self.attackers {
            ids.extend([
                attacker.character_id,
                attacker.corporation_id,
                attacker.alliance_id,
                attacker.faction_id,
                attacker.ship_type_id.map(u64::from),
                attacker.weapon_type_id.map(u64::from),
            ]);
        }
        ids.into_iter().flatten().collect()
    }

    pub fn attackers_distinct_alliance_ids(&self) -> HashSet<u64> {
        self.attackers.iter().filter_map(|a| a.alliance_id).collect()
    }

    pub fn attackers_distinct_corporation_ids(&self) -> HashSet<u64> {
        self.attackers
            .iter()
            .filter_map(|a| a.corporation_id)
            .collect()
    }

    pub fn attackers_ship_type_ids(&self) -> HashSet<u32> {
        self.attackers
            .iter()
            .filter_map(|a| a.ship_type_id)
            .collect()
    }

    pub fn final_blow_attacker(&self) -> Option<&Attacker> {
        self.attackers.iter().find(|a| a.is_final_blow)
    }
}

// --- Upstream wire format ---
//
// The RedisQ package nests `{killID, killmail, zkb}` and mixes snake_case
// (ESI killmail body) with camelCase (zkb metadata). Unknown keys are
// ignored on deserialization.

#[derive(Debug, Deserialize)]
pub struct RedisQResponse {
    #[serde(default)]
    pub package: Option<Package>,
}

#[derive(Debug, Deserialize)]
pub struct Package {
    #[serde(rename = "killID")]
    pub kill_id: i64,
    pub killmail: WireKillmail,
    #[serde(default)]
    pub zkb: Option<WireZkb>,
}

#[derive(Debug, Deserialize)]
pub struct WireKillmail {
    pub killmail_id: i64,
    pub killmail_time: String,
    #[serde(default)]
    pub solar_system_id: Option<u32>,
    pub victim: WireVictim,
    #[serde(default)]
    pub attackers: Vec<WireAttacker>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireVictim {
    #[serde(default)]
    pub character_id: Option<u64>,
    #[serde(default)]
    pub corporation_id: Option<u64>,
    #[serde(default)]
    pub alliance_id: Option<u64>,
    #[serde(default)]
    pub faction_id: Option<u64>,
    #[serde(default)]
    pub ship_type_id: Option<u32>,
    #[serde(default)]
    pub damage_taken: u64,
    #[serde(default)]
    pub position: Option<Position>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireAttacker {
    #[serde(default)]
    pub character_id: Option<u64>,
    #[serde(default)]
    pub corporation_id: Option<u64>,
    #[serde(default)]
    pub alliance_id: Option<u64>,
    #[serde(default)]
    pub faction_id: Option<u64>,
    #[serde(default)]
    pub ship_type_id: Option<u32>,
    #[serde(default)]
    pub weapon_type_id: Option<u32>,
    #[serde(default)]
    pub damage_done: u64,
    #[serde(default)]
    pub security_status: f64,
    #[serde(default)]
    pub final_blow: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireZkb {
    #[serde(default, rename = "locationID")]
    pub location_id: Option<u64>,
    #[serde(default)]
    pub hash: String,
    #[serde(default, rename = "fittedValue")]
    pub fitted_value: Option<f64>,
    #[serde(default, rename = "totalValue")]
    pub total_value: Option<f64>,
    #[serde(default)]
    pub points: Option<i64>,
    #[serde(default)]
    pub npc: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default)]
    pub awox: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDISQ_PACKAGE: &str = r#"
    {
        "package": {
            "killID": 128389930,
            "killmail": {
                "attackers": [
                    {
                        "character_id": 90000002,
                        "corporation_id": 2001,
                        "alliance_id": 3001,
                        "damage_done": 856144,
                        "final_blow": true,
                        "security_status": -1.9,
                        "ship_type_id": 34562,
                        "weapon_type_id": 2977
                    }
                ],
                "killmail_id": 128389930,
                "killmail_time": "2025-07-06T23:32:26Z",
                "solar_system_id": 30002539,
                "victim": {
                    "alliance_id": 99009845,
                    "character_id": 2114058087,
                    "corporation_id": 98498670,
                    "damage_taken": 856144,
                    "items": [],
                    "position": {
                        "x": -30420382830.688633,
                        "y": 2662073916.025609,
                        "z": 309569446754.9493
                    },
                    "ship_type_id": 19720
                }
            },
            "zkb": {
                "locationID": 40161548,
                "hash": "d00ad190e832f0ca2965c9946b15527c415a70e7",
                "fittedValue": 5148356869.79,
                "droppedValue": 515470667.87,
                "destroyedValue": 4722688524.39,
                "totalValue": 5238159192.26,
                "points": 1,
                "npc": false,
                "solo": false,
                "awox": false,
                "href": "https://esi.evetech.net/v1/killmails/128389930/d00ad190e832f0ca2965c9946b15527c415a70e7/"
            }
        }
    }"#;

    fn parse_package() -> Killmail {
        let response: RedisQResponse = serde_json::from_str(REDISQ_PACKAGE).unwrap();
        Killmail::from_package(response.package.unwrap()).unwrap()
    }

    #[test]
    fn parses_redisq_package_with_camel_case_zkb_keys() {
        let killmail = parse_package();
        assert_eq!(killmail.id, 128389930);
        assert_eq!(killmail.solar_system_id, Some(30002539));
        assert_eq!(killmail.zkb.location_id, Some(40161548));
        assert_eq!(killmail.zkb.total_value, Some(5238159192.26));
        assert_eq!(killmail.zkb.fitted_value, Some(5148356869.79));
        assert!(!killmail.zkb.is_npc);
        assert_eq!(killmail.victim.ship_type_id, Some(19720));
        assert!(killmail.attackers[0].is_final_blow);
        assert!(killmail.position.is_some());
        assert!(killmail.tracker_info.is_none());
    }

    #[test]
    fn rejects_package_without_attackers() {
        let mut value: serde_json::Value = serde_json::from_str(REDISQ_PACKAGE).unwrap();
        value["package"]["killmail"]["attackers"] = serde_json::json!([]);
        let response: RedisQResponse = serde_json::from_value(value).unwrap();
        let result = Killmail::from_package(response.package.unwrap());
        assert!(matches!(result, Err(CodecError::MalformedUpstream(_))));
    }

    #[test]
    fn rejects_package_with_unparseable_time() {
        let mut value: serde_json::Value = serde_json::from_str(REDISQ_PACKAGE).unwrap();
        value["package"]["killmail"]["killmail_time"] = serde_json::json!("not a time");
        let response: RedisQResponse = serde_json::from_value(value).unwrap();
        let result = Killmail::from_package(response.package.unwrap());
        assert!(matches!(result, Err(CodecError::MalformedUpstream(_))));
    }

    #[test]
    fn json_round_trip_preserves_all_fields() {
        let killmail = parse_package();
        let restored = Killmail::from_json(&killmail.to_json()).unwrap();
        assert_eq!(killmail, restored);
    }

    #[test]
    fn json_round_trip_preserves_timezone_offset() {
        let mut killmail = parse_package();
        killmail.time = DateTime::parse_from_rfc3339("2025-07-06T23:32:26+02:00").unwrap();
        let restored = Killmail::from_json(&killmail.to_json()).unwrap();
        assert_eq!(restored.time, killmail.time);
        assert_eq!(restored.time.offset(), killmail.time.offset());
    }

    #[test]
    fn json_round_trip_keeps_tracker_info() {
        let mut killmail = parse_package();
        killmail.tracker_info = Some(TrackerInfo {
            tracker_id: 7,
            jumps: Some(7),
            distance: Some(5.85),
            main_org: Some(EntityCount {
                id: 3001,
                category: EntityCategory::Alliance,
                name: None,
                count: 3,
            }),
            main_ship_group: Some(EntityCount {
                id: 419,
                category: EntityCategory::InventoryGroup,
                name: Some("Combat Battlecruiser".to_string()),
                count: 2,
            }),
            matching_ship_type_ids: vec![34562],
            is_fleet_kill: true,
        });
        let restored = Killmail::from_json(&killmail.to_json()).unwrap();
        assert_eq!(killmail, restored);
    }

    #[test]
    fn entity_ids_collects_victim_attackers_and_system() {
        let killmail = parse_package();
        let ids = killmail.entity_ids();
        for expected in [
            2114058087u64,
            98498670,
            99009845,
            19720,
            30002539,
            90000002,
            2001,
            3001,
            34562,
            2977,
        ] {
            assert!(ids.contains(&expected), "missing id {}", expected);
        }
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn missing_total_value_compares_as_zero() {
        let zkb = ZkbMeta::default();
        assert_eq!(zkb.total_value_or_zero(), 0.0);
    }

    #[test]
    fn empty_package_means_idle_poll() {
        let response: RedisQResponse = serde_json::from_str(r#"{"package": null}"#).unwrap();
        assert!(response.package.is_none());
    }

    #[test]
    fn distinct_attacker_accessors_deduplicate() {
        let mut killmail = parse_package();
        killmail.attackers.push(Attacker {
            alliance_id: Some(3001),
            corporation_id: Some(2001),
            ship_type_id: Some(34562),
            ..Default::default()
        });
        assert_eq!(killmail.attackers_distinct_alliance_ids().len(), 1);
        assert_eq!(killmail.attackers_distinct_corporation_ids().len(), 1);
        assert_eq!(killmail.attackers_ship_type_ids().len(), 1);
    }
}
