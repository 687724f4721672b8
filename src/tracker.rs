use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::trace;

use crate::models::{Attacker, EntityCategory, EntityCount, Killmail, TrackerInfo};
use crate::universe::{SecurityClass, UniverseResolver, UserStateLookup};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerConfigError {
    #[error("require_max_jumps needs origin_solar_system to be set")]
    MaxJumpsWithoutOrigin,
    #[error("require_max_distance needs origin_solar_system to be set")]
    MaxDistanceWithoutOrigin,
    #[error("exclude_npc_kills and require_npc_kills are mutually exclusive")]
    NpcClausesConflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingType {
    #[default]
    None,
    Here,
    Everybody,
}

/// A named bag of optional filter clauses plus presentation settings. All
/// present clauses must pass for a killmail to match; an absent clause passes
/// trivially. Stored sparsely, so every clause field has a serde default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracker {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    pub webhook_id: u64,

    // Location clauses
    #[serde(default)]
    pub origin_solar_system_id: Option<u32>,
    #[serde(default)]
    pub require_max_jumps: Option<u32>,
    #[serde(default)]
    pub require_max_distance: Option<f64>,
    #[serde(default)]
    pub exclude_high_sec: bool,
    #[serde(default)]
    pub exclude_low_sec: bool,
    #[serde(default)]
    pub exclude_null_sec: bool,
    #[serde(default)]
    pub exclude_w_space: bool,
    #[serde(default)]
    pub require_regions: HashSet<u32>,
    #[serde(default)]
    pub require_constellations: HashSet<u32>,
    #[serde(default)]
    pub require_solar_systems: HashSet<u32>,

    // Organization clauses
    #[serde(default)]
    pub require_attacker_alliances: HashSet<u64>,
    #[serde(default)]
    pub exclude_attacker_alliances: HashSet<u64>,
    #[serde(default)]
    pub require_attacker_corporations: HashSet<u64>,
    #[serde(default)]
    pub exclude_attacker_corporations: HashSet<u64>,
    #[serde(default)]
    pub require_victim_alliances: HashSet<u64>,
    #[serde(default)]
    pub exclude_victim_alliances: HashSet<u64>,
    #[serde(default)]
    pub require_victim_corporations: HashSet<u64>,
    #[serde(default)]
    pub exclude_victim_corporations: HashSet<u64>,
    #[serde(default)]
    pub require_attacker_organizations_final_blow: bool,

    // Auth-state clauses
    #[serde(default)]
    pub require_attacker_states: HashSet<u64>,
    #[serde(default)]
    pub exclude_attacker_states: HashSet<u64>,
    #[serde(default)]
    pub require_victim_states: HashSet<u64>,

    // Ship-class clauses
    #[serde(default)]
    pub require_attackers_ship_groups: HashSet<u32>,
    #[serde(default)]
    pub require_attackers_ship_types: HashSet<u32>,
    #[serde(default)]
    pub require_victim_ship_groups: HashSet<u32>,
    #[serde(default)]
    pub require_victim_ship_types: HashSet<u32>,

    // Volume / value / NPC clauses
    #[serde(default)]
    pub require_min_attackers: Option<u32>,
    #[serde(default)]
    pub require_max_attackers: Option<u32>,
    /// Minimum total value in millions of ISK.
    #[serde(default)]
    pub require_min_value: Option<u64>,
    #[serde(default)]
    pub exclude_npc_kills: bool,
    #[serde(default)]
    pub require_npc_kills: bool,

    // Presentation
    #[serde(default)]
    pub ping_type: PingType,
    #[serde(default)]
    pub ping_groups: HashSet<u64>,
    #[serde(default = "default_true")]
    pub is_posting_name: bool,
    /// Embed color as `#rrggbb`; empty or `#000000` means no color.
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub identify_fleets: bool,
}

fn default_true() -> bool {
    true
}

impl Tracker {
    /// Config-time validation; rejected trackers never reach the evaluator.
    pub fn validate(&self) -> Result<(), TrackerConfigError> {
        if self.require_max_jumps.is_some() && self.origin_solar_system_id.is_none() {
            return Err(TrackerConfigError::MaxJumpsWithoutOrigin);
        }
        if self.require_max_distance.is_some() && self.origin_solar_system_id.is_none() {
            return Err(TrackerConfigError::MaxDistanceWithoutOrigin);
        }
        if self.exclude_npc_kills && self.require_npc_kills {
            return Err(TrackerConfigError::NpcClausesConflict);
        }
        Ok(())
    }

    /// Evaluates this tracker against a killmail. Returns the killmail with
    /// `tracker_info` attached on a match, or `None` on a drop. Resolver
    /// misses fail a "require" clause and pass an "exclude" clause; the
    /// evaluator itself never fails.
    pub async fn process_killmail(
        &self,
        killmail: &Killmail,
        ctx: &EvalContext<'_>,
        ignore_max_age: bool,
    ) -> Option<Killmail> {
        let kill_id = killmail.id;

        if !ignore_max_age && killmail.time.with_timezone(&Utc) < Utc::now() - ctx.killmail_max_age
        {
            trace!("[Kill: {}] Tracker {}: too old", kill_id, self.id);
            return None;
        }

        // 1. Security-class excludes. An unresolvable or absent solar system
        // cannot by itself cause exclusion.
        if self.exclude_high_sec
            || self.exclude_low_sec
            || self.exclude_null_sec
            || self.exclude_w_space
        {
            if let Some(system_id) = killmail.solar_system_id {
                if let Some(system) = ctx.universe.solar_system(system_id).await {
                    let excluded = match system.security_class() {
                        SecurityClass::High => self.exclude_high_sec,
                        SecurityClass::Low => self.exclude_low_sec,
                        SecurityClass::Null => self.exclude_null_sec,
                        SecurityClass::WSpace => self.exclude_w_space,
                        SecurityClass::Unknown => false,
                    };
                    if excluded {
                        trace!(
                            "[Kill: {}] Tracker {}: security class excluded",
                            kill_id,
                            self.id
                        );
                        return None;
                    }
                }
            }
        }

        // 2. Attacker-count bounds.
        let attacker_count = killmail.attackers.len() as u32;
        if let Some(min) = self.require_min_attackers {
            if attacker_count < min {
                trace!("[Kill: {}] Tracker {}: too few attackers", kill_id, self.id);
                return None;
            }
        }
        if let Some(max) = self.require_max_attackers {
            if attacker_count > max {
                trace!("[Kill: {}] Tracker {}: too many attackers", kill_id, self.id);
                return None;
            }
        }

        // 3. NPC flags.
        if self.exclude_npc_kills && killmail.zkb.is_npc {
            trace!("[Kill: {}] Tracker {}: NPC kill excluded", kill_id, self.id);
            return None;
        }
        if self.require_npc_kills && !killmail.zkb.is_npc {
            trace!("[Kill: {}] Tracker {}: not an NPC kill", kill_id, self.id);
            return None;
        }

        // 4. Minimum value. Configured in millions of ISK; a killmail without
        // a value compares as zero.
        if let Some(min_value) = self.require_min_value {
            if killmail.zkb.total_value_or_zero() < min_value as f64 * 1_000_000.0 {
                trace!("[Kill: {}] Tracker {}: below min value", kill_id, self.id);
                return None;
            }
        }

        // 5. Region / constellation / solar-system membership.
        if !self.require_regions.is_empty()
            || !self.require_constellations.is_empty()
            || !self.require_solar_systems.is_empty()
        {
            let Some(system_id) = killmail.solar_system_id else {
                trace!("[Kill: {}] Tracker {}: no solar system", kill_id, self.id);
                return None;
            };
            let mut member = self.require_solar_systems.contains(&system_id);
            if !member
                && (!self.require_regions.is_empty() || !self.require_constellations.is_empty())
            {
                let Some(system) = ctx.universe.solar_system(system_id).await else {
                    trace!(
                        "[Kill: {}] Tracker {}: unresolvable solar system",
                        kill_id,
                        self.id
                    );
                    return None;
                };
                member = self.require_constellations.contains(&system.constellation_id)
                    || self.require_regions.contains(&system.region_id);
            }
            if !member {
                trace!("[Kill: {}] Tracker {}: outside location sets", kill_id, self.id);
                return None;
            }
        }

        // 6. Distance / jumps from the origin system. Both facts are also
        // computed for display whenever an origin is configured.
        let mut jumps = None;
        let mut distance = None;
        if let Some(origin_id) = self.origin_solar_system_id {
            if let Some(system_id) = killmail.solar_system_id {
                distance = ctx.universe.distance_ly(origin_id, system_id).await;
                jumps = ctx.universe.route_jumps(origin_id, system_id).await;
            }
            if let Some(max_distance) = self.require_max_distance {
                match distance {
                    Some(d) if d <= max_distance => {}
                    _ => {
                        trace!("[Kill: {}] Tracker {}: too distant", kill_id, self.id);
                        return None;
                    }
                }
            }
            if let Some(max_jumps) = self.require_max_jumps {
                match jumps {
                    Some(j) if j <= max_jumps => {}
                    _ => {
                        trace!("[Kill: {}] Tracker {}: too many jumps", kill_id, self.id);
                        return None;
                    }
                }
            }
        }

        // 7. Victim organization filters.
        if !self.require_victim_alliances.is_empty()
            && !killmail
                .victim
                .alliance_id
                .is_some_and(|id| self.require_victim_alliances.contains(&id))
        {
            trace!("[Kill: {}] Tracker {}: victim alliance", kill_id, self.id);
            return None;
        }
        if !self.require_victim_corporations.is_empty()
            && !killmail
                .victim
                .corporation_id
                .is_some_and(|id| self.require_victim_corporations.contains(&id))
        {
            trace!("[Kill: {}] Tracker {}: victim corporation", kill_id, self.id);
            return None;
        }
        if killmail
            .victim
            .alliance_id
            .is_some_and(|id| self.exclude_victim_alliances.contains(&id))
        {
            trace!("[Kill: {}] Tracker {}: victim alliance excluded", kill_id, self.id);
            return None;
        }
        if killmail
            .victim
            .corporation_id
            .is_some_and(|id| self.exclude_victim_corporations.contains(&id))
        {
            trace!(
                "[Kill: {}] Tracker {}: victim corporation excluded",
                kill_id,
                self.id
            );
            return None;
        }

        // 8. Attacker organization filters.
        let attacker_alliances = killmail.attackers_distinct_alliance_ids();
        let attacker_corporations = killmail.attackers_distinct_corporation_ids();
        if attacker_alliances
            .iter()
            .any(|id| self.exclude_attacker_alliances.contains(id))
        {
            trace!(
                "[Kill: {}] Tracker {}: attacker alliance excluded",
                kill_id,
                self.id
            );
            return None;
        }
        if attacker_corporations
            .iter()
            .any(|id| self.exclude_attacker_corporations.contains(id))
        {
            trace!(
                "[Kill: {}] Tracker {}: attacker corporation excluded",
                kill_id,
                self.id
            );
            return None;
        }
        if !self.require_attacker_alliances.is_empty()
            && !attacker_alliances
                .iter()
                .any(|id| self.require_attacker_alliances.contains(id))
        {
            trace!("[Kill: {}] Tracker {}: attacker alliances", kill_id, self.id);
            return None;
        }
        if !self.require_attacker_corporations.is_empty()
            && !attacker_corporations
                .iter()
                .any(|id| self.require_attacker_corporations.contains(id))
        {
            trace!(
                "[Kill: {}] Tracker {}: attacker corporations",
                kill_id,
                self.id
            );
            return None;
        }
        // The final-blow attacker must belong to at least one of the two
        // configured org sets (OR across the dimensions, not AND).
        if self.require_attacker_organizations_final_blow
            && (!self.require_attacker_alliances.is_empty()
                || !self.require_attacker_corporations.is_empty())
        {
            let final_blow_in_orgs = killmail.attackers.iter().any(|a| {
                a.is_final_blow
                    && (a
                        .alliance_id
                        .is_some_and(|id| self.require_attacker_alliances.contains(&id))
                        || a.corporation_id
                            .is_some_and(|id| self.require_attacker_corporations.contains(&id)))
            });
            if !final_blow_in_orgs {
                trace!(
                    "[Kill: {}] Tracker {}: final blow outside required orgs",
                    kill_id,
                    self.id
                );
                return None;
            }
        }

        // 9. Victim ship class.
        if !self.require_victim_ship_groups.is_empty() {
            let group_id = match killmail.victim.ship_type_id {
                Some(type_id) => ctx
                    .universe
                    .ship_type(type_id)
                    .await
                    .map(|ship_type| ship_type.group_id),
                None => None,
            };
            if !group_id.is_some_and(|id| self.require_victim_ship_groups.contains(&id)) {
                trace!("[Kill: {}] Tracker {}: victim ship group", kill_id, self.id);
                return None;
            }
        }
        if !self.require_victim_ship_types.is_empty()
            && !killmail
                .victim
                .ship_type_id
                .is_some_and(|id| self.require_victim_ship_types.contains(&id))
        {
            trace!("[Kill: {}] Tracker {}: victim ship type", kill_id, self.id);
            return None;
        }

        // 10. Attacker ship class; matched type ids are kept for display.
        let mut matching_ship_type_ids: BTreeSet<u32> = BTreeSet::new();
        if !self.require_attackers_ship_groups.is_empty() {
            let mut matched = false;
            for type_id in killmail.attackers_ship_type_ids() {
                if let Some(ship_type) = ctx.universe.ship_type(type_id).await {
                    if self.require_attackers_ship_groups.contains(&ship_type.group_id) {
                        matching_ship_type_ids.insert(type_id);
                        matched = true;
                    }
                }
            }
            if !matched {
                trace!("[Kill: {}] Tracker {}: attacker ship groups", kill_id, self.id);
                return None;
            }
        }
        if !self.require_attackers_ship_types.is_empty() {
            let matched: Vec<u32> = killmail
                .attackers_ship_type_ids()
                .into_iter()
                .filter(|id| self.require_attackers_ship_types.contains(id))
                .collect();
            if matched.is_empty() {
                trace!("[Kill: {}] Tracker {}: attacker ship types", kill_id, self.id);
                return None;
            }
            matching_ship_type_ids.extend(matched);
        }

        // 11. Auth-state filters. A character without a state mapping never
        // satisfies a "require" clause and never triggers an "exclude".
        let attacker_states: HashSet<u64> = killmail
            .attackers
            .iter()
            .filter_map(|a| a.character_id)
            .filter_map(|id| ctx.user_states.state_of(id))
            .collect();
        if !self.require_attacker_states.is_empty()
            && !attacker_states
                .iter()
                .any(|state| self.require_attacker_states.contains(state))
        {
            trace!("[Kill: {}] Tracker {}: attacker states", kill_id, self.id);
            return None;
        }
        if attacker_states
            .iter()
            .any(|state| self.exclude_attacker_states.contains(state))
        {
            trace!("[Kill: {}] Tracker {}: attacker state excluded", kill_id, self.id);
            return None;
        }
        if !self.require_victim_states.is_empty() {
            let victim_state = killmail
                .victim
                .character_id
                .and_then(|id| ctx.user_states.state_of(id));
            if !victim_state.is_some_and(|state| self.require_victim_states.contains(&state)) {
                trace!("[Kill: {}] Tracker {}: victim state", kill_id, self.id);
                return None;
            }
        }

        let tracker_info = TrackerInfo {
            tracker_id: self.id,
            jumps,
            distance,
            main_org: main_org(&killmail.attackers),
            main_ship_group: main_ship_group(ctx.universe, &killmail.attackers).await,
            matching_ship_type_ids: matching_ship_type_ids.into_iter().collect(),
            is_fleet_kill: self.identify_fleets && attacker_count >= ctx.fleet_threshold,
        };

        let mut matched = killmail.clone();
        matched.tracker_info = Some(tracker_info);
        Some(matched)
    }
}

/// Everything the evaluator needs besides the tracker and the killmail.
pub struct EvalContext<'a> {
    pub universe: &'a UniverseResolver,
    pub user_states: &'a UserStateLookup,
    pub killmail_max_age: Duration,
    pub fleet_threshold: u32,
}

/// Majority count: the candidate with the highest count wins if it reaches
/// `ceil(n / 2)`. Killmails with fewer than two attackers have no majority.
/// Ties break on the lowest id so the result is deterministic.
fn majority<I: Iterator<Item = u64>>(ids: I, attacker_count: usize) -> Option<(u64, u32)> {
    if attacker_count < 2 {
        return None;
    }
    let threshold = ((attacker_count + 1) / 2) as u32;
    let mut counts: HashMap<u64, u32> = HashMap::new();
    for id in ids {
        *counts.entry(id).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .filter(|(_, count)| *count >= threshold)
        .map(|(id, count)| (id, count))
}

/// The largest-count organization among attackers: alliances first, then
/// corporations. Faction-only NPC attackers contribute to neither.
fn main_org(attackers: &[Attacker]) -> Option<EntityCount> {
    let count = attackers.len();
    if let Some((id, n)) = majority(attackers.iter().filter_map(|a| a.alliance_id), count) {
        return Some(EntityCount {
            id,
            category: EntityCategory::Alliance,
            name: None,
            count: n,
        });
    }
    majority(attackers.iter().filter_map(|a| a.corporation_id), count).map(|(id, n)| EntityCount {
        id,
        category: EntityCategory::Corporation,
        name: None,
        count: n,
    })
}

/// The most common ship group among attackers, resolved to its display name.
async fn main_ship_group(
    universe: &UniverseResolver,
    attackers: &[Attacker],
) -> Option<EntityCount> {
    let mut groups: Vec<(u32, String)> = Vec::new();
    for attacker in attackers {
        if let Some(type_id) = attacker.ship_type_id {
            if let Some(ship_type) = universe.ship_type(type_id).await {
                groups.push((ship_type.group_id, ship_type.group_name.clone()));
            }
        }
    }
    let names: HashMap<u64, String> = groups
        .iter()
        .map(|(id, name)| (u64::from(*id), name.clone()))
        .collect();
    majority(groups.iter().map(|(id, _)| u64::from(*id)), attackers.len()).map(|(id, n)| {
        EntityCount {
            id,
            category: EntityCategory::InventoryGroup,
            name: names.get(&id).cloned(),
            count: n,
        }
    })
}
