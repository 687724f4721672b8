use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::Killmail;
use crate::tracker::{PingType, Tracker};
use crate::universe::{EntityResolver, UniverseResolver};

pub const ZKB_KILLMAIL_BASE_URL: &str = "https://zkillboard.com/kill/";
const EVE_IMAGESERVER_BASE_URL: &str = "https://images.evetech.net";
const WEBHOOK_USERNAME: &str = "Killtracker";
const WEBHOOK_AVATAR_URL: &str = "https://zkillboard.com/img/wreck.png";
const FOOTER_TEXT: &str = "zKillboard";

/// A ready-to-POST Discord-compatible webhook payload. The queue holds the
/// serialized form of this; no killmail JSON travels past the formatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub title: String,
    pub url: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

pub struct MessageContext<'a> {
    pub universe: &'a UniverseResolver,
    pub entities: &'a EntityResolver,
    /// Chat-group id to Discord role id; groups without a mapping are
    /// silently skipped when building pings.
    pub group_roles: &'a HashMap<u64, u64>,
    pub set_avatar: bool,
}

pub fn type_icon_url(type_id: u32) -> String {
    format!("{}/types/{}/icon?size=64", EVE_IMAGESERVER_BASE_URL, type_id)
}

/// Embed color from a `#rrggbb` tracker setting. Black is the sentinel for
/// "no color selected".
fn parse_color(color: &str) -> Option<u32> {
    let hex = color.strip_prefix('#')?;
    let value = u32::from_str_radix(hex, 16).ok()?;
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

/// Renders a matched killmail into the outbound chat payload for the
/// tracker's webhook.
pub async fn build_killmail_message(
    tracker: &Tracker,
    killmail: &Killmail,
    ctx: &MessageContext<'_>,
    intro_text: Option<&str>,
) -> DiscordMessage {
    ctx.entities.resolve_missing(&killmail.entity_ids()).await;

    let tracker_info = killmail.tracker_info.as_ref();

    let system = match killmail.solar_system_id {
        Some(id) => ctx.universe.solar_system(id).await,
        None => None,
    };
    let system_name = system.as_ref().map(|s| s.name.clone()).unwrap_or_default();
    let system_link = match (&system, killmail.solar_system_id) {
        (Some(system), Some(id)) => format!(
            "[{}](https://zkillboard.com/system/{}/)",
            system.name, id
        ),
        _ => "?".to_string(),
    };

    let victim_ship = match killmail.victim.ship_type_id {
        Some(id) => ctx.universe.ship_type(id).await,
        None => None,
    };
    let victim_ship_name = victim_ship
        .as_ref()
        .map(|s| s.name.clone())
        .unwrap_or_default();

    let victim_link = entity_link(
        ctx,
        killmail.victim.character_id.or(killmail.victim.corporation_id),
    )
    .await;
    let victim_corp_link = entity_link(ctx, killmail.victim.corporation_id).await;
    let victim_name = match killmail.victim.character_id.or(killmail.victim.corporation_id) {
        Some(id) => ctx.entities.name(id).await.unwrap_or_default(),
        None => String::new(),
    };

    let kind = if tracker_info.is_some_and(|info| info.is_fleet_kill) {
        "Fleetkill"
    } else {
        "Killmail"
    };
    let title = format!(
        "{} | {} | {} | {}",
        system_name, victim_ship_name, victim_name, kind
    );

    let value_mio = (killmail.zkb.total_value_or_zero() / 1_000_000.0) as i64;

    let mut description = format!(
        "{} ({}) lost their **{}** in {} worth **{} M** ISK.\n",
        victim_link,
        victim_corp_link,
        or_question_mark(&victim_ship_name),
        system_link,
        value_mio,
    );

    let final_blow = killmail.final_blow_attacker();
    let final_link = entity_link(
        ctx,
        final_blow.and_then(|a| a.character_id.or(a.corporation_id)),
    )
    .await;
    let final_corp_link = entity_link(ctx, final_blow.and_then(|a| a.corporation_id)).await;
    let final_ship_name = match final_blow.and_then(|a| a.ship_type_id) {
        Some(id) => ctx
            .universe
            .ship_type(id)
            .await
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "?".to_string()),
        None => "?".to_string(),
    };
    description.push_str(&format!(
        "Final blow by {} ({}) in a **{}**.\n",
        final_link, final_corp_link, final_ship_name
    ));

    let mut attackers_line = format!("Attackers: {}", killmail.attackers.len());
    if let Some(main_org) = tracker_info.and_then(|info| info.main_org.as_ref()) {
        let org_name = ctx
            .entities
            .name(main_org.id)
            .await
            .unwrap_or_else(|| "?".to_string());
        attackers_line.push_str(&format!(" | Main organization: **{}**", org_name));
    }
    if let Some(group) = tracker_info.and_then(|info| info.main_ship_group.as_ref()) {
        attackers_line.push_str(&format!(
            " | Mostly flying: **{}**",
            group.name.as_deref().unwrap_or("?")
        ));
    }
    description.push_str(&attackers_line);
    description.push('\n');

    if let Some(origin_id) = tracker.origin_solar_system_id {
        let origin_name = ctx
            .universe
            .solar_system(origin_id)
            .await
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "?".to_string());
        let distance = tracker_info
            .and_then(|info| info.distance)
            .map(|d| format!("{:.1}", d))
            .unwrap_or_else(|| "?".to_string());
        let jumps = tracker_info
            .and_then(|info| info.jumps)
            .map(|j| j.to_string())
            .unwrap_or_else(|| "?".to_string());
        description.push_str(&format!(
            "Distance from {}: {} LY | {} jumps\n",
            origin_name, distance, jumps
        ));
    }

    if let Some(info) = tracker_info {
        if !info.matching_ship_type_ids.is_empty() {
            let mut names = Vec::new();
            for type_id in &info.matching_ship_type_ids {
                let name = ctx
                    .universe
                    .ship_type(*type_id)
                    .await
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| type_id.to_string());
                names.push(name);
            }
            description.push_str(&format!("Tracked ship types: {}\n", names.join(", ")));
        }
    }

    let mut content = String::new();
    if let Some(intro) = intro_text {
        content.push_str(intro);
        content.push(' ');
    }
    match tracker.ping_type {
        PingType::None => {}
        PingType::Here => content.push_str("@here "),
        PingType::Everybody => content.push_str("@everybody "),
    }
    let mut group_ids: Vec<u64> = tracker.ping_groups.iter().copied().collect();
    group_ids.sort_unstable();
    for group_id in group_ids {
        if let Some(role_id) = ctx.group_roles.get(&group_id) {
            content.push_str(&format!("<@&{}> ", role_id));
        }
    }
    if tracker.is_posting_name {
        content.push_str(&format!("Tracker **{}**:", tracker.name));
    }
    let content = content.trim_end().to_string();

    let embed = Embed {
        title,
        url: format!("{}{}/", ZKB_KILLMAIL_BASE_URL, killmail.id),
        description,
        thumbnail: killmail
            .victim
            .ship_type_id
            .map(|id| EmbedImage { url: type_icon_url(id) }),
        footer: Some(EmbedFooter {
            text: FOOTER_TEXT.to_string(),
            icon_url: Some(WEBHOOK_AVATAR_URL.to_string()),
        }),
        timestamp: killmail.time.to_rfc3339(),
        color: parse_color(&tracker.color),
    };

    DiscordMessage {
        content,
        username: ctx.set_avatar.then(|| WEBHOOK_USERNAME.to_string()),
        avatar_url: ctx.set_avatar.then(|| WEBHOOK_AVATAR_URL.to_string()),
        embeds: vec![embed],
    }
}

async fn entity_link(ctx: &MessageContext<'_>, id: Option<u64>) -> String {
    match id {
        Some(id) => match ctx.entities.resolve(id).await {
            Some(entity) => entity.zkb_link(),
            None => "?".to_string(),
        },
        None => "?".to_string(),
    }
}

fn or_question_mark(value: &str) -> &str {
    if value.is_empty() {
        "?"
    } else {
        value
    }
}
