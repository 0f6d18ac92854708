//! Shared schema types for killfeed.
//!
//! This crate defines the domain model (killmails and their participants) and
//! the wire schema (`api`) used across the workspace and re-exports both as a
//! single public surface. Everything here is plain data: no I/O, no clocks.

pub mod api;

pub use api::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifier of a killmail. Positive and unique; doubles as the dedup key.
pub type KillmailId = u64;

/// Identifier of a solar system, the primary partition dimension.
pub type SystemId = u64;

/// Identifier of a character.
pub type CharacterId = u64;

/// Monotonic sequence assigned by the event store on insert.
pub type Sequence = u64;

/// A single ship destruction, immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Killmail {
    pub id: KillmailId,
    pub kill_time: DateTime<Utc>,
    pub system_id: SystemId,
    pub victim: Victim,
    pub attackers: Vec<Attacker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zkb: Option<ZkbMetadata>,
    /// False when one or more name lookups failed; the event is stored anyway.
    pub enrichment_complete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Victim {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<CharacterId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<u64>,
    pub ship_type_id: u64,
    pub damage_taken: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corporation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alliance_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ship_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attacker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<CharacterId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corporation_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alliance_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ship_type_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weapon_type_id: Option<u64>,
    pub damage_done: u64,
    pub final_blow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corporation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alliance_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ship_name: Option<String>,
}

/// Metadata attached by the upstream killboard. The aliases accept the
/// camelCase names the upstream queue emits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ZkbMetadata {
    pub hash: String,
    #[serde(default, alias = "totalValue")]
    pub total_value: f64,
    #[serde(default)]
    pub points: u32,
    #[serde(default)]
    pub npc: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default)]
    pub awox: bool,
    #[serde(skip_serializing_if = "Option::is_none", alias = "locationID")]
    pub location_id: Option<u64>,
}

impl Killmail {
    /// All character ids appearing in the event (victim plus attackers),
    /// de-duplicated, order unspecified.
    pub fn character_ids(&self) -> Vec<CharacterId> {
        let mut seen = HashSet::with_capacity(self.attackers.len() + 1);
        if let Some(id) = self.victim.character_id {
            seen.insert(id);
        }
        for attacker in &self.attackers {
            if let Some(id) = attacker.character_id {
                seen.insert(id);
            }
        }
        seen.into_iter().collect()
    }

    /// A victim without a character id is an NPC structure or drone.
    pub fn is_npc_victim(&self) -> bool {
        self.victim.character_id.is_none()
    }

    /// Holds iff exactly one attacker carries the final blow (vacuously true
    /// for NPC events with no attackers).
    pub fn final_blow_consistent(&self) -> bool {
        if self.attackers.is_empty() {
            return true;
        }
        self.attackers.iter().filter(|a| a.final_blow).count() == 1
    }
}

/// A killmail as stored: its global sequence plus the partition it belongs to.
/// The store hands out shared copies; serialization happens at the API edge
/// via [`api::KillmailEnvelope`].
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub sequence: Sequence,
    pub system_id: SystemId,
    pub killmail: std::sync::Arc<Killmail>,
}
