// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

/// Engine tunables. Defaults are the shipped balance; the binary overrides
/// them from flags. Everything is plain data so tests can construct exact
/// configurations.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub tick_period_ms: u64,
    /// Wall-clock budget for draining the inbound bus each tick.
    pub inbound_budget_ms: u64,
    /// Consecutive overruns before the degradation signal fires.
    pub degraded_threshold: u32,

    /// Cadence of swings and mob strikes once engaged.
    pub combat_period_ms: u64,
    /// Combined per-tick cap across the player and mob combat phases.
    pub max_combats_per_tick: usize,
    /// Unarmed damage roll; weapons add their attack bonus on top.
    pub player_min_damage: i32,
    pub player_max_damage: i32,
    /// Damage bonus is (total strength - baseline) / divisor.
    pub strength_divisor: i32,
    pub stat_baseline: i32,
    /// Dodge percent per point of dexterity above baseline.
    pub dodge_pct_per_dex: f64,
    pub max_dodge_pct: f64,
    pub healing_threat_multiplier: f64,

    pub group_xp_bonus_per_member: f64,
    pub charisma_xp_bonus_per_point: f64,
    pub max_group_size: usize,
    pub invite_ttl_ms: u64,

    pub hp_regen_base_ms: u64,
    pub hp_regen_ms_per_con: u64,
    pub hp_regen_min_ms: u64,
    pub hp_regen_amount: i32,
    pub mana_regen_ms: u64,
    pub mana_regen_amount: i32,
    pub max_regens_per_tick: usize,

    pub scheduler_max_per_tick: usize,

    pub handoff_ack_timeout_ms: u64,

    /// Envelope freshness window for authenticated bus messages.
    pub envelope_max_skew_ms: u64,

    pub scale_high_water: u32,
    pub scale_low_water: u32,
    pub scale_sustain_ms: u64,
    pub scale_cooldown_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            inbound_budget_ms: 30,
            degraded_threshold: 10,

            combat_period_ms: 333,
            max_combats_per_tick: 200,
            player_min_damage: 1,
            player_max_damage: 4,
            strength_divisor: 2,
            stat_baseline: 10,
            dodge_pct_per_dex: 2.0,
            max_dodge_pct: 40.0,
            healing_threat_multiplier: 0.5,

            group_xp_bonus_per_member: 0.10,
            charisma_xp_bonus_per_point: 0.01,
            max_group_size: 5,
            invite_ttl_ms: 30_000,

            hp_regen_base_ms: 8_000,
            hp_regen_ms_per_con: 200,
            hp_regen_min_ms: 2_000,
            hp_regen_amount: 2,
            mana_regen_ms: 5_000,
            mana_regen_amount: 3,
            max_regens_per_tick: 500,

            scheduler_max_per_tick: 64,

            handoff_ack_timeout_ms: 2_000,

            envelope_max_skew_ms: 15_000,

            scale_high_water: 80,
            scale_low_water: 20,
            scale_sustain_ms: 30_000,
            scale_cooldown_ms: 120_000,
        }
    }
}
