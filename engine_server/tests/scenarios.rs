// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end scenarios driving a composed engine through the bus
//! interfaces with a manual clock, the way a gateway would.

use core_protocol::bus::{local_channel, BusError, EventSink, LocalSender};
use core_protocol::event::{InboundEvent, InterEngineEvent, OutboundEvent};
use core_protocol::id::{EngineId, LeaseId, MobId, RoomId, SessionId, TemplateKey, ZoneId};
use engine_server::combat;
use engine_server::config::EngineConfig;
use engine_server::context::{Context, NullSink};
use engine_server::engine::Engine;
use engine_server::location::LocationIndex;
use engine_server::login::InlineLogin;
use engine_server::persistence::{InlineSaves, MemoryRecordRepo, SaveCoalescer};
use engine_server::zone::ZoneRepo;
use server_util::broker::{KvStore, MemoryKvStore};
use std::sync::{Arc, Mutex};
use world::source::demo_world;

const TICK_MS: u64 = 100;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<OutboundEvent>>>);

impl EventSink<OutboundEvent> for Captured {
    fn publish(&self, event: OutboundEvent) -> Result<(), BusError> {
        self.0.lock().unwrap().push(event);
        Ok(())
    }
}

impl Captured {
    fn take(&self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.0.lock().unwrap())
    }

    fn lines_for(&self, session_id: SessionId) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::SendText {
                    session_id: sid,
                    text,
                    ..
                } if *sid == session_id => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn prompt_count_for(&self, session_id: SessionId) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                matches!(e, OutboundEvent::SendPrompt { session_id: sid } if *sid == session_id)
            })
            .count()
    }

    fn redirects(&self) -> Vec<(SessionId, EngineId)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::SessionRedirect { session_id, engine } => {
                    Some((*session_id, *engine))
                }
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    engine: Engine,
    inbound: LocalSender<InboundEvent>,
    captured: Captured,
    now: u64,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    // Scenario arithmetic assumes no charisma adjustment.
    config.charisma_xp_bonus_per_point = 0.0;
    config
}

impl Harness {
    fn standalone() -> Self {
        let engine_id = EngineId::new(1).unwrap();
        let content = Arc::new(demo_world());
        let (inbound, inbound_rx) = local_channel::<InboundEvent>(16_384);
        let captured = Captured::default();
        let repo = Arc::new(MemoryRecordRepo::new());

        let config = test_config();
        let mut zones = ZoneRepo::new(None, 80, 20, 30_000, 120_000);
        for zone in content.zones() {
            zones.assign(zone, engine_id, 1_000);
        }

        let ctx = Context::new(
            engine_id,
            config,
            Arc::clone(&content),
            zones,
            LocationIndex::new(None),
            Box::new(InlineLogin {
                repo: repo.clone(),
                inbound: inbound.clone(),
                starting_room: content.starting_room.clone().unwrap(),
            }),
            SaveCoalescer::new(Box::new(InlineSaves(repo)), 1_000),
            Box::new(captured.clone()),
            Box::new(NullSink),
        );
        let mut engine = Engine::new(ctx, inbound_rx, None);
        engine.populate();
        Self {
            engine,
            inbound,
            captured,
            now: 0,
        }
    }

    /// Owns only the hub; the forest's engine exists in the zone map but
    /// its bus goes nowhere.
    fn hub_only_with_unreachable_forest() -> Self {
        let engine_id = EngineId::new(1).unwrap();
        let content = Arc::new(demo_world().restricted_to(&[ZoneId::new("hub")]));
        let (inbound, inbound_rx) = local_channel::<InboundEvent>(16_384);
        let captured = Captured::default();
        let repo = Arc::new(MemoryRecordRepo::new());

        let mut zones = ZoneRepo::new(None, 80, 20, 30_000, 120_000);
        zones.assign(ZoneId::new("hub"), engine_id, 1_000);
        zones.declare_remote(ZoneId::new("forest"), EngineId::new(2).unwrap());

        let ctx = Context::new(
            engine_id,
            test_config(),
            Arc::clone(&content),
            zones,
            LocationIndex::new(None),
            Box::new(InlineLogin {
                repo: repo.clone(),
                inbound: inbound.clone(),
                starting_room: content.starting_room.clone().unwrap(),
            }),
            SaveCoalescer::new(Box::new(InlineSaves(repo)), 1_000),
            Box::new(captured.clone()),
            Box::new(NullSink),
        );
        let mut engine = Engine::new(ctx, inbound_rx, None);
        engine.populate();
        Self {
            engine,
            inbound,
            captured,
            now: 0,
        }
    }

    fn tick(&mut self) {
        self.now += TICK_MS;
        self.engine.tick(self.now);
    }

    fn advance(&mut self, ms: u64) {
        for _ in 0..(ms / TICK_MS) {
            self.tick();
        }
    }

    fn send(&mut self, event: InboundEvent) {
        self.inbound.publish(event).unwrap();
    }

    fn line(&mut self, session_id: SessionId, text: &str) {
        self.send(InboundEvent::LineReceived {
            session_id,
            line: text.to_owned(),
        });
    }

    fn login(&mut self, n: u16, name: &str) -> SessionId {
        let session_id = SessionId::compose(1_000, LeaseId::default(), n).unwrap();
        self.send(InboundEvent::Connected {
            session_id,
            gateway: None,
            ansi: Some(true),
        });
        self.tick();
        self.line(session_id, name);
        self.tick();
        assert!(
            self.engine.ctx.players.contains(session_id),
            "{} failed to log in",
            name
        );
        session_id
    }
}

fn plaza() -> RoomId {
    RoomId::new("hub", "plaza")
}

fn rat_in(harness: &Harness, room: &RoomId) -> Option<MobId> {
    harness.engine.ctx.mobs.find_in_room(room, "rat")
}

#[test]
fn s1_one_on_one_kill() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    harness.captured.take();

    harness.line(alice, "kill rat");
    harness.advance(2_000);

    let lines = harness.captured.lines_for(alice);
    assert!(
        lines.iter().any(|l| l == "You attack a cellar rat."),
        "missing attack line: {:?}",
        lines
    );
    let hits = lines
        .iter()
        .filter(|l| l.starts_with("You hit a cellar rat"))
        .count();
    assert!(hits >= 1 && hits <= 3, "expected 1..=3 hits, saw {}", hits);
    assert!(lines.iter().any(|l| l == "a cellar rat dies."));
    assert!(lines.iter().any(|l| l.starts_with("You gain ") && l.ends_with(" XP.")));

    assert!(harness.engine.ctx.combat.target_of(alice).is_none());
    assert!(rat_in(&harness, &plaza()).is_none(), "rat should be gone");
    assert_eq!(harness.engine.ctx.combat.active_mob_count(), 0);
}

#[test]
fn s2_group_xp_split() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    let bob = harness.login(2, "Bob");

    harness.line(alice, "group invite bob");
    harness.tick();
    harness.line(bob, "group accept");
    harness.tick();
    assert!(harness.engine.ctx.groups.are_grouped(alice, bob));
    harness.captured.take();

    // Rat is worth 100 XP; a pair splits 50 each, +10% fighting together.
    harness.line(alice, "kill rat");
    harness.advance(2_000);

    let alice_lines = harness.captured.lines_for(alice);
    let bob_lines = harness.captured.lines_for(bob);
    assert!(
        alice_lines.iter().any(|l| l == "You gain 55 XP."),
        "alice: {:?}",
        alice_lines
    );
    assert!(
        bob_lines.iter().any(|l| l == "You gain 55 XP."),
        "bob: {:?}",
        bob_lines
    );
}

#[test]
fn s3_flee_clears_threat_and_retargets() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    let bob = harness.login(2, "Bob");

    // A sturdier sparring partner than the rat.
    let wolf_template = harness
        .engine
        .ctx
        .content
        .mob_templates
        .get(&TemplateKey::new("grey-wolf"))
        .unwrap()
        .clone();
    let wolf = harness.engine.ctx.mobs.spawn(&wolf_template, plaza());
    // Enough health that nobody lands a killing blow mid-scenario.
    if let Some(mob) = harness.engine.ctx.mobs.get_mut(&wolf) {
        mob.hp = 500;
        mob.max_hp = 500;
    }

    harness.line(alice, "kill wolf");
    harness.tick();
    harness.line(bob, "kill wolf");
    harness.tick();
    // Bob out-threatens alice decisively.
    harness.engine.ctx.threat.add(&wolf, bob, 1_000.0);
    assert_eq!(
        harness.engine.ctx.threat.top(&wolf, |_| true),
        Some(bob)
    );

    harness.line(bob, "flee");
    harness.tick();
    let bob_lines = harness.captured.lines_for(bob);
    assert!(
        bob_lines.iter().any(|l| l == "You flee from a grey wolf!"),
        "bob: {:?}",
        bob_lines
    );
    assert!(harness.engine.ctx.combat.target_of(bob).is_none());
    assert!(!harness.engine.ctx.threat.has_threat_from(&wolf, bob));

    harness.captured.take();
    // The next strikes go for alice, the only remaining threat.
    harness.advance(1_000);
    let bob_hits = harness
        .captured
        .lines_for(bob)
        .iter()
        .filter(|l| l.starts_with("a grey wolf hits you"))
        .count();
    let alice_hits = harness
        .captured
        .lines_for(alice)
        .iter()
        .filter(|l| l.starts_with("a grey wolf hits you"))
        .count();
    assert_eq!(bob_hits, 0, "wolf must not strike the fled bob");
    assert!(alice_hits >= 1, "wolf should be striking alice");
}

#[test]
fn s6_prompt_coalescing() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    harness.captured.take();

    // Three subsystems worth of prompt requests in one tick.
    harness.line(alice, "look");
    harness.line(alice, "score");
    harness.line(alice, "who");
    harness.tick();

    assert_eq!(harness.captured.prompt_count_for(alice), 1);
}

#[test]
fn combat_roundtrip_with_vanished_opponent() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    let rat = rat_in(&harness, &plaza()).unwrap();

    harness.line(alice, "kill rat");
    harness.tick();
    assert!(harness.engine.ctx.combat.is_engaged(alice));

    // The rat is whisked elsewhere before the next swing.
    harness
        .engine
        .ctx
        .mobs
        .move_to(&rat, RoomId::new("hub", "cellar"))
        .unwrap();
    harness.captured.take();
    harness.advance(1_000);

    let gone_lines = harness
        .captured
        .lines_for(alice)
        .iter()
        .filter(|l| *l == "Your opponent is no longer here.")
        .count();
    assert_eq!(gone_lines, 1, "exactly one notice expected");
    assert!(harness.engine.ctx.combat.target_of(alice).is_none());
    assert!(!harness.engine.ctx.threat.has_threat_from(&rat, alice));
}

#[test]
fn flood_does_not_skip_simulation() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    harness.captured.take();

    // Sustained pressure far beyond one tick's worth of input.
    for _ in 0..5_000 {
        let _ = harness.inbound.publish(InboundEvent::LineReceived {
            session_id: alice,
            line: "look".to_owned(),
        });
    }
    // Regen and the scheduler still run while the backlog drains: a due
    // announcement must fire on the very next tick.
    harness.engine.ctx.scheduler.schedule(
        harness.now + TICK_MS,
        engine_server::scheduler::ActionKind::Announce {
            room: plaza(),
            text: "The fountain gurgles.".to_owned(),
        },
    );
    harness.tick();

    let lines = harness.captured.lines_for(alice);
    assert!(
        lines.iter().any(|l| l == "The fountain gurgles."),
        "scheduler starved by inbound flood"
    );
}

#[test]
fn healing_threat_stays_in_room() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    let bob = harness.login(2, "Bob");
    harness.line(alice, "group invite bob");
    harness.tick();
    harness.line(bob, "group accept");
    harness.tick();

    // A durable opponent, so the fight outlives the scenario.
    let wolf_template = harness
        .engine
        .ctx
        .content
        .mob_templates
        .get(&TemplateKey::new("grey-wolf"))
        .unwrap()
        .clone();
    let wolf = harness.engine.ctx.mobs.spawn(&wolf_template, plaza());
    harness.line(alice, "kill wolf");
    harness.tick();
    assert!(harness.engine.ctx.threat.has_threat_from(&wolf, alice));

    // Bob heals from another room: no aggro may leak across rooms.
    harness.line(bob, "down");
    harness.tick();
    if let Some(player) = harness.engine.ctx.players.get_mut(bob) {
        player.hp -= 6;
    }
    combat::heal_player(&mut harness.engine.ctx, harness.now, bob, 3, Some(bob));
    assert!(!harness.engine.ctx.threat.has_threat_from(&wolf, bob));

    // Back in the room, the same heal draws threat.
    harness.line(bob, "up");
    harness.tick();
    combat::heal_player(&mut harness.engine.ctx, harness.now, bob, 3, Some(bob));
    assert!(harness.engine.ctx.threat.has_threat_from(&wolf, bob));
}

#[test]
fn ability_gates_and_casting() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    harness.captured.take();

    // Level gate: War Cry needs level 3, fresh warriors are level 1.
    harness.line(alice, "cast war");
    harness.tick();
    assert!(harness
        .captured
        .lines_for(alice)
        .iter()
        .any(|l| l == "War Cry requires level 3."));

    let mana_before = harness.engine.ctx.players.get(alice).unwrap().mana;
    harness.line(alice, "cast bash rat");
    harness.tick();
    let lines = harness.captured.lines_for(alice);
    assert!(
        lines.iter().any(|l| l.starts_with("Your Bash hits a cellar rat")),
        "{:?}",
        lines
    );
    // Bash one-shots the rat; the uniform death path fires.
    assert!(lines.iter().any(|l| l == "a cellar rat dies."));
    assert_eq!(
        harness.engine.ctx.players.get(alice).unwrap().mana,
        mana_before - 4
    );

    // Cooldown gate holds even with no target left.
    harness.line(alice, "cast bash rat");
    harness.tick();
    assert!(harness
        .captured
        .lines_for(alice)
        .iter()
        .any(|l| l == "Bash is not ready yet."));
}

#[test]
fn disconnect_cleans_threat_groups_and_location() {
    let mut harness = Harness::standalone();
    let alice = harness.login(1, "Alice");
    let bob = harness.login(2, "Bob");
    harness.line(alice, "group invite bob");
    harness.tick();
    harness.line(bob, "group accept");
    harness.tick();

    let rat = rat_in(&harness, &plaza()).unwrap();
    harness.line(alice, "kill rat");
    harness.tick();
    assert!(harness.engine.ctx.threat.has_threat_from(&rat, alice));

    harness.send(InboundEvent::Disconnected {
        session_id: alice,
        reason: core_protocol::event::DisconnectReason::ClientQuit,
    });
    harness.tick();

    assert!(!harness.engine.ctx.players.contains(alice));
    assert!(!harness.engine.ctx.threat.has_threat_from(&rat, alice));
    // Uncontested, the rat stands down.
    assert!(!harness.engine.ctx.threat.has_entry(&rat));
    assert_eq!(harness.engine.ctx.combat.active_mob_count(), 0);
    // The pair dissolved under two members.
    assert!(harness.engine.ctx.groups.group_of(bob).is_none());
    assert_eq!(harness.engine.ctx.location.lookup("alice"), None);
    assert!(harness
        .captured
        .lines_for(bob)
        .iter()
        .any(|l| l == "Your group has disbanded."));
}

/// Two engines wired back to back over local channels.
struct Pair {
    a: Engine,
    b: Engine,
    a_inbound: LocalSender<InboundEvent>,
    a_captured: Captured,
    b_captured: Captured,
    now: u64,
}

fn split_engines() -> Pair {
    let engine_a = EngineId::new(1).unwrap();
    let engine_b = EngineId::new(2).unwrap();
    let content = demo_world();
    let store = MemoryKvStore::new();

    let (a_inbound, a_inbound_rx) = local_channel::<InboundEvent>(4_096);
    let (b_inbound, b_inbound_rx) = local_channel::<InboundEvent>(4_096);
    let (a_inter_tx, a_inter_rx) = local_channel::<InterEngineEvent>(4_096);
    let (b_inter_tx, b_inter_rx) = local_channel::<InterEngineEvent>(4_096);

    let a_captured = Captured::default();
    let b_captured = Captured::default();
    let repo = Arc::new(MemoryRecordRepo::new());

    let hub = ZoneId::new("hub");
    let forest = ZoneId::new("forest");

    let mut a_zones = ZoneRepo::new(None, 80, 20, 30_000, 120_000);
    a_zones.assign(hub.clone(), engine_a, 1_000);
    a_zones.declare_remote(forest.clone(), engine_b);
    let mut b_zones = ZoneRepo::new(None, 80, 20, 30_000, 120_000);
    b_zones.assign(forest, engine_b, 1_000);
    b_zones.declare_remote(hub, engine_a);

    let a_content = Arc::new(content.restricted_to(&[ZoneId::new("hub")]));
    let b_content = Arc::new(content.restricted_to(&[ZoneId::new("forest")]));

    let a_ctx = Context::new(
        engine_a,
        test_config(),
        Arc::clone(&a_content),
        a_zones,
        LocationIndex::new(Some(store.clone() as Arc<dyn KvStore>)),
        Box::new(InlineLogin {
            repo: repo.clone(),
            inbound: a_inbound.clone(),
            starting_room: a_content.starting_room.clone().unwrap(),
        }),
        SaveCoalescer::new(Box::new(InlineSaves(repo.clone())), 1_000),
        Box::new(a_captured.clone()),
        // A's inter-engine traffic lands in B's queue.
        Box::new(b_inter_tx),
    );
    let b_ctx = Context::new(
        engine_b,
        test_config(),
        Arc::clone(&b_content),
        b_zones,
        LocationIndex::new(Some(store as Arc<dyn KvStore>)),
        Box::new(InlineLogin {
            repo: repo.clone(),
            inbound: b_inbound,
            starting_room: RoomId::new("forest", "edge"),
        }),
        SaveCoalescer::new(Box::new(InlineSaves(repo)), 1_000),
        Box::new(b_captured.clone()),
        Box::new(a_inter_tx),
    );

    let mut a = Engine::new(a_ctx, a_inbound_rx, Some(a_inter_rx));
    let mut b = Engine::new(b_ctx, b_inbound_rx, Some(b_inter_rx));
    a.populate();
    b.populate();

    Pair {
        a,
        b,
        a_inbound,
        a_captured,
        b_captured,
        now: 0,
    }
}

impl Pair {
    fn tick_both(&mut self) {
        self.now += TICK_MS;
        self.a.tick(self.now);
        self.b.tick(self.now);
    }

    fn login_on_a(&mut self, n: u16, name: &str) -> SessionId {
        let session_id = SessionId::compose(1_000, LeaseId::default(), n).unwrap();
        self.a_inbound
            .publish(InboundEvent::Connected {
                session_id,
                gateway: None,
                ansi: Some(true),
            })
            .unwrap();
        self.tick_both();
        self.a_inbound
            .publish(InboundEvent::LineReceived {
                session_id,
                line: name.to_owned(),
            })
            .unwrap();
        self.tick_both();
        assert!(self.a.ctx.players.contains(session_id));
        session_id
    }
}

#[test]
fn s4_handoff_success() {
    let mut pair = split_engines();
    let alice = pair.login_on_a(1, "Alice");

    // Walk to the gate, then across the zone boundary.
    pair.a_inbound
        .publish(InboundEvent::LineReceived {
            session_id: alice,
            line: "north".to_owned(),
        })
        .unwrap();
    pair.tick_both();
    pair.a_captured.take();
    pair.b_captured.take();

    pair.a_inbound
        .publish(InboundEvent::LineReceived {
            session_id: alice,
            line: "north".to_owned(),
        })
        .unwrap();
    // Prepare -> ack -> commit needs a few exchanges.
    for _ in 0..4 {
        pair.tick_both();
    }

    assert!(
        !pair.a.ctx.players.contains(alice),
        "alice should have left engine 1"
    );
    assert!(
        pair.b.ctx.players.contains(alice),
        "alice should live on engine 2"
    );
    assert_eq!(
        pair.b.ctx.players.get(alice).unwrap().room_id,
        RoomId::new("forest", "edge")
    );
    // Same session id, rerouted rather than reconnected.
    assert_eq!(
        pair.a_captured.redirects(),
        vec![(alice, EngineId::new(2).unwrap())]
    );
    // The location index now points at engine 2.
    assert_eq!(
        pair.b.ctx.location.lookup("alice"),
        Some(EngineId::new(2).unwrap())
    );
    // Arrival narration includes the destination room.
    let b_lines = pair.b_captured.lines_for(alice);
    assert!(
        b_lines.iter().any(|l| l == "Forest Edge"),
        "alice should see the new room: {:?}",
        b_lines
    );
}

#[test]
fn s5_handoff_timeout_rolls_back() {
    // Hub engine only; the forest belongs to an engine that never answers.
    let mut harness = Harness::hub_only_with_unreachable_forest();
    let alice = harness.login(1, "Alice");

    harness.line(alice, "north");
    harness.tick();
    let gate = RoomId::new("hub", "gate");
    assert_eq!(harness.engine.ctx.players.get(alice).unwrap().room_id, gate);
    let hp_before = harness.engine.ctx.players.get(alice).unwrap().hp;
    harness.captured.take();

    harness.line(alice, "north");
    harness.tick();
    assert!(harness.engine.ctx.players.get(alice).unwrap().in_handoff);
    // Frozen mid-transfer: commands are refused.
    harness.line(alice, "south");
    harness.tick();
    assert!(harness
        .captured
        .lines_for(alice)
        .iter()
        .any(|l| l == "You are between worlds and cannot act."));

    // No ack ever arrives; the timeout restores the player in place.
    harness.advance(2_500);
    let lines = harness.captured.lines_for(alice);
    assert!(
        lines.iter().any(|l| l == "The way is blocked."),
        "missing rollback message: {:?}",
        lines
    );
    let player = harness.engine.ctx.players.get(alice).unwrap();
    assert!(!player.in_handoff);
    assert_eq!(player.room_id, gate);
    assert_eq!(player.hp, hp_before);
    assert_eq!(harness.engine.ctx.handoff.outgoing_len(), 0);
}
