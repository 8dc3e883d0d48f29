// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pre-login session tracking and the off-thread login pipeline. The tick
//! thread never touches persistence: it submits a [`LoginRequest`] and keeps
//! ticking; the worker answers with a `LoginCompleted` inbound event carrying
//! the session's epoch, so an answer that raced a disconnect is dropped.

use crate::persistence::{CreateRecord, PersistError, PlayerRecordRepo};
use core_protocol::bus::{EventSink, LocalSender};
use core_protocol::dto::{PlayerClass, Race};
use core_protocol::event::{InboundEvent, LoginOutcome};
use core_protocol::id::{GatewayId, RoomId, SessionId};
use core_protocol::name::PlayerName;
use log::warn;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;

/// A connected session that has not finished logging in.
#[derive(Clone, Debug)]
pub struct LobbySession {
    pub epoch: u32,
    pub ansi: bool,
    pub gateway: Option<GatewayId>,
    /// A lookup is in flight; further lines are ignored until it lands.
    pub pending: bool,
}

#[derive(Default)]
pub struct LoginRepo {
    lobby: HashMap<SessionId, LobbySession>,
    epoch_counter: u32,
}

impl LoginRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, session_id: SessionId, ansi: Option<bool>, gateway: Option<GatewayId>) -> u32 {
        self.epoch_counter = self.epoch_counter.wrapping_add(1);
        let epoch = self.epoch_counter;
        self.lobby.insert(
            session_id,
            LobbySession {
                epoch,
                ansi: ansi.unwrap_or(false),
                gateway,
                pending: false,
            },
        );
        epoch
    }

    pub fn get(&self, session_id: SessionId) -> Option<&LobbySession> {
        self.lobby.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: SessionId) -> Option<&mut LobbySession> {
        self.lobby.get_mut(&session_id)
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.lobby.contains_key(&session_id)
    }

    pub fn remove(&mut self, session_id: SessionId) -> Option<LobbySession> {
        self.lobby.remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.lobby.len()
    }
}

#[derive(Clone, Debug)]
pub struct LoginRequest {
    pub session_id: SessionId,
    pub epoch: u32,
    pub name: PlayerName,
}

/// Where login lookups run. The threaded implementation is the production
/// one; tests use [`InlineLogin`] to stay deterministic.
pub trait LoginDispatcher: Send {
    fn submit(&self, request: LoginRequest);
}

/// Resolution shared by both dispatchers. New names are provisioned with the
/// defaults; richer character creation belongs to the external auth flow.
pub fn resolve(
    repo: &dyn PlayerRecordRepo,
    request: &LoginRequest,
    starting_room: &RoomId,
) -> LoginOutcome {
    match repo.find_by_name(&request.name.canonical()) {
        Ok(Some(record)) => LoginOutcome::Existing(record),
        Ok(None) => match repo.create(CreateRecord {
            name: request.name,
            race: Race::Human,
            class: PlayerClass::Warrior,
            room_id: starting_room.clone(),
        }) {
            Ok(record) => LoginOutcome::Created(record),
            Err(PersistError::NameTaken) => {
                // Lost a create race; re-read.
                match repo.find_by_name(&request.name.canonical()) {
                    Ok(Some(record)) => LoginOutcome::Existing(record),
                    _ => LoginOutcome::Unavailable,
                }
            }
            Err(PersistError::Unavailable) => LoginOutcome::Unavailable,
        },
        Err(_) => LoginOutcome::Unavailable,
    }
}

/// Dedicated worker thread feeding results back through the inbound bus.
pub struct LoginWorker {
    tx: Sender<LoginRequest>,
}

impl LoginWorker {
    pub fn spawn(
        repo: Arc<dyn PlayerRecordRepo>,
        inbound: LocalSender<InboundEvent>,
        starting_room: RoomId,
    ) -> Self {
        let (tx, rx) = channel::<LoginRequest>();
        thread::Builder::new()
            .name("login-worker".to_owned())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let outcome = resolve(repo.as_ref(), &request, &starting_room);
                    let event = InboundEvent::LoginCompleted {
                        session_id: request.session_id,
                        epoch: request.epoch,
                        outcome,
                    };
                    if inbound.publish(event).is_err() {
                        warn!("inbound bus rejected login completion");
                    }
                }
            })
            .expect("failed to spawn login worker");
        Self { tx }
    }
}

impl LoginDispatcher for LoginWorker {
    fn submit(&self, request: LoginRequest) {
        if self.tx.send(request).is_err() {
            warn!("login worker is gone");
        }
    }
}

/// Synchronous dispatcher for tests: resolves immediately on the calling
/// thread and publishes the completion like the worker would.
pub struct InlineLogin {
    pub repo: Arc<dyn PlayerRecordRepo>,
    pub inbound: LocalSender<InboundEvent>,
    pub starting_room: RoomId,
}

impl LoginDispatcher for InlineLogin {
    fn submit(&self, request: LoginRequest) {
        let outcome = resolve(self.repo.as_ref(), &request, &self.starting_room);
        let event = InboundEvent::LoginCompleted {
            session_id: request.session_id,
            epoch: request.epoch,
            outcome,
        };
        let _ = self.inbound.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRecordRepo;
    use crate::player::test_support::session;
    use core_protocol::bus::local_channel;

    #[test]
    fn worker_round_trips_epoch() {
        let repo = Arc::new(MemoryRecordRepo::new());
        let (tx, rx) = local_channel::<InboundEvent>(8);
        let worker = LoginWorker::spawn(repo, tx, RoomId::new("hub", "plaza"));
        worker.submit(LoginRequest {
            session_id: session(1),
            epoch: 7,
            name: PlayerName::new("Alice").unwrap(),
        });

        let event = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        match event {
            InboundEvent::LoginCompleted { epoch, outcome, .. } => {
                assert_eq!(epoch, 7);
                assert!(matches!(outcome, LoginOutcome::Created(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn second_login_finds_existing_record() {
        let repo = Arc::new(MemoryRecordRepo::new());
        let (tx, rx) = local_channel::<InboundEvent>(8);
        let login = InlineLogin {
            repo,
            inbound: tx,
            starting_room: RoomId::new("hub", "plaza"),
        };
        let request = LoginRequest {
            session_id: session(1),
            epoch: 1,
            name: PlayerName::new("Alice").unwrap(),
        };
        login.submit(request.clone());
        login.submit(request);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            InboundEvent::LoginCompleted {
                outcome: LoginOutcome::Created(_),
                ..
            }
        ));
        assert!(matches!(
            second,
            InboundEvent::LoginCompleted {
                outcome: LoginOutcome::Existing(_),
                ..
            }
        ));
    }
}
