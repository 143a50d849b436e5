//! All mutable queue state: the confirmation map, the pending/in-flight
//! task collections, the id counter, and the last-worker-checkin clock.
//!
//! Grounded in `original_source/npsgd/task_queue.py`'s `TaskQueue` (pull
//! by id, pull-older-than, touch-by-id) and
//! `original_source/npsgd/confirmation_map.py`'s `ConfirmationMap`
//! (random code, timestamped expiry). Lock ordering follows the
//! specification: registry, then confirmation map, then queue, then id
//! counter; the snapshot-write lock is taken last and never held across
//! another lock acquisition.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use rand::Rng;
use time::{Duration, OffsetDateTime};

use dispatch_common::error::PersistenceError;
use dispatch_common::persistence::{self, Snapshot};
use dispatch_common::task::{Task, TaskDict, TaskId};

const CONFIRMATION_CODE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const CONFIRMATION_CODE_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct ConfirmationEntry {
    pub task: Task,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub task: Task,
    pub last_heartbeat_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    AlreadyConfirmed,
    NotFound,
}

pub struct QueueState {
    pending: Mutex<VecDeque<Task>>,
    in_flight: Mutex<HashMap<TaskId, InFlightEntry>>,
    confirmations: Mutex<HashMap<String, ConfirmationEntry>>,
    /// Codes that were confirmed and already consumed, kept around so a
    /// repeated GET of the same confirmation link reports
    /// `already_confirmed` instead of 404.
    already_confirmed: Mutex<std::collections::HashSet<String>>,
    id_counter: Mutex<TaskId>,
    last_worker_checkin: Mutex<OffsetDateTime>,
    state_path: PathBuf,
    pub confirm_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub max_job_failures: u32,
}

impl QueueState {
    pub fn new(
        state_path: PathBuf,
        confirm_timeout: Duration,
        keep_alive_timeout: Duration,
        max_job_failures: u32,
    ) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            confirmations: Mutex::new(HashMap::new()),
            already_confirmed: Mutex::new(std::collections::HashSet::new()),
            id_counter: Mutex::new(0),
            last_worker_checkin: Mutex::new(OffsetDateTime::UNIX_EPOCH),
            state_path,
            confirm_timeout,
            keep_alive_timeout,
            max_job_failures,
        }
    }

    /// Reloads the persisted snapshot, returning any `(model, version)`
    /// pairs that `is_known` rejects so the caller can notify their
    /// owners. Both the pending list and the confirmation map are
    /// restored this way; the in-flight set is never persisted on its
    /// own (its members were flattened into `pending` at save time).
    pub fn reload(&self, is_known: impl Fn(&str, &str) -> bool) -> Result<Vec<TaskDict>, PersistenceError> {
        let snapshot = match persistence::load(&self.state_path) {
            Ok(snapshot) => snapshot,
            Err(PersistenceError::Corrupt(err)) => {
                tracing::warn!(error = %err, "state file is corrupt, starting from a fresh snapshot");
                Snapshot::default()
            }
            Err(err) => return Err(err),
        };
        let mut lost = Vec::new();

        {
            let mut pending = self.pending.lock().unwrap();
            for dict in snapshot.pending {
                if is_known(&dict.model_name, &dict.model_version) {
                    pending.push_back(Task {
                        task_id: dict.task_id,
                        visible_id: dict.visible_id.clone(),
                        email_address: dict.email_address.clone(),
                        model_name: dict.model_name.clone(),
                        model_version: dict.model_version.clone(),
                        parameter_values: dict
                            .model_parameters
                            .iter()
                            .map(|(k, v)| (k.clone(), v.value.clone()))
                            .collect(),
                        failure_count: dict.failure_count,
                    });
                } else {
                    lost.push(dict);
                }
            }
        }

        {
            let mut confirmations = self.confirmations.lock().unwrap();
            let expires_at = OffsetDateTime::now_utc() + self.confirm_timeout;
            for (code, dict) in snapshot.confirmation_map {
                if is_known(&dict.model_name, &dict.model_version) {
                    confirmations.insert(
                        code,
                        ConfirmationEntry {
                            task: Task {
                                task_id: dict.task_id,
                                visible_id: dict.visible_id.clone(),
                                email_address: dict.email_address.clone(),
                                model_name: dict.model_name.clone(),
                                model_version: dict.model_version.clone(),
                                parameter_values: dict
                                    .model_parameters
                                    .iter()
                                    .map(|(k, v)| (k.clone(), v.value.clone()))
                                    .collect(),
                                failure_count: dict.failure_count,
                            },
                            expires_at,
                        },
                    );
                } else {
                    lost.push(dict);
                }
            }
        }

        *self.id_counter.lock().unwrap() = snapshot.id_counter;
        Ok(lost)
    }

    fn next_task_id(&self) -> TaskId {
        let mut counter = self.id_counter.lock().unwrap();
        *counter += 1;
        *counter
    }

    fn generate_confirmation_code(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..CONFIRMATION_CODE_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..CONFIRMATION_CODE_ALPHABET.len());
                CONFIRMATION_CODE_ALPHABET[idx] as char
            })
            .collect()
    }

    /// Assigns a fresh `task_id`, files the task under a fresh
    /// confirmation code, and persists. Returns the assigned id and code.
    pub fn create(&self, mut task: Task) -> Result<(Task, String), PersistenceError> {
        task.task_id = self.next_task_id();
        let code = self.generate_confirmation_code();

        self.confirmations.lock().unwrap().insert(
            code.clone(),
            ConfirmationEntry {
                task: task.clone(),
                expires_at: OffsetDateTime::now_utc() + self.confirm_timeout,
            },
        );

        self.persist()?;
        Ok((task, code))
    }

    /// `Ok(Some(task))` if `code` was pending confirmation and has now
    /// moved to the pending queue; `AlreadyConfirmed` if `code` was
    /// already consumed; `NotFound` if `code` was never valid or has
    /// expired.
    pub fn confirm(&self, code: &str) -> Result<ConfirmOutcome, PersistenceError> {
        self.expire_confirmations();

        let entry = self.confirmations.lock().unwrap().remove(code);
        match entry {
            Some(entry) => {
                self.pending.lock().unwrap().push_back(entry.task);
                self.already_confirmed.lock().unwrap().insert(code.to_owned());
                self.persist()?;
                Ok(ConfirmOutcome::Confirmed)
            }
            None => {
                if self.already_confirmed.lock().unwrap().contains(code) {
                    Ok(ConfirmOutcome::AlreadyConfirmed)
                } else {
                    Ok(ConfirmOutcome::NotFound)
                }
            }
        }
    }

    fn expire_confirmations(&self) {
        let now = OffsetDateTime::now_utc();
        let mut confirmations = self.confirmations.lock().unwrap();
        let before = confirmations.len();
        confirmations.retain(|_, entry| entry.expires_at > now);
        let expired = before - confirmations.len();
        if expired > 0 {
            tracing::info!(count = expired, "expired stale confirmations");
        }
    }

    pub fn touch_worker_checkin(&self) {
        *self.last_worker_checkin.lock().unwrap() = OffsetDateTime::now_utc();
    }

    pub fn has_workers(&self) -> bool {
        let last = *self.last_worker_checkin.lock().unwrap();
        OffsetDateTime::now_utc() - last < self.keep_alive_timeout
    }

    /// Pulls the first pending task whose `(name, version)` is in
    /// `supported`, moving it to in-flight. FIFO within the eligible
    /// subset: earlier ineligible tasks are left in place.
    pub fn pull_for_worker(&self, supported: &[(String, String)]) -> Option<Task> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return None;
        }

        let position = pending.iter().position(|t| t.matches_any(supported))?;
        let task = pending.remove(position)?;

        self.in_flight.lock().unwrap().insert(
            task.task_id,
            InFlightEntry {
                task: task.clone(),
                last_heartbeat_at: OffsetDateTime::now_utc(),
            },
        );
        Some(task)
    }

    pub fn keep_alive(&self, task_id: TaskId) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap();
        match in_flight.get_mut(&task_id) {
            Some(entry) => {
                entry.last_heartbeat_at = OffsetDateTime::now_utc();
                true
            }
            None => false,
        }
    }

    pub fn has_task(&self, task_id: TaskId) -> bool {
        self.in_flight.lock().unwrap().contains_key(&task_id)
    }

    pub fn succeed(&self, task_id: TaskId) -> Result<bool, PersistenceError> {
        let removed = self.in_flight.lock().unwrap().remove(&task_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Removes the task from in-flight, increments `failure_count`, and
    /// either queues a failure notification (returned as `Err(task)`,
    /// `failure_count >= max_failures`) or re-inserts it into pending
    /// under a new id (`Ok(Some(new_task))`). `Ok(None)` means the id was
    /// not in-flight.
    pub fn fail(&self, task_id: TaskId) -> Result<Option<Result<Task, Task>>, PersistenceError> {
        let entry = self.in_flight.lock().unwrap().remove(&task_id);
        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut task = entry.task;
        task.failure_count += 1;

        let outcome = if task.failure_count >= self.max_job_failures {
            Err(task)
        } else {
            task.task_id = self.next_task_id();
            self.pending.lock().unwrap().push_back(task.clone());
            Ok(task)
        };

        self.persist()?;
        Ok(Some(outcome))
    }

    /// Reclaims all in-flight entries whose last heartbeat is older than
    /// `keep_alive_timeout`. For each, bumps `failure_count` and either
    /// re-queues under a fresh id or returns it for a failure
    /// notification, using `>` against `max_failures` per the
    /// sweeper-induced cap.
    pub fn sweep_expired(&self) -> Result<Vec<Result<Task, Task>>, PersistenceError> {
        let now = OffsetDateTime::now_utc();
        let expired: Vec<InFlightEntry> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let expired_ids: Vec<TaskId> = in_flight
                .iter()
                .filter(|(_, entry)| now - entry.last_heartbeat_at >= self.keep_alive_timeout)
                .map(|(id, _)| *id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| in_flight.remove(&id))
                .collect()
        };

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(expired.len());
        for entry in expired {
            let mut task = entry.task;
            task.failure_count += 1;

            if task.failure_count > self.max_job_failures {
                outcomes.push(Err(task));
            } else {
                task.task_id = self.next_task_id();
                self.pending.lock().unwrap().push_back(task.clone());
                outcomes.push(Ok(task));
            }
        }

        self.persist()?;
        Ok(outcomes)
    }

    fn persist(&self) -> Result<(), PersistenceError> {
        let pending: Vec<TaskDict> = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .map(Task::to_dict)
            .collect();
        let in_flight: Vec<TaskDict> = self
            .in_flight
            .lock()
            .unwrap()
            .values()
            .map(|e| e.task.to_dict())
            .collect();
        let confirmation_map: HashMap<String, TaskDict> = self
            .confirmations
            .lock()
            .unwrap()
            .iter()
            .map(|(code, entry)| (code.clone(), entry.task.to_dict()))
            .collect();

        let mut all_pending = pending;
        all_pending.extend(in_flight);

        let snapshot = Snapshot {
            pending: all_pending,
            confirmation_map,
            id_counter: *self.id_counter.lock().unwrap(),
        };

        persistence::save(&self.state_path, &snapshot)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn state() -> (tempfile::TempDir, QueueState) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = QueueState::new(
            path,
            Duration::minutes(30),
            Duration::seconds(90),
            3,
        );
        (dir, state)
    }

    fn task(email: &str) -> Task {
        Task {
            task_id: 0,
            visible_id: "abcd1234".to_owned(),
            email_address: email.to_owned(),
            model_name: "abmu".to_owned(),
            model_version: "deadbeef".to_owned(),
            parameter_values: StdHashMap::new(),
            failure_count: 0,
        }
    }

    #[test]
    fn create_then_confirm_moves_task_to_pending() {
        let (_dir, state) = state();
        let (created, code) = state.create(task("a@b.com")).unwrap();
        assert_eq!(created.task_id, 1);
        assert_eq!(state.pending_len(), 0);

        state.confirm(&code).unwrap();
        assert_eq!(state.pending_len(), 1);
    }

    #[test]
    fn confirming_twice_reports_already_confirmed() {
        let (_dir, state) = state();
        let (_, code) = state.create(task("a@b.com")).unwrap();
        assert_eq!(state.confirm(&code).unwrap(), ConfirmOutcome::Confirmed);
        assert_eq!(state.confirm(&code).unwrap(), ConfirmOutcome::AlreadyConfirmed);
    }

    #[test]
    fn confirming_unknown_code_is_not_found() {
        let (_dir, state) = state();
        assert_eq!(
            state.confirm("does-not-exist").unwrap(),
            ConfirmOutcome::NotFound
        );
    }

    #[test]
    fn expired_confirmation_is_not_confirmable() {
        let dir = tempfile::tempdir().unwrap();
        let state = QueueState::new(
            dir.path().join("state.json"),
            Duration::seconds(-1),
            Duration::seconds(90),
            3,
        );

        let (_, code) = state.create(task("a@b.com")).unwrap();
        assert_eq!(state.confirm(&code).unwrap(), ConfirmOutcome::NotFound);
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn pull_for_worker_respects_version_matching() {
        let (_dir, state) = state();
        let (created, code) = state.create(task("a@b.com")).unwrap();
        state.confirm(&code).unwrap();

        assert!(state
            .pull_for_worker(&[("abmu".to_owned(), "wrong-version".to_owned())])
            .is_none());

        let pulled = state
            .pull_for_worker(&[("abmu".to_owned(), "deadbeef".to_owned())])
            .unwrap();
        assert_eq!(pulled.task_id, created.task_id);
        assert_eq!(state.in_flight_len(), 1);
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn keep_alive_on_unknown_id_is_false() {
        let (_dir, state) = state();
        assert!(!state.keep_alive(999));
    }

    #[test]
    fn fail_under_cap_requeues_with_new_id() {
        let (_dir, state) = state();
        let (created, code) = state.create(task("a@b.com")).unwrap();
        state.confirm(&code).unwrap();
        let pulled = state
            .pull_for_worker(&[("abmu".to_owned(), "deadbeef".to_owned())])
            .unwrap();

        let outcome = state.fail(pulled.task_id).unwrap().unwrap();
        let requeued = outcome.unwrap();
        assert_ne!(requeued.task_id, created.task_id);
        assert!(requeued.task_id > created.task_id);
        assert_eq!(requeued.failure_count, 1);
        assert_eq!(state.pending_len(), 1);
    }

    #[test]
    fn fail_at_cap_does_not_requeue() {
        let (_dir, state) = state();
        let (_, code) = state.create(task("a@b.com")).unwrap();
        state.confirm(&code).unwrap();

        let mut current_id = state
            .pull_for_worker(&[("abmu".to_owned(), "deadbeef".to_owned())])
            .unwrap()
            .task_id;

        for _ in 0..2 {
            let outcome = state.fail(current_id).unwrap().unwrap().unwrap();
            current_id = outcome.task_id;
        }

        let final_outcome = state.fail(current_id).unwrap().unwrap();
        assert!(final_outcome.is_err());
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn sweep_expired_requeues_tasks_past_heartbeat_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let state = QueueState::new(
            dir.path().join("state.json"),
            Duration::minutes(30),
            Duration::seconds(-1),
            3,
        );
        let (_, code) = state.create(task("a@b.com")).unwrap();
        state.confirm(&code).unwrap();
        state
            .pull_for_worker(&[("abmu".to_owned(), "deadbeef".to_owned())])
            .unwrap();

        let outcomes = state.sweep_expired().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_ok());
        assert_eq!(state.pending_len(), 1);
        assert_eq!(state.in_flight_len(), 0);
    }
}
