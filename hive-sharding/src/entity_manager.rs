// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::ShardingError;
use crate::mailbox::{Mailbox, MailboxReceiver};
use crate::storage::{MailboxStorage, MailboxStorageError};
use async_trait::async_trait;
use hive_common::envelope::{EntityMessage, Envelope, MessageExit, MessageState};
use hive_common::metrics;
use hive_common::model::{EntityAddress, EntityType, ShardId};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OFFER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One decoded message together with the capability to complete it.
pub struct EntityRequest<M: EntityMessage> {
    pub message: M,
    pub replier: Replier<M>,
}

/// User-supplied behavior of one entity type. `run` is started once per live
/// entity instance and owns the receiving half of its mailbox; returning
/// from it closes the entity.
#[async_trait]
pub trait EntityBehavior<M: EntityMessage>: Send + Sync + 'static {
    async fn run(&self, entity_id: String, mailbox: MailboxReceiver<EntityRequest<M>>);
}

/// Write-side of one message's durable result. The manager never infers
/// completion: a message stays pending until the behavior replies through
/// this, and pending messages may be redelivered after a crash.
pub struct Replier<M: EntityMessage> {
    address: EntityAddress,
    primary_key: String,
    sequence_number: u64,
    storage: Arc<dyn MailboxStorage>,
    last_active: Arc<std::sync::Mutex<HashMap<EntityAddress, Instant>>>,
    _protocol: PhantomData<fn() -> M>,
}

impl<M: EntityMessage> Replier<M> {
    pub async fn succeed(&self, value: M::Success) {
        match MessageExit::success(&value) {
            Ok(exit) => self.complete(exit).await,
            Err(err) => error!("Failed to encode reply for {}: {err}", self.address),
        }
    }

    pub async fn fail(&self, failure: M::Failure) {
        match MessageExit::failure(&failure) {
            Ok(exit) => self.complete(exit).await,
            Err(err) => error!("Failed to encode failure reply for {}: {err}", self.address),
        }
    }

    pub async fn fail_cause(&self, cause: serde_json::Value) {
        self.complete(MessageExit::Failure { cause }).await
    }

    pub async fn complete(&self, exit: MessageExit) {
        let state = MessageState::Processed { exit };
        match self
            .storage
            .update_message(&self.address, &self.primary_key, self.sequence_number, &state)
            .await
        {
            Ok(()) => {}
            Err(MailboxStorageError::NotFound(_)) => {
                debug!(
                    "Result of message #{} for {} could not be recorded: unknown to the store",
                    self.sequence_number, self.address
                );
            }
            Err(err) => {
                error!("Failed to record result for {}: {err}", self.address);
            }
        }
        self.last_active
            .lock()
            .unwrap()
            .insert(self.address.clone(), Instant::now());
        metrics::record_message_processed(self.address.entity_type.as_str());
    }

    pub async fn complete_effect<F>(&self, effect: F)
    where
        F: Future<Output = Result<M::Success, M::Failure>> + Send,
    {
        match effect.await {
            Ok(value) => self.succeed(value).await,
            Err(failure) => self.fail(failure).await,
        }
    }
}

struct ActiveEntity<M: EntityMessage> {
    id: u64,
    mailbox: Arc<Mailbox<EntityRequest<M>>>,
    scope: CancellationToken,
    join: JoinHandle<()>,
}

// Linear lifecycle: Active -> Terminating -> removed; transitions only under
// the entities lock.
enum EntitySlot<M: EntityMessage> {
    Active(ActiveEntity<M>),
    Terminating { id: u64 },
}

/// Type-erased view of an entity manager, held by the per-pod registry.
#[async_trait]
pub trait EntityManagerHandle: Send + Sync {
    fn entity_type(&self) -> &EntityType;

    async fn send(&self, envelope: &Envelope) -> Result<(), ShardingError>;

    async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>);

    async fn terminate_all(&self);

    async fn active_entities(&self) -> Vec<EntityAddress>;
}

/// Supervisor for all live entities of one type on one pod: spawns them on
/// demand, feeds their mailboxes from durable storage, idles them out, and
/// drains them on termination.
pub struct EntityManager<M: EntityMessage> {
    entity_type: EntityType,
    behavior: Arc<dyn EntityBehavior<M>>,
    storage: Arc<dyn MailboxStorage>,
    entities: Arc<tokio::sync::Mutex<HashMap<EntityAddress, EntitySlot<M>>>>,
    last_active: Arc<std::sync::Mutex<HashMap<EntityAddress, Instant>>>,
    max_idle_time: Duration,
    termination_timeout: Duration,
    is_shutdown: Arc<AtomicBool>,
    scope: CancellationToken,
    next_entity_id: AtomicU64,
}

enum ResolvedMailbox<M: EntityMessage> {
    Ready(Arc<Mailbox<EntityRequest<M>>>),
    Terminating,
}

impl<M: EntityMessage> EntityManager<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_type: EntityType,
        behavior: Arc<dyn EntityBehavior<M>>,
        storage: Arc<dyn MailboxStorage>,
        max_idle_time: Duration,
        termination_timeout: Duration,
        is_shutdown: Arc<AtomicBool>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            entity_type,
            behavior,
            storage,
            entities: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            last_active: Arc::new(std::sync::Mutex::new(HashMap::new())),
            max_idle_time,
            termination_timeout,
            is_shutdown,
            scope,
            next_entity_id: AtomicU64::new(0),
        }
    }

    /// Persists the envelope's message and enqueues it to the addressed
    /// entity, creating the entity when needed. Offers rejected by a closing
    /// mailbox are retried against freshly resolved state.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ShardingError> {
        let message: M =
            envelope
                .decode_message()
                .map_err(|err| ShardingError::MalformedMessage {
                    entity_type: self.entity_type.clone(),
                    cause: err.to_string(),
                })?;
        let primary_key = message.primary_key();

        let entry = match self
            .storage
            .save_message(&envelope.address, &primary_key, &envelope.message)
            .await
        {
            Ok(entry) => entry,
            Err(MailboxStorageError::NotFound(_)) => {
                debug!(
                    "Dropping message for {}: unknown to the mailbox store",
                    envelope.address
                );
                return Ok(());
            }
            Err(MailboxStorageError::Persistence(err)) => {
                // Durable enqueue is the core promise; its failure is not
                // reported as a routing error. The message is dropped and
                // the sender sees success.
                error!("Failed to persist message for {}: {err}", envelope.address);
                return Ok(());
            }
        };
        metrics::record_message_persisted(self.entity_type.as_str());

        let mut request = EntityRequest {
            message,
            replier: Replier {
                address: envelope.address.clone(),
                primary_key,
                sequence_number: entry.sequence_number,
                storage: self.storage.clone(),
                last_active: self.last_active.clone(),
                _protocol: PhantomData,
            },
        };

        loop {
            match self.get_or_create(&envelope.address).await? {
                ResolvedMailbox::Ready(mailbox) => match mailbox.offer(request) {
                    Ok(()) => return Ok(()),
                    Err(returned) => {
                        debug!(
                            "Mailbox of {} rejected the offer, retrying",
                            envelope.address
                        );
                        request = returned;
                    }
                },
                ResolvedMailbox::Terminating => {
                    debug!("Entity {} is terminating, retrying", envelope.address);
                }
            }
            tokio::time::sleep(OFFER_RETRY_DELAY).await;
        }
    }

    /// Gracefully closes one entity: no-op when the address is unknown.
    pub async fn terminate_entity(&self, address: &EntityAddress) {
        if let Some(active) = take_for_termination(&self.entities, address).await {
            drain_and_close(address, active, self.termination_timeout).await;
        }
    }

    async fn get_or_create(
        &self,
        address: &EntityAddress,
    ) -> Result<ResolvedMailbox<M>, ShardingError> {
        let mut entities = self.entities.lock().await;
        match entities.get(address) {
            Some(EntitySlot::Active(active)) => Ok(ResolvedMailbox::Ready(active.mailbox.clone())),
            Some(EntitySlot::Terminating { .. }) => Ok(ResolvedMailbox::Terminating),
            None => {
                if self.is_shutdown.load(Ordering::Acquire) {
                    return Err(ShardingError::EntityNotManagedByPod {
                        address: address.clone(),
                    });
                }
                let active = self.spawn_entity(address);
                let mailbox = active.mailbox.clone();
                entities.insert(address.clone(), EntitySlot::Active(active));
                Ok(ResolvedMailbox::Ready(mailbox))
            }
        }
    }

    fn spawn_entity(&self, address: &EntityAddress) -> ActiveEntity<M> {
        let id = self.next_entity_id.fetch_add(1, Ordering::Relaxed);
        let scope = self.scope.child_token();
        let (mailbox, receiver) = Mailbox::unbounded();
        let mailbox = Arc::new(mailbox);

        self.last_active
            .lock()
            .unwrap()
            .insert(address.clone(), Instant::now());
        metrics::record_entity_created(self.entity_type.as_str());
        debug!("Creating entity {address}");

        let join = {
            let behavior = self.behavior.clone();
            let entities = self.entities.clone();
            let last_active = self.last_active.clone();
            let address = address.clone();
            let entity_type = self.entity_type.clone();
            let token = scope.clone();
            let entity_id = address.entity_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Entity {address} was force-closed");
                    }
                    _ = behavior.run(entity_id, receiver) => {}
                }
                // Cleanup in reverse registration order: drop the registry
                // entry of this incarnation, then the idle bookkeeping and
                // gauge, then the remaining tasks via the scope.
                {
                    let mut map = entities.lock().await;
                    let owned = match map.get(&address) {
                        Some(EntitySlot::Active(active)) => active.id == id,
                        Some(EntitySlot::Terminating { id: slot_id }) => *slot_id == id,
                        None => false,
                    };
                    if owned {
                        map.remove(&address);
                        last_active.lock().unwrap().remove(&address);
                    }
                }
                metrics::record_entity_terminated(entity_type.as_str());
                token.cancel();
                debug!("Entity {address} terminated");
            })
        };

        self.spawn_expiration_task(address, &scope);

        ActiveEntity {
            id,
            mailbox,
            scope,
            join,
        }
    }

    fn spawn_expiration_task(&self, address: &EntityAddress, scope: &CancellationToken) {
        let entities = self.entities.clone();
        let last_active = self.last_active.clone();
        let address = address.clone();
        let token = scope.clone();
        let max_idle_time = self.max_idle_time;
        let termination_timeout = self.termination_timeout;
        tokio::spawn(async move {
            let mut sleep_for = max_idle_time;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                let last = last_active.lock().unwrap().get(&address).copied();
                let Some(last) = last else { return };
                let idle_for = last.elapsed();
                if idle_for >= max_idle_time {
                    debug!("Entity {address} was idle for {idle_for:?}, terminating");
                    if let Some(active) = take_for_termination(&entities, &address).await {
                        drain_and_close(&address, active, termination_timeout).await;
                    }
                    return;
                } else {
                    sleep_for = max_idle_time - idle_for;
                }
            }
        });
    }
}

async fn take_for_termination<M: EntityMessage>(
    entities: &tokio::sync::Mutex<HashMap<EntityAddress, EntitySlot<M>>>,
    address: &EntityAddress,
) -> Option<ActiveEntity<M>> {
    let mut map = entities.lock().await;
    let slot = map.get_mut(address)?;
    let id = match slot {
        EntitySlot::Active(active) => active.id,
        EntitySlot::Terminating { .. } => return None,
    };
    match std::mem::replace(slot, EntitySlot::Terminating { id }) {
        EntitySlot::Active(active) => Some(active),
        EntitySlot::Terminating { .. } => None,
    }
}

async fn drain_and_close<M: EntityMessage>(
    address: &EntityAddress,
    active: ActiveEntity<M>,
    termination_timeout: Duration,
) {
    active.mailbox.shutdown();
    let mut join = active.join;
    if tokio::time::timeout(termination_timeout, &mut join)
        .await
        .is_err()
    {
        warn!(
            "Entity {address} did not drain within {termination_timeout:?}, force closing its scope"
        );
        active.scope.cancel();
        let _ = join.await;
    }
}

#[async_trait]
impl<M: EntityMessage> EntityManagerHandle for EntityManager<M> {
    fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ShardingError> {
        EntityManager::send(self, envelope).await
    }

    async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>) {
        let addresses: Vec<EntityAddress> = {
            let map = self.entities.lock().await;
            map.keys()
                .filter(|address| shards.contains(&address.shard_id))
                .cloned()
                .collect()
        };
        if addresses.is_empty() {
            return;
        }
        info!(
            "Terminating {} {} entity(ies) on released shards",
            addresses.len(),
            self.entity_type
        );
        let terminations = addresses
            .iter()
            .map(|address| self.terminate_entity(address));
        futures::future::join_all(terminations).await;
    }

    async fn terminate_all(&self) {
        let addresses: Vec<EntityAddress> =
            self.entities.lock().await.keys().cloned().collect();
        let terminations = addresses
            .iter()
            .map(|address| self.terminate_entity(address));
        futures::future::join_all(terminations).await;
    }

    async fn active_entities(&self) -> Vec<EntityAddress> {
        self.entities
            .lock()
            .await
            .iter()
            .filter_map(|(address, slot)| match slot {
                EntitySlot::Active(_) => Some(address.clone()),
                EntitySlot::Terminating { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::storage::memory::InMemoryMailboxStorage;
    use assert2::check;
    use hive_common::hashing::shard_id_for;
    use serde::{Deserialize, Serialize};

    const NUMBER_OF_SHARDS: u32 = 16;

    #[derive(Debug, Serialize, Deserialize)]
    enum CounterMessage {
        Get { key: String },
        Inc { key: String },
        Dec { key: String },
    }

    impl EntityMessage for CounterMessage {
        type Success = i64;
        type Failure = String;

        fn primary_key(&self) -> String {
            match self {
                CounterMessage::Get { key }
                | CounterMessage::Inc { key }
                | CounterMessage::Dec { key } => key.clone(),
            }
        }
    }

    struct CounterBehavior;

    #[async_trait]
    impl EntityBehavior<CounterMessage> for CounterBehavior {
        async fn run(
            &self,
            _entity_id: String,
            mut mailbox: MailboxReceiver<EntityRequest<CounterMessage>>,
        ) {
            let mut count: i64 = 0;
            while let Some(request) = mailbox.take().await {
                match &request.message {
                    CounterMessage::Inc { .. } => count += 1,
                    CounterMessage::Dec { .. } => count -= 1,
                    CounterMessage::Get { .. } => {}
                }
                request.replier.succeed(count).await;
            }
        }
    }

    fn entity_type() -> EntityType {
        EntityType::new("counter").unwrap()
    }

    fn address(entity_id: &str) -> EntityAddress {
        EntityAddress::new(
            shard_id_for(entity_id, NUMBER_OF_SHARDS),
            entity_type(),
            entity_id,
        )
    }

    fn envelope(entity_id: &str, message: &CounterMessage) -> Envelope {
        Envelope::encode(address(entity_id), message).unwrap()
    }

    fn manager(
        storage: Arc<InMemoryMailboxStorage>,
        max_idle_time: Duration,
        is_shutdown: Arc<AtomicBool>,
    ) -> EntityManager<CounterMessage> {
        EntityManager::new(
            entity_type(),
            Arc::new(CounterBehavior),
            storage,
            max_idle_time,
            Duration::from_secs(5),
            is_shutdown,
            CancellationToken::new(),
        )
    }

    async fn ask(
        storage: &InMemoryMailboxStorage,
        entity_id: &str,
        key: &str,
    ) -> i64 {
        match storage.await_processed(&address(entity_id), key).await.unwrap() {
            MessageExit::Success { value } => serde_json::from_value(value).unwrap(),
            MessageExit::Failure { cause } => panic!("entity failed: {cause}"),
        }
    }

    #[test]
    async fn messages_are_persisted_and_processed_in_order() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let manager = manager(
            storage.clone(),
            Duration::from_secs(60),
            Arc::new(AtomicBool::new(false)),
        );

        manager
            .send(&envelope("x", &CounterMessage::Inc { key: "k1".into() }))
            .await
            .unwrap();
        manager
            .send(&envelope("x", &CounterMessage::Inc { key: "k2".into() }))
            .await
            .unwrap();
        manager
            .send(&envelope("x", &CounterMessage::Get { key: "k3".into() }))
            .await
            .unwrap();

        check!(ask(&storage, "x", "k1").await == 1);
        check!(ask(&storage, "x", "k2").await == 2);
        check!(ask(&storage, "x", "k3").await == 2);
        check!(manager.active_entities().await == vec![address("x")]);
    }

    #[test]
    async fn entities_of_the_same_type_are_independent() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let manager = manager(
            storage.clone(),
            Duration::from_secs(60),
            Arc::new(AtomicBool::new(false)),
        );

        manager
            .send(&envelope("x", &CounterMessage::Inc { key: "k1".into() }))
            .await
            .unwrap();
        manager
            .send(&envelope("y", &CounterMessage::Get { key: "k2".into() }))
            .await
            .unwrap();

        check!(ask(&storage, "x", "k1").await == 1);
        check!(ask(&storage, "y", "k2").await == 0);
        check!(manager.active_entities().await.len() == 2);
    }

    #[test]
    async fn malformed_messages_are_rejected_without_side_effects() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let manager = manager(
            storage.clone(),
            Duration::from_secs(60),
            Arc::new(AtomicBool::new(false)),
        );

        let bad = Envelope {
            address: address("x"),
            message: serde_json::json!({ "NoSuchVariant": {} }),
        };
        let result = manager.send(&bad).await;
        check!(matches!(
            result,
            Err(ShardingError::MalformedMessage { .. })
        ));
        check!(manager.active_entities().await.is_empty());
    }

    #[test]
    async fn idle_entities_expire_and_are_recreated_fresh() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let manager = manager(
            storage.clone(),
            Duration::from_millis(50),
            Arc::new(AtomicBool::new(false)),
        );

        manager
            .send(&envelope("x", &CounterMessage::Inc { key: "k1".into() }))
            .await
            .unwrap();
        check!(ask(&storage, "x", "k1").await == 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        check!(manager.active_entities().await.is_empty());

        // In-memory behavior state does not survive the restart.
        manager
            .send(&envelope("x", &CounterMessage::Get { key: "k2".into() }))
            .await
            .unwrap();
        check!(ask(&storage, "x", "k2").await == 0);
    }

    #[test]
    async fn shutdown_refuses_new_entities() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let is_shutdown = Arc::new(AtomicBool::new(false));
        let manager = manager(storage.clone(), Duration::from_secs(60), is_shutdown.clone());

        manager
            .send(&envelope("x", &CounterMessage::Inc { key: "k1".into() }))
            .await
            .unwrap();
        check!(ask(&storage, "x", "k1").await == 1);

        is_shutdown.store(true, Ordering::Release);
        let result = manager
            .send(&envelope("y", &CounterMessage::Inc { key: "k2".into() }))
            .await;
        check!(matches!(
            result,
            Err(ShardingError::EntityNotManagedByPod { .. })
        ));

        // Existing entities still accept messages until terminated.
        manager
            .send(&envelope("x", &CounterMessage::Inc { key: "k3".into() }))
            .await
            .unwrap();
        check!(ask(&storage, "x", "k3").await == 2);
    }

    #[test]
    async fn terminate_all_drains_enqueued_messages() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let manager = manager(
            storage.clone(),
            Duration::from_secs(60),
            Arc::new(AtomicBool::new(false)),
        );

        for n in 1..=5 {
            manager
                .send(&envelope(
                    "x",
                    &CounterMessage::Inc {
                        key: format!("k{n}"),
                    },
                ))
                .await
                .unwrap();
        }
        manager.terminate_all().await;

        check!(manager.active_entities().await.is_empty());
        check!(ask(&storage, "x", "k5").await == 5);
    }

    #[test]
    async fn terminating_an_unknown_entity_is_a_no_op() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let manager = manager(
            storage,
            Duration::from_secs(60),
            Arc::new(AtomicBool::new(false)),
        );
        manager.terminate_entity(&address("nope")).await;
        check!(manager.active_entities().await.is_empty());
    }

    #[test]
    async fn zero_idle_time_terminates_after_the_first_processed_message() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
        let manager = manager(
            storage.clone(),
            Duration::ZERO,
            Arc::new(AtomicBool::new(false)),
        );

        manager
            .send(&envelope("x", &CounterMessage::Inc { key: "k1".into() }))
            .await
            .unwrap();
        check!(ask(&storage, "x", "k1").await == 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        check!(manager.active_entities().await.is_empty());
    }
}
