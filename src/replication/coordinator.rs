//! Replicated writes
//!
//! Every write targets two copies: the fragment owning the title type
//! (the primary) and Central. The coordinator walks `WriteState` for each
//! write, performing one side effect per state:
//!
//! - `TryPrimary` / `TryCentral`: apply on that node and read back the
//!   copy that the other node must receive, stamped with the accepting
//!   node's `last_updated`
//! - `Replicate`: apply the copy on Central and log SUCCESS
//! - `Queued`: log PENDING and hand the copy to the recovery queue
//!
//! Keys for inserts are allocated under a lock on the key range: Central's
//! `MAX` row when Central is reachable, otherwise every fragment's.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::errors::{ReplicationError, ReplicationResult};
use super::outcome::WriteOutcome;
use super::state::{Resolution, Side, StepEvent, WriteState};
use crate::model::{NewTitle, Title, TitleChanges, TitleId};
use crate::node::{
    IsolationLevel, Mutation, NodeError, NodeId, NodeRegistry, NodeResult, NodeSession, Operation,
    ReadMode,
};
use crate::observability::MetricsRegistry;
use crate::recovery::{PendingReplication, RecoveryHandler};
use crate::txlog::{TransactionLogger, TxStatus};

/// An update or delete whose key was found and whose primary is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedWrite {
    pub id: TitleId,
    pub primary: NodeId,
    pub mutation: Mutation,
    /// Row as first found, Central preferred.
    pub current: Title,
}

/// Result of looking up the target of an update or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    Ready(PreparedWrite),
    NotFound,
    /// No node answered the lookup.
    Unreachable,
}

/// Node pair a write moves between.
struct Route {
    id: TitleId,
    primary: NodeId,
    central: NodeId,
}

impl Route {
    /// (accepted on, owed to)
    fn endpoints(&self, accepted_on: Side) -> (&NodeId, &NodeId) {
        match accepted_on {
            Side::Primary => (&self.primary, &self.central),
            Side::Central => (&self.central, &self.primary),
        }
    }

    fn node(&self, side: Side) -> &NodeId {
        self.endpoints(side).0
    }
}

#[async_trait]
trait WriteSteps: Send {
    /// Applies on the primary; returns the copy owed to Central.
    async fn on_primary(&mut self) -> NodeResult<Mutation>;

    /// Applies on Central; returns the copy owed to the primary.
    async fn on_central(&mut self) -> NodeResult<Mutation>;

    async fn replicate(&mut self, copy: &Mutation) -> NodeResult<()>;

    /// Releases anything still held once the write is resolved.
    async fn finish(&mut self) {}
}

pub struct ReplicationCoordinator {
    registry: Arc<NodeRegistry>,
    logger: Arc<TransactionLogger>,
    recovery: Arc<RecoveryHandler>,
    metrics: Arc<MetricsRegistry>,
}

impl ReplicationCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        logger: Arc<TransactionLogger>,
        recovery: Arc<RecoveryHandler>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            logger,
            recovery,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn recovery(&self) -> &Arc<RecoveryHandler> {
        &self.recovery
    }

    // ==================== Insert ====================

    /// Inserts a new title under a freshly allocated key.
    pub async fn insert(&self, fields: NewTitle) -> ReplicationResult<WriteOutcome> {
        fields.validate()?;
        let primary = self.registry.primary(fields.title_type).clone();
        let central = self.registry.central().clone();
        let isolation = self.registry.default_isolation();

        if !self.registry.check_node(&primary).await {
            info!(node = %primary, "primary unreachable, inserting on central");
            return self.insert_on_central(fields, primary, central).await;
        }

        match self.registry.connect(&central, isolation).await {
            Ok(session) => {
                self.insert_holding_central(session, fields, primary, central, WriteState::TryPrimary)
                    .await
            }
            Err(err) if err.is_unavailable() => {
                warn!(node = %central, error = %err, "central unreachable, allocating key on fragments");
                self.insert_with_fragment_allocation(fields, primary, central)
                    .await
            }
            Err(err) => Err(ReplicationError::id_generation(err.to_string())),
        }
    }

    async fn insert_on_central(
        &self,
        fields: NewTitle,
        primary: NodeId,
        central: NodeId,
    ) -> ReplicationResult<WriteOutcome> {
        match self
            .registry
            .connect(&central, self.registry.default_isolation())
            .await
        {
            Ok(session) => {
                self.insert_holding_central(session, fields, primary, central, WriteState::TryCentral)
                    .await
            }
            Err(err) => {
                self.metrics.increment_unreachable();
                error!(primary = %primary, central = %central, error = %err, "insert rejected, no node reachable");
                Ok(WriteOutcome::AllTargetsUnreachable { id: None })
            }
        }
    }

    /// Allocates the key under Central's key-range lock and runs the write
    /// from `start` with that transaction still open.
    async fn insert_holding_central(
        &self,
        mut session: Box<dyn NodeSession>,
        fields: NewTitle,
        primary: NodeId,
        central: NodeId,
        start: WriteState,
    ) -> ReplicationResult<WriteOutcome> {
        let max = match lock_key_range(session.as_mut()).await {
            Ok(max) => max,
            Err(err) => {
                let _ = session.rollback().await;
                return Err(ReplicationError::id_generation(format!(
                    "cannot lock key range on {}: {}",
                    central, err
                )));
            }
        };
        let id = self.next_id([max]);
        let route = Route {
            id: id.clone(),
            primary: primary.clone(),
            central,
        };
        let mut steps = CentralHeldInsert {
            registry: Arc::clone(&self.registry),
            central: session,
            open: true,
            primary,
            id,
            fields,
        };
        self.drive(&mut steps, &route, start, None).await
    }

    async fn insert_with_fragment_allocation(
        &self,
        fields: NewTitle,
        primary: NodeId,
        central: NodeId,
    ) -> ReplicationResult<WriteOutcome> {
        let isolation = self.registry.default_isolation();
        let mut locked: Vec<(NodeId, Box<dyn NodeSession>)> = Vec::new();
        let mut maxes = Vec::new();

        for fragment in self.registry.partition().fragments() {
            let attempt = async {
                let mut session = self.registry.connect(fragment, isolation).await?;
                let max = lock_key_range(session.as_mut()).await?;
                Ok::<_, NodeError>((session, max))
            }
            .await;
            match attempt {
                Ok((session, max)) => {
                    maxes.push(max);
                    locked.push((fragment.clone(), session));
                }
                Err(err) => {
                    release_all(sessions_of(locked)).await;
                    return Err(ReplicationError::id_generation(format!(
                        "cannot lock key range on {}: {}",
                        fragment, err
                    )));
                }
            }
        }

        let id = self.next_id(maxes);
        let mut primary_session = None;
        let mut others = Vec::new();
        for (node, session) in locked {
            if node == primary {
                primary_session = Some(session);
            } else {
                others.push(session);
            }
        }
        let route = Route {
            id: id.clone(),
            primary: primary.clone(),
            central: central.clone(),
        };
        let mut steps = FragmentHeldInsert {
            registry: Arc::clone(&self.registry),
            primary_session,
            others,
            primary,
            central,
            id,
            fields,
        };
        self.drive(&mut steps, &route, WriteState::TryPrimary, None)
            .await
    }

    /// Next key above every committed key seen and every queued insert.
    fn next_id(&self, maxes: impl IntoIterator<Item = Option<u64>>) -> TitleId {
        let highest = maxes
            .into_iter()
            .flatten()
            .chain(self.recovery.max_pending_insert_number())
            .max()
            .unwrap_or(0);
        TitleId::from_number(highest + 1)
    }

    // ==================== Update / Delete ====================

    pub async fn update(
        &self,
        id: &TitleId,
        changes: TitleChanges,
        isolation: IsolationLevel,
    ) -> ReplicationResult<WriteOutcome> {
        changes.validate()?;
        self.apply_existing(id, Mutation::update(id.clone(), changes), isolation)
            .await
    }

    pub async fn delete(&self, id: &TitleId) -> ReplicationResult<WriteOutcome> {
        self.apply_existing(
            id,
            Mutation::delete(id.clone()),
            self.registry.default_isolation(),
        )
        .await
    }

    /// Finds the record and its primary ahead of an update.
    pub async fn prepare_update(
        &self,
        id: &TitleId,
        changes: TitleChanges,
    ) -> ReplicationResult<Prepared> {
        changes.validate()?;
        Ok(self.prepare(id, Mutation::update(id.clone(), changes)).await)
    }

    async fn prepare(&self, id: &TitleId, mutation: Mutation) -> Prepared {
        match self.registry.get_by_key(id).await {
            Ok(Some(current)) => Prepared::Ready(PreparedWrite {
                id: id.clone(),
                primary: self.registry.primary(current.title_type).clone(),
                mutation,
                current,
            }),
            Ok(None) => Prepared::NotFound,
            Err(err) => {
                warn!(key = %id, error = %err, "lookup failed on every node");
                Prepared::Unreachable
            }
        }
    }

    async fn apply_existing(
        &self,
        id: &TitleId,
        mutation: Mutation,
        isolation: IsolationLevel,
    ) -> ReplicationResult<WriteOutcome> {
        let prepared = match self.prepare(id, mutation).await {
            Prepared::Ready(prepared) => prepared,
            Prepared::NotFound => return Ok(WriteOutcome::NotFound { id: id.clone() }),
            Prepared::Unreachable => {
                self.metrics.increment_unreachable();
                return Ok(WriteOutcome::AllTargetsUnreachable {
                    id: Some(id.clone()),
                });
            }
        };
        let route = Route {
            id: prepared.id.clone(),
            primary: prepared.primary.clone(),
            central: self.registry.central().clone(),
        };
        let mut steps = ExistingRecordWrite {
            registry: Arc::clone(&self.registry),
            recovery: Arc::clone(&self.recovery),
            central: route.central.clone(),
            prepared,
            isolation,
        };
        self.drive(&mut steps, &route, WriteState::TryPrimary, None)
            .await
    }

    /// Copies a write already committed on the primary to Central. A
    /// failure queues the copy like any other write.
    pub async fn replicate_accepted(
        &self,
        prepared: &PreparedWrite,
        copy: Mutation,
        isolation: IsolationLevel,
    ) -> ReplicationResult<WriteOutcome> {
        let route = Route {
            id: prepared.id.clone(),
            primary: prepared.primary.clone(),
            central: self.registry.central().clone(),
        };
        let mut steps = ExistingRecordWrite {
            registry: Arc::clone(&self.registry),
            recovery: Arc::clone(&self.recovery),
            central: route.central.clone(),
            prepared: prepared.clone(),
            isolation,
        };
        self.drive(&mut steps, &route, WriteState::Replicate, Some(copy))
            .await
    }

    // ==================== Driver ====================

    async fn drive(
        &self,
        steps: &mut dyn WriteSteps,
        route: &Route,
        start: WriteState,
        copy: Option<Mutation>,
    ) -> ReplicationResult<WriteOutcome> {
        let result = self.run(steps, route, start, copy).await;
        steps.finish().await;
        result
    }

    async fn run(
        &self,
        steps: &mut dyn WriteSteps,
        route: &Route,
        mut state: WriteState,
        mut copy: Option<Mutation>,
    ) -> ReplicationResult<WriteOutcome> {
        let mut last_error: Option<String> = None;

        let resolution = loop {
            let event = match state {
                WriteState::Done(resolution) => break resolution,
                WriteState::TryPrimary => match steps.on_primary().await {
                    Ok(applied) => {
                        copy = Some(applied);
                        StepEvent::Applied
                    }
                    Err(err) => {
                        warn!(node = %route.primary, key = %route.id, error = %err, "primary write failed, trying central");
                        last_error = Some(err.to_string());
                        StepEvent::Failed
                    }
                },
                WriteState::TryCentral => match steps.on_central().await {
                    Ok(applied) => {
                        copy = Some(applied);
                        StepEvent::Applied
                    }
                    Err(err) => {
                        warn!(node = %route.central, key = %route.id, error = %err, "central write failed");
                        last_error = Some(err.to_string());
                        StepEvent::Failed
                    }
                },
                WriteState::Replicate => {
                    let replica = copy.as_ref().ok_or_else(|| {
                        ReplicationError::illegal_transition("replicate without an applied copy")
                    })?;
                    match steps.replicate(replica).await {
                        Ok(()) => {
                            self.logger
                                .log(&route.primary, &route.central, replica.clone(), TxStatus::Success, None)
                                .await;
                            StepEvent::Applied
                        }
                        Err(err) => {
                            warn!(node = %route.central, key = %route.id, error = %err, "replication to central failed");
                            last_error = Some(err.to_string());
                            StepEvent::Failed
                        }
                    }
                }
                WriteState::Queued { accepted_on } => {
                    let replica = copy.clone().ok_or_else(|| {
                        ReplicationError::illegal_transition("queue without an applied copy")
                    })?;
                    let (source, target) = route.endpoints(accepted_on);
                    let receipt = self
                        .logger
                        .log(source, target, replica.clone(), TxStatus::Pending, last_error.as_deref())
                        .await;
                    let transaction_id = receipt.transaction_id;
                    self.recovery.enqueue(PendingReplication::new(
                        &receipt,
                        source.clone(),
                        target.clone(),
                        replica,
                    ));
                    StepEvent::Logged(transaction_id)
                }
            };
            state = state.next(event)?;
        };

        Ok(self.outcome(route, resolution, copy.as_ref()))
    }

    fn outcome(&self, route: &Route, resolution: Resolution, copy: Option<&Mutation>) -> WriteOutcome {
        let operation = copy.map(Mutation::operation).unwrap_or(Operation::Insert);
        match resolution {
            Resolution::Replicated => {
                self.metrics.increment_replicated();
                info!(key = %route.id, operation = %operation, primary = %route.primary, "write replicated");
                WriteOutcome::Replicated {
                    id: route.id.clone(),
                }
            }
            Resolution::Pending {
                accepted_on,
                transaction_id,
            } => {
                self.metrics.increment_pending();
                let accepted = route.node(accepted_on).clone();
                let owed = route.node(accepted_on.other()).clone();
                info!(
                    key = %route.id,
                    operation = %operation,
                    accepted_on = %accepted,
                    pending_toward = %owed,
                    transaction_id = %transaction_id,
                    "write accepted, replication pending"
                );
                WriteOutcome::Pending {
                    id: route.id.clone(),
                    transaction_id,
                    accepted_on: accepted,
                    pending_toward: owed,
                }
            }
            Resolution::Unreachable => {
                self.metrics.increment_unreachable();
                error!(key = %route.id, primary = %route.primary, central = %route.central, "write rejected, no node reachable");
                WriteOutcome::AllTargetsUnreachable {
                    id: Some(route.id.clone()),
                }
            }
        }
    }
}

/// Builds the copy of an update or delete owed to the other node, reading
/// the row inside the session's open transaction.
pub async fn replica_copy(
    session: &mut dyn NodeSession,
    prepared: &PreparedWrite,
) -> NodeResult<Mutation> {
    match prepared.mutation.operation() {
        Operation::Update => {
            let row = session
                .fetch_title(&prepared.id, ReadMode::Plain)
                .await?
                .ok_or_else(|| {
                    NodeError::query(
                        session.node_id(),
                        format!("{} not present for update", prepared.id),
                    )
                })?;
            Ok(prepared.mutation.with_last_updated(row.last_updated))
        }
        _ => Ok(prepared.mutation.clone()),
    }
}

async fn lock_key_range(session: &mut dyn NodeSession) -> NodeResult<Option<u64>> {
    session.begin().await?;
    session.max_title_number(ReadMode::ForUpdate).await
}

fn sessions_of(locked: Vec<(NodeId, Box<dyn NodeSession>)>) -> Vec<Box<dyn NodeSession>> {
    let mut sessions = Vec::with_capacity(locked.len());
    for (_, session) in locked {
        sessions.push(session);
    }
    sessions
}

async fn release_all(sessions: Vec<Box<dyn NodeSession>>) {
    for mut session in sessions {
        let _ = session.rollback().await;
    }
}

/// Inserts the row in an open transaction, reads it back, and commits.
async fn insert_and_read(
    session: &mut dyn NodeSession,
    id: &TitleId,
    fields: &NewTitle,
) -> NodeResult<Mutation> {
    session
        .apply(&Mutation::insert(id.clone(), fields.clone()))
        .await?;
    let row = session
        .fetch_title(id, ReadMode::Plain)
        .await?
        .ok_or_else(|| NodeError::query(session.node_id(), format!("{} missing after insert", id)))?;
    session.commit().await?;
    Ok(Mutation::copy_of(&row))
}

// ==================== Steps ====================

/// Insert whose key was allocated on Central, keeping Central's
/// transaction open until Central has its row.
struct CentralHeldInsert {
    registry: Arc<NodeRegistry>,
    central: Box<dyn NodeSession>,
    open: bool,
    primary: NodeId,
    id: TitleId,
    fields: NewTitle,
}

#[async_trait]
impl WriteSteps for CentralHeldInsert {
    async fn on_primary(&mut self) -> NodeResult<Mutation> {
        let mut session = self
            .registry
            .connect(&self.primary, self.registry.default_isolation())
            .await?;
        session
            .apply(&Mutation::insert(self.id.clone(), self.fields.clone()))
            .await?;
        let row = session
            .fetch_title(&self.id, ReadMode::Plain)
            .await?
            .ok_or_else(|| NodeError::query(&self.primary, format!("{} missing after insert", self.id)))?;
        Ok(Mutation::copy_of(&row))
    }

    async fn on_central(&mut self) -> NodeResult<Mutation> {
        let result = insert_and_read(self.central.as_mut(), &self.id, &self.fields).await;
        if result.is_err() {
            let _ = self.central.rollback().await;
        }
        self.open = false;
        result
    }

    async fn replicate(&mut self, copy: &Mutation) -> NodeResult<()> {
        let result = match self.central.apply(copy).await {
            Ok(_) => self.central.commit().await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            let _ = self.central.rollback().await;
        }
        self.open = false;
        result
    }

    async fn finish(&mut self) {
        if self.open {
            let _ = self.central.rollback().await;
            self.open = false;
        }
    }
}

/// Insert whose key was allocated while Central was down. Every fragment
/// holds its key-range lock until the primary commits.
struct FragmentHeldInsert {
    registry: Arc<NodeRegistry>,
    primary_session: Option<Box<dyn NodeSession>>,
    others: Vec<Box<dyn NodeSession>>,
    primary: NodeId,
    central: NodeId,
    id: TitleId,
    fields: NewTitle,
}

impl FragmentHeldInsert {
    async fn release_others(&mut self) {
        release_all(std::mem::take(&mut self.others)).await;
    }
}

#[async_trait]
impl WriteSteps for FragmentHeldInsert {
    async fn on_primary(&mut self) -> NodeResult<Mutation> {
        let Some(mut session) = self.primary_session.take() else {
            return Err(NodeError::unavailable(&self.primary, "no locked session on primary"));
        };
        let result = insert_and_read(session.as_mut(), &self.id, &self.fields).await;
        if result.is_err() {
            let _ = session.rollback().await;
        }
        self.release_others().await;
        result
    }

    async fn on_central(&mut self) -> NodeResult<Mutation> {
        self.release_others().await;
        let mut session = self
            .registry
            .connect(&self.central, self.registry.default_isolation())
            .await?;
        session.begin().await?;
        let result = insert_and_read(session.as_mut(), &self.id, &self.fields).await;
        if result.is_err() {
            let _ = session.rollback().await;
        }
        result
    }

    async fn replicate(&mut self, copy: &Mutation) -> NodeResult<()> {
        let mut session = self
            .registry
            .connect(&self.central, self.registry.default_isolation())
            .await?;
        session.apply(copy).await.map(|_| ())
    }

    async fn finish(&mut self) {
        if let Some(mut session) = self.primary_session.take() {
            let _ = session.rollback().await;
        }
        self.release_others().await;
    }
}

/// Update or delete of a record that already exists.
struct ExistingRecordWrite {
    registry: Arc<NodeRegistry>,
    recovery: Arc<RecoveryHandler>,
    central: NodeId,
    prepared: PreparedWrite,
    isolation: IsolationLevel,
}

impl ExistingRecordWrite {
    /// Applying ahead of a queued write for the same key would let the
    /// older replay overwrite this one.
    fn ensure_nothing_queued(&self, node: &NodeId) -> NodeResult<()> {
        if self.recovery.has_pending(node, &self.prepared.id) {
            return Err(NodeError::unavailable(
                node,
                format!("earlier replication of {} still queued", self.prepared.id),
            ));
        }
        Ok(())
    }

    async fn apply_on(&self, node: &NodeId) -> NodeResult<Mutation> {
        self.ensure_nothing_queued(node)?;
        let mut session = self.registry.connect(node, self.isolation).await?;
        session.begin().await?;
        let result = async {
            session.apply(&self.prepared.mutation).await?;
            let copy = replica_copy(session.as_mut(), &self.prepared).await?;
            session.commit().await?;
            Ok::<_, NodeError>(copy)
        }
        .await;
        if result.is_err() {
            let _ = session.rollback().await;
        }
        result
    }
}

#[async_trait]
impl WriteSteps for ExistingRecordWrite {
    async fn on_primary(&mut self) -> NodeResult<Mutation> {
        let primary = self.prepared.primary.clone();
        self.apply_on(&primary).await
    }

    async fn on_central(&mut self) -> NodeResult<Mutation> {
        let central = self.central.clone();
        self.apply_on(&central).await
    }

    async fn replicate(&mut self, copy: &Mutation) -> NodeResult<()> {
        self.ensure_nothing_queued(&self.central)?;
        let mut session = self.registry.connect(&self.central, self.isolation).await?;
        let affected = session.apply(copy).await?;
        if affected == 0 && copy.operation() == Operation::Update {
            return Err(NodeError::query(
                &self.central,
                format!("{} not present on central", copy.record_id()),
            ));
        }
        Ok(())
    }
}
