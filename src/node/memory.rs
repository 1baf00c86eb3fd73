//! In-process node engine
//!
//! A small transactional table engine that honors the session contract
//! closely enough to exercise replication, recovery and the concurrency
//! harness without a MySQL server:
//!
//! - writes inside a transaction are staged and become visible on commit
//! - row writes and `FOR UPDATE` reads take exclusive row locks held to
//!   commit, waiting at most `lock_wait_timeout`
//! - `FOR UPDATE` on the key maximum and every insert take a table-wide key
//!   lock, the way InnoDB gap locks serialize inserts at the end of an index
//! - REPEATABLE READ and SERIALIZABLE read from a snapshot taken at the
//!   first read; SERIALIZABLE plain reads also lock the row
//! - a node can be taken offline; every statement then fails as
//!   unavailable, including commits of open transactions
//!
//! READ UNCOMMITTED behaves as READ COMMITTED and deadlocks surface as lock
//! wait timeouts.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as LockCell, OwnedMutexGuard};

use super::config::{NodeConfig, NodeId};
use super::errors::{NodeError, NodeResult};
use super::isolation::IsolationLevel;
use super::mutation::Mutation;
use super::session::{Connector, LogQuery, NodeSession, ReadMode};
use crate::model::{sort_titles, Title, TitleFilter, TitleId, TitleQuery};
use crate::txlog::{TransactionId, TransactionLogEntry, TxStatus};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct NodeState {
    titles: BTreeMap<TitleId, Title>,
    log: Vec<TransactionLogEntry>,
}

/// One in-process node.
pub struct MemoryNode {
    id: NodeId,
    online: AtomicBool,
    state: Mutex<NodeState>,
    key_lock: Arc<LockCell<()>>,
    row_locks: Mutex<HashMap<TitleId, Arc<LockCell<()>>>>,
    lock_wait_timeout: Duration,
}

impl MemoryNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            online: AtomicBool::new(true),
            state: Mutex::new(NodeState::default()),
            key_lock: Arc::new(LockCell::new(())),
            row_locks: Mutex::new(HashMap::new()),
            lock_wait_timeout: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Committed titles in key order.
    pub fn titles(&self) -> Vec<Title> {
        self.state.lock().titles.values().cloned().collect()
    }

    pub fn title(&self, id: &TitleId) -> Option<Title> {
        self.state.lock().titles.get(id).cloned()
    }

    /// Stores a committed row directly, bypassing sessions.
    pub fn seed(&self, title: Title) {
        self.state.lock().titles.insert(title.id.clone(), title);
    }

    pub fn log_entries(&self) -> Vec<TransactionLogEntry> {
        self.state.lock().log.clone()
    }

    fn check_online(&self) -> NodeResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(NodeError::unavailable(&self.id, "node is offline"))
        }
    }

    fn row_lock(&self, id: &TitleId) -> Arc<LockCell<()>> {
        self.row_locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(LockCell::new(())))
            .clone()
    }
}

/// Connector over a fixed set of in-process nodes.
#[derive(Default, Clone)]
pub struct MemoryConnector {
    nodes: HashMap<NodeId, Arc<MemoryNode>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// One fresh node per configured node.
    pub fn for_nodes(nodes: &[NodeConfig]) -> Self {
        nodes.iter().fold(Self::new(), |connector, node| {
            connector.with_node(MemoryNode::new(node.id.as_str()))
        })
    }

    pub fn with_node(mut self, node: MemoryNode) -> Self {
        self.nodes.insert(node.id.clone(), Arc::new(node));
        self
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<MemoryNode>> {
        self.nodes.get(id).cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        node: &NodeConfig,
        isolation: IsolationLevel,
    ) -> NodeResult<Box<dyn NodeSession>> {
        let engine = self
            .nodes
            .get(&node.id)
            .cloned()
            .ok_or_else(|| NodeError::unknown_node(&node.id))?;
        engine.check_online()?;
        Ok(Box::new(MemorySession::new(engine, isolation)))
    }
}

/// Session over a `MemoryNode`.
pub struct MemorySession {
    node: Arc<MemoryNode>,
    isolation: IsolationLevel,
    in_tx: bool,
    staged: BTreeMap<TitleId, Option<Title>>,
    snapshot: Option<BTreeMap<TitleId, Title>>,
    row_guards: HashMap<TitleId, OwnedMutexGuard<()>>,
    key_guard: Option<OwnedMutexGuard<()>>,
}

impl MemorySession {
    fn new(node: Arc<MemoryNode>, isolation: IsolationLevel) -> Self {
        Self {
            node,
            isolation,
            in_tx: false,
            staged: BTreeMap::new(),
            snapshot: None,
            row_guards: HashMap::new(),
            key_guard: None,
        }
    }

    fn reset(&mut self) {
        self.in_tx = false;
        self.staged.clear();
        self.snapshot = None;
        self.row_guards.clear();
        self.key_guard = None;
    }

    async fn wait_for(&self, cell: Arc<LockCell<()>>, what: &str) -> NodeResult<OwnedMutexGuard<()>> {
        tokio::time::timeout(self.node.lock_wait_timeout, cell.lock_owned())
            .await
            .map_err(|_| {
                NodeError::lock_timeout(
                    &self.node.id,
                    format!("lock wait timeout exceeded on {}", what),
                )
            })
    }

    /// Row lock for the current statement. Inside a transaction the lock is
    /// kept until commit and `None` is returned.
    async fn lock_row(&mut self, id: &TitleId) -> NodeResult<Option<OwnedMutexGuard<()>>> {
        if self.row_guards.contains_key(id) {
            return Ok(None);
        }
        let guard = self
            .wait_for(self.node.row_lock(id), &format!("row {}", id))
            .await?;
        if self.in_tx {
            self.row_guards.insert(id.clone(), guard);
            Ok(None)
        } else {
            Ok(Some(guard))
        }
    }

    async fn lock_keys(&mut self) -> NodeResult<Option<OwnedMutexGuard<()>>> {
        if self.key_guard.is_some() {
            return Ok(None);
        }
        let guard = self
            .wait_for(self.node.key_lock.clone(), "titles key range")
            .await?;
        if self.in_tx {
            self.key_guard = Some(guard);
            Ok(None)
        } else {
            Ok(Some(guard))
        }
    }

    fn stable_reads(&self) -> bool {
        self.in_tx && self.isolation.has_stable_reads()
    }

    fn take_snapshot(&mut self) {
        if self.stable_reads() && self.snapshot.is_none() {
            self.snapshot = Some(self.node.state.lock().titles.clone());
        }
    }

    /// Latest committed row overlaid with this session's own writes.
    fn current(&self, id: &TitleId) -> Option<Title> {
        match self.staged.get(id) {
            Some(staged) => staged.clone(),
            None => self.node.state.lock().titles.get(id).cloned(),
        }
    }

    /// Row as seen by a plain read.
    fn visible(&self, id: &TitleId) -> Option<Title> {
        if let Some(staged) = self.staged.get(id) {
            return staged.clone();
        }
        match &self.snapshot {
            Some(snapshot) => snapshot.get(id).cloned(),
            None => self.node.state.lock().titles.get(id).cloned(),
        }
    }

    fn visible_rows(&self) -> Vec<Title> {
        let mut rows = match &self.snapshot {
            Some(snapshot) => snapshot.clone(),
            None => self.node.state.lock().titles.clone(),
        };
        for (id, staged) in &self.staged {
            match staged {
                Some(title) => {
                    rows.insert(id.clone(), title.clone());
                }
                None => {
                    rows.remove(id);
                }
            }
        }
        rows.into_values().collect()
    }

    fn write(&mut self, id: &TitleId, row: Option<Title>) {
        if self.in_tx {
            self.staged.insert(id.clone(), row);
        } else {
            let mut state = self.node.state.lock();
            match row {
                Some(title) => state.titles.insert(id.clone(), title),
                None => state.titles.remove(id),
            };
        }
    }

    fn stamp(explicit: Option<DateTime<Utc>>) -> DateTime<Utc> {
        explicit.unwrap_or_else(|| Utc::now().trunc_subsecs(0))
    }
}

#[async_trait]
impl NodeSession for MemorySession {
    fn node_id(&self) -> &NodeId {
        &self.node.id
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn ping(&mut self) -> NodeResult<()> {
        self.node.check_online()
    }

    async fn begin(&mut self) -> NodeResult<()> {
        self.node.check_online()?;
        if self.in_tx {
            self.commit().await?;
        }
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> NodeResult<()> {
        if let Err(err) = self.node.check_online() {
            self.reset();
            return Err(err);
        }
        let staged = std::mem::take(&mut self.staged);
        {
            let mut state = self.node.state.lock();
            for (id, row) in staged {
                match row {
                    Some(title) => state.titles.insert(id, title),
                    None => state.titles.remove(&id),
                };
            }
        }
        self.reset();
        Ok(())
    }

    async fn rollback(&mut self) -> NodeResult<()> {
        self.reset();
        Ok(())
    }

    async fn apply(&mut self, mutation: &Mutation) -> NodeResult<u64> {
        self.node.check_online()?;
        let id = mutation.record_id().clone();

        let _key_guard = match mutation {
            Mutation::Insert { .. } => self.lock_keys().await?,
            _ => None,
        };
        let _row_guard = self.lock_row(&id).await?;
        let existing = self.current(&id);

        match mutation {
            Mutation::Insert {
                fields,
                last_updated,
                ..
            } => {
                if existing.is_some() && last_updated.is_none() {
                    return Err(NodeError::constraint(
                        &self.node.id,
                        format!("duplicate entry '{}' for key 'PRIMARY'", id),
                    ));
                }
                let row = fields.clone().into_title(id.clone(), Self::stamp(*last_updated));
                self.write(&id, Some(row));
                Ok(1)
            }
            Mutation::Update {
                changes,
                last_updated,
                ..
            } => match existing {
                Some(current) => {
                    let row = changes.apply_to(&current, Self::stamp(*last_updated));
                    self.write(&id, Some(row));
                    Ok(1)
                }
                None => Ok(0),
            },
            Mutation::Delete { .. } => match existing {
                Some(_) => {
                    self.write(&id, None);
                    Ok(1)
                }
                None => Ok(0),
            },
        }
    }

    async fn fetch_title(&mut self, id: &TitleId, mode: ReadMode) -> NodeResult<Option<Title>> {
        self.node.check_online()?;
        let locking = mode == ReadMode::ForUpdate
            || (self.in_tx && self.isolation == IsolationLevel::Serializable);
        if locking {
            let _guard = self.lock_row(id).await?;
            if mode == ReadMode::ForUpdate {
                return Ok(self.current(id));
            }
        }
        self.take_snapshot();
        Ok(self.visible(id))
    }

    async fn max_title_number(&mut self, mode: ReadMode) -> NodeResult<Option<u64>> {
        self.node.check_online()?;
        let _guard = match mode {
            ReadMode::ForUpdate => self.lock_keys().await?,
            ReadMode::Plain => {
                self.take_snapshot();
                None
            }
        };
        let rows = if mode == ReadMode::ForUpdate {
            let mut committed = self.node.state.lock().titles.clone();
            for (id, staged) in &self.staged {
                match staged {
                    Some(title) => committed.insert(id.clone(), title.clone()),
                    None => committed.remove(id),
                };
            }
            committed.into_values().collect()
        } else {
            self.visible_rows()
        };
        Ok(rows.iter().filter_map(|t| t.id.number()).max())
    }

    async fn query_titles(&mut self, query: &TitleQuery) -> NodeResult<Vec<Title>> {
        self.node.check_online()?;
        self.take_snapshot();
        let mut rows: Vec<Title> = self
            .visible_rows()
            .into_iter()
            .filter(|t| query.filter.matches(t))
            .collect();
        sort_titles(&mut rows, query.sort);
        Ok(match query.window {
            Some(window) => window.apply(rows),
            None => rows,
        })
    }

    async fn count_titles(&mut self, filter: &TitleFilter) -> NodeResult<u64> {
        self.node.check_online()?;
        self.take_snapshot();
        Ok(self
            .visible_rows()
            .iter()
            .filter(|t| filter.matches(t))
            .count() as u64)
    }

    async fn append_log(&mut self, entry: &TransactionLogEntry) -> NodeResult<()> {
        self.node.check_online()?;
        self.node.state.lock().log.push(entry.clone());
        Ok(())
    }

    async fn set_log_status(
        &mut self,
        id: &TransactionId,
        status: TxStatus,
        error: Option<&str>,
    ) -> NodeResult<bool> {
        self.node.check_online()?;
        let mut state = self.node.state.lock();
        let entry = state
            .log
            .iter_mut()
            .find(|e| e.transaction_id == *id && e.status == TxStatus::Pending);
        Ok(match entry {
            Some(entry) => {
                entry.status = status;
                entry.updated_at = Utc::now();
                if let Some(error) = error {
                    entry.error_message = Some(error.to_string());
                }
                true
            }
            None => false,
        })
    }

    async fn bump_log_retry(&mut self, id: &TransactionId) -> NodeResult<bool> {
        self.node.check_online()?;
        let mut state = self.node.state.lock();
        Ok(match state.log.iter_mut().find(|e| e.transaction_id == *id) {
            Some(entry) => {
                entry.retry_count += 1;
                entry.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn select_logs(&mut self, query: LogQuery) -> NodeResult<Vec<TransactionLogEntry>> {
        self.node.check_online()?;
        let state = self.node.state.lock();
        Ok(match query {
            LogQuery::Pending => with_status(&state.log, TxStatus::Pending),
            LogQuery::Failed => with_status(&state.log, TxStatus::Failed),
            LogQuery::Recent(limit) => state.log.iter().rev().take(limit as usize).cloned().collect(),
        })
    }

    async fn ensure_schema(&mut self) -> NodeResult<()> {
        self.node.check_online()
    }
}

fn with_status(log: &[TransactionLogEntry], status: TxStatus) -> Vec<TransactionLogEntry> {
    log.iter().filter(|e| e.status == status).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTitle, TitleChanges, TitleType};

    fn connector() -> (MemoryConnector, NodeConfig) {
        let config = NodeConfig::central("central");
        let connector = MemoryConnector::for_nodes(std::slice::from_ref(&config));
        (connector, config)
    }

    fn heat() -> Mutation {
        Mutation::insert(TitleId::from_number(1), NewTitle::new(TitleType::Movie, "Heat"))
    }

    #[tokio::test]
    async fn test_autocommit_insert_and_fetch() {
        let (connector, config) = connector();
        let mut session = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();

        assert_eq!(session.apply(&heat()).await.unwrap(), 1);
        let row = session
            .fetch_title(&TitleId::from_number(1), ReadMode::Plain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.primary_title, "Heat");
        assert_eq!(session.max_title_number(ReadMode::Plain).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_constraint_error() {
        let (connector, config) = connector();
        let mut session = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        session.apply(&heat()).await.unwrap();

        let err = session.apply(&heat()).await.unwrap_err();
        assert_eq!(err.kind, crate::node::NodeErrorKind::Constraint);

        // Copies with an explicit stamp upsert instead.
        let stamp = Utc::now().trunc_subsecs(0);
        assert_eq!(session.apply(&heat().with_last_updated(stamp)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let (connector, config) = connector();
        let mut writer = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        let mut reader = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();

        writer.begin().await.unwrap();
        writer.apply(&heat()).await.unwrap();
        let id = TitleId::from_number(1);
        assert!(reader.fetch_title(&id, ReadMode::Plain).await.unwrap().is_none());

        writer.commit().await.unwrap();
        assert!(reader.fetch_title(&id, ReadMode::Plain).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let (connector, config) = connector();
        let node = connector.node(&config.id).unwrap();
        let mut session = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();

        session.begin().await.unwrap();
        session.apply(&heat()).await.unwrap();
        session.rollback().await.unwrap();
        assert!(node.titles().is_empty());
    }

    #[tokio::test]
    async fn test_repeatable_read_keeps_snapshot() {
        let (connector, config) = connector();
        let mut setup = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        setup.apply(&heat()).await.unwrap();
        let id = TitleId::from_number(1);

        let mut reader = connector.open(&config, IsolationLevel::RepeatableRead).await.unwrap();
        reader.begin().await.unwrap();
        let first = reader.fetch_title(&id, ReadMode::Plain).await.unwrap().unwrap();

        setup
            .apply(&Mutation::update(id.clone(), TitleChanges::runtime(170)))
            .await
            .unwrap();

        let second = reader.fetch_title(&id, ReadMode::Plain).await.unwrap().unwrap();
        assert_eq!(first, second);
        reader.commit().await.unwrap();

        let after = reader.fetch_title(&id, ReadMode::Plain).await.unwrap().unwrap();
        assert_eq!(after.runtime_minutes, Some(170));
    }

    #[tokio::test]
    async fn test_row_lock_wait_times_out() {
        let config = NodeConfig::central("central");
        let connector = MemoryConnector::new()
            .with_node(MemoryNode::new("central").with_lock_wait_timeout(Duration::from_millis(50)));
        let mut setup = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        setup.apply(&heat()).await.unwrap();
        let id = TitleId::from_number(1);

        let mut holder = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        holder.begin().await.unwrap();
        holder.fetch_title(&id, ReadMode::ForUpdate).await.unwrap();

        let mut waiter = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        waiter.begin().await.unwrap();
        let err = waiter
            .apply(&Mutation::update(id.clone(), TitleChanges::runtime(1)))
            .await
            .unwrap_err();
        assert!(err.is_lock_conflict());

        holder.commit().await.unwrap();
        assert_eq!(
            waiter
                .apply(&Mutation::update(id, TitleChanges::runtime(1)))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_offline_node_rejects_sessions_and_commits() {
        let (connector, config) = connector();
        let node = connector.node(&config.id).unwrap();
        let mut session = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        session.begin().await.unwrap();
        session.apply(&heat()).await.unwrap();

        node.set_online(false);
        assert!(session.commit().await.unwrap_err().is_unavailable());
        assert!(connector
            .open(&config, IsolationLevel::ReadCommitted)
            .await
            .err()
            .unwrap()
            .is_unavailable());

        node.set_online(true);
        assert!(node.titles().is_empty());
    }

    #[tokio::test]
    async fn test_log_status_only_moves_pending() {
        let (connector, config) = connector();
        let mut session = connector.open(&config, IsolationLevel::ReadCommitted).await.unwrap();
        let entry = TransactionLogEntry::new(
            NodeId::new("central"),
            NodeId::new("movies"),
            heat(),
            TxStatus::Pending,
            3,
        );
        session.append_log(&entry).await.unwrap();

        assert_eq!(session.select_logs(LogQuery::Pending).await.unwrap().len(), 1);
        assert!(session
            .set_log_status(&entry.transaction_id, TxStatus::Success, None)
            .await
            .unwrap());
        assert!(!session
            .set_log_status(&entry.transaction_id, TxStatus::Failed, Some("late"))
            .await
            .unwrap());
        assert!(session.select_logs(LogQuery::Pending).await.unwrap().is_empty());
        assert_eq!(session.select_logs(LogQuery::Recent(10)).await.unwrap().len(), 1);
    }
}
