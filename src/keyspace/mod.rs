//! # Keyspace
//!
//! A named grouping of column families with a replication strategy, a
//! user-defined-type registry, and a data directory. The replication
//! strategy is a capability contract consumed as a function from token to
//! endpoint set; ring topology computation happens elsewhere.

use crate::partitioner::Token;
use crate::schema::ColumnType;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Address of a replica, as handed back by the replication view.
pub type Endpoint = String;

/// Maps a token to the replicas responsible for it.
pub trait ReplicationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn replication_factor(&self) -> usize;

    /// The natural endpoints for a token, primary replica first.
    fn natural_endpoints(&self, token: Token) -> Vec<Endpoint>;
}

/// Walks the ring clockwise from the token's successor and takes the first
/// `rf` distinct endpoints.
pub struct SimpleStrategy {
    replication_factor: usize,
    /// Ring positions, sorted by token
    ring: Vec<(Token, Endpoint)>,
}

impl SimpleStrategy {
    pub fn new(replication_factor: usize, mut ring: Vec<(Token, Endpoint)>) -> Self {
        ring.sort_by_key(|(token, _)| *token);
        Self {
            replication_factor: replication_factor.max(1),
            ring,
        }
    }
}

impl ReplicationStrategy for SimpleStrategy {
    fn name(&self) -> &'static str {
        "SimpleStrategy"
    }

    fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    fn natural_endpoints(&self, token: Token) -> Vec<Endpoint> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let start = self
            .ring
            .partition_point(|(ring_token, _)| *ring_token < token);
        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(self.replication_factor);
        for i in 0..self.ring.len() {
            let (_, endpoint) = &self.ring[(start + i) % self.ring.len()];
            if !endpoints.contains(endpoint) {
                endpoints.push(endpoint.clone());
            }
            if endpoints.len() == self.replication_factor {
                break;
            }
        }
        endpoints
    }
}

/// Fields of a user-defined type.
pub type UserType = Vec<(String, ColumnType)>;

pub struct Keyspace {
    pub name: String,
    strategy: Arc<dyn ReplicationStrategy>,
    user_types: Mutex<BTreeMap<String, UserType>>,
    datadir: PathBuf,
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyspace")
            .field("name", &self.name)
            .field("datadir", &self.datadir)
            .finish()
    }
}

impl Keyspace {
    pub fn new(
        name: impl Into<String>,
        strategy: Arc<dyn ReplicationStrategy>,
        datadir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            strategy,
            user_types: Mutex::new(BTreeMap::new()),
            datadir,
        })
    }

    pub fn strategy(&self) -> &Arc<dyn ReplicationStrategy> {
        &self.strategy
    }

    pub fn datadir(&self) -> &PathBuf {
        &self.datadir
    }

    /// Directory a column family's sstables live in.
    pub fn column_family_datadir(&self, cf_name: &str) -> PathBuf {
        self.datadir.join(cf_name)
    }

    pub fn add_user_type(&self, name: impl Into<String>, fields: UserType) {
        self.user_types
            .lock()
            .expect("user types poisoned")
            .insert(name.into(), fields);
    }

    pub fn user_type(&self, name: &str) -> Option<UserType> {
        self.user_types
            .lock()
            .expect("user types poisoned")
            .get(name)
            .cloned()
    }
}
