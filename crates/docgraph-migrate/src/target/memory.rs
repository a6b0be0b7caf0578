//! In-process target store.
//!
//! Records every statement it is given instead of writing anywhere.
//! Rehearsal runs use it to see exactly what a real run would send; tests
//! script failures and canned guard results through it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{TargetStore, Transaction, Vars};
use crate::error::{Error, Result};

type Responder = Arc<dyn Fn(&Vars) -> Result<Vec<serde_json::Value>> + Send + Sync>;

/// A statement the store accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    /// Statement text.
    pub query: String,
    /// Bound variables.
    pub vars: Vars,
    /// Whether it ran inside a committed transaction.
    pub transactional: bool,
}

/// Transaction lifecycle counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionLog {
    /// Transactions opened.
    pub begun: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Transactions rolled back.
    pub rolled_back: usize,
}

#[derive(Default)]
struct State {
    statements: Vec<ExecutedStatement>,
    attempts: usize,
    failing_calls: Vec<usize>,
    responders: Vec<(String, Responder)>,
    transactions: TransactionLog,
    closes: usize,
}

impl State {
    fn run(&mut self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        self.attempts += 1;
        if self.failing_calls.contains(&self.attempts) {
            return Err(Error::Execution(format!(
                "scripted failure on call {}",
                self.attempts
            )));
        }
        match self
            .responders
            .iter()
            .find(|(pattern, _)| query.contains(pattern.as_str()))
        {
            Some((_, respond)) => respond(vars),
            None => Ok(Vec::new()),
        }
    }
}

/// In-process target store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryStore")
            .field("statements", &state.statements.len())
            .field("attempts", &state.attempts)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers statements containing `pattern` with `respond`. The first
    /// matching pattern wins.
    pub fn on<F>(&self, pattern: &str, respond: F) -> &Self
    where
        F: Fn(&Vars) -> Result<Vec<serde_json::Value>> + Send + Sync + 'static,
    {
        self.lock()
            .responders
            .push((pattern.to_string(), Arc::new(respond)));
        self
    }

    /// Fails every statement containing `pattern`.
    pub fn fail_on(&self, pattern: &str) -> &Self {
        let owned = pattern.to_string();
        self.on(pattern, move |_| {
            Err(Error::Execution(format!("scripted failure for `{owned}`")))
        })
    }

    /// Fails the n-th statement (1-based, counting every attempt).
    pub fn fail_call(&self, n: usize) -> &Self {
        self.lock().failing_calls.push(n);
        self
    }

    /// Statements accepted so far, in order. Transactional statements
    /// appear only once committed.
    #[must_use]
    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.lock().statements.clone()
    }

    /// Number of statements attempted, including failures.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Transaction lifecycle counts.
    #[must_use]
    pub fn transactions(&self) -> TransactionLog {
        self.lock().transactions
    }

    /// Number of times the store was closed.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.lock().closes
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn execute(&self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        let mut state = self.lock();
        let rows = state.run(query, vars)?;
        state.statements.push(ExecutedStatement {
            query: query.to_string(),
            vars: vars.clone(),
            transactional: false,
        });
        Ok(rows)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        self.lock().transactions.begun += 1;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            pending: Vec::new(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.lock().closes += 1;
        Ok(())
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    pending: Vec<ExecutedStatement>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, query: &str, vars: &Vars) -> Result<Vec<serde_json::Value>> {
        let rows = self.store.lock().run(query, vars)?;
        self.pending.push(ExecutedStatement {
            query: query.to_string(),
            vars: vars.clone(),
            transactional: true,
        });
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { store, pending } = *self;
        let mut state = store.lock();
        debug!("memory store: committing {} statements", pending.len());
        state.transactions.committed += 1;
        state.statements.extend(pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut state = self.store.lock();
        debug!("memory store: discarding {} statements", self.pending.len());
        state.transactions.rolled_back += 1;
        Ok(())
    }
}
