use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

/// Connection state of one account. Written only by the account's own loop;
/// the registry keeps a shared read-only view for stats.
#[derive(Debug, Default)]
pub struct Connection {
    reconnect_count: AtomicU32,
    connected: AtomicBool,
}

impl Connection {
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// One configured bot identity on one protocol. Clones share connection
/// state.
#[derive(Debug, Clone)]
pub struct Account {
    /// `<protocol>#<ordinal>`, also the adapter identity in the dispatch table.
    pub id: String,
    pub protocol: &'static str,
    /// Ordinal among the accounts of the same protocol, from 0.
    pub ordinal: usize,
    /// Opaque, protocol-specific (`token` or `app_id:secret`).
    pub credential: String,
    pub command_prefix: String,
    connection: Arc<Connection>,
}

impl Account {
    pub fn new(protocol: &'static str, ordinal: usize, credential: &str, prefix: &str) -> Self {
        Self {
            id: format!("{}#{}", protocol, ordinal),
            protocol,
            ordinal,
            credential: credential.to_string(),
            command_prefix: prefix.to_string(),
            connection: Arc::new(Connection::default()),
        }
    }

    /// One account per non-empty comma-separated credential.
    pub fn parse_csv(protocol: &'static str, csv: &str, prefix: &str) -> Vec<Account> {
        csv.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .enumerate()
            .map(|(ordinal, credential)| Account::new(protocol, ordinal, credential, prefix))
            .collect()
    }

    /// Count a (re)connect attempt.
    pub fn begin_attempt(&mut self) -> u32 {
        self.connection.reconnect_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connection.connected.store(connected, Ordering::Relaxed);
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// What the registry knows about an account.
#[derive(Debug, Clone)]
pub struct AccountView {
    pub id: String,
    connection: Arc<Connection>,
}

impl AccountView {
    pub fn reconnect_count(&self) -> u32 {
        self.connection.reconnect_count()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}

/// Process-wide, append-only collection of accounts.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: Mutex<Vec<AccountView>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, account: &Account) {
        info!(account = %account.id, "Registered account");
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(AccountView {
                id: account.id.clone(),
                connection: Arc::clone(&account.connection),
            });
    }

    pub fn snapshot(&self) -> Vec<AccountView> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn connected_count(&self) -> usize {
        self.snapshot().iter().filter(|a| a.is_connected()).count()
    }
}
