//! Transactional in-memory register.
//!
//! A [`TransactionalRegister`] is a read/write-locked mapping from metric id
//! to a numeric value with scoped transactions: `read` takes the shared
//! lock and hands the closure a query-only view, `update` takes the
//! exclusive lock and hands it a mutating view. The guard lives for the
//! whole closure and is released on every exit path; the internal map never
//! escapes the transaction scope (callers asking for "all" get a clone).

use std::collections::HashMap;
use std::ops::AddAssign;
use tokio::sync::RwLock;

/// Lock-guarded mapping from id to numeric value plus its transaction API.
#[derive(Debug, Default)]
pub struct TransactionalRegister<T> {
    data: RwLock<HashMap<String, T>>,
}

/// Query-only view handed to `read` transactions.
pub struct TxQuery<'a, T> {
    data: &'a HashMap<String, T>,
}

impl<T: Clone> TxQuery<'_, T> {
    pub fn get(&self, name: &str) -> Option<T> {
        self.data.get(name).cloned()
    }

    pub fn get_all(&self) -> HashMap<String, T> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Mutating view handed to `update` transactions.
pub struct TxExec<'a, T> {
    data: &'a mut HashMap<String, T>,
}

impl<T: Clone> TxExec<'_, T> {
    pub fn get(&self, name: &str) -> Option<T> {
        self.data.get(name).cloned()
    }

    pub fn get_all(&self) -> HashMap<String, T> {
        self.data.clone()
    }

    pub fn set(&mut self, name: &str, v: T) {
        self.data.insert(name.to_string(), v);
    }

    /// Per-key overwrite; keys absent from `values` are left untouched.
    pub fn set_all(&mut self, values: HashMap<String, T>) {
        for (k, v) in values {
            self.data.insert(k, v);
        }
    }
}

impl<T: Clone + AddAssign> TxExec<'_, T> {
    /// Add `v` to the existing value, or insert `v` if absent. This is the
    /// source of truth for counter accumulation semantics.
    pub fn set_accum(&mut self, name: &str, v: T) {
        self.data
            .entry(name.to_string())
            .and_modify(|cur| *cur += v.clone())
            .or_insert(v);
    }

    pub fn set_accum_all(&mut self, values: HashMap<String, T>) {
        for (k, v) in values {
            self.data.entry(k).and_modify(|cur| *cur += v.clone()).or_insert(v);
        }
    }
}

impl<T> TransactionalRegister<T> {
    pub fn new() -> Self {
        Self { data: RwLock::new(HashMap::new()) }
    }

    /// Run `f` under the shared lock. The closure's return value (including
    /// a `Result`) propagates unchanged.
    pub async fn read<R>(&self, f: impl FnOnce(&TxQuery<'_, T>) -> R) -> R {
        let guard = self.data.read().await;
        f(&TxQuery { data: &guard })
    }

    /// Run `f` under the exclusive lock.
    pub async fn update<R>(&self, f: impl FnOnce(&mut TxExec<'_, T>) -> R) -> R {
        let mut guard = self.data.write().await;
        f(&mut TxExec { data: &mut guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_replaces_and_accum_accumulates() {
        let reg = TransactionalRegister::<i64>::new();

        reg.update(|tx| {
            tx.set("a", 5);
            tx.set("a", 7);
            tx.set_accum("b", 5);
            tx.set_accum("b", 7);
        })
        .await;

        let (a, b) = reg.read(|tx| (tx.get("a"), tx.get("b"))).await;
        assert_eq!(a, Some(7));
        assert_eq!(b, Some(12));
    }

    #[tokio::test]
    async fn write_then_read_within_one_transaction() {
        let reg = TransactionalRegister::<f64>::new();

        let seen = reg
            .update(|tx| {
                tx.set("x", 1.25);
                tx.get("x")
            })
            .await;
        assert_eq!(seen, Some(1.25));
    }

    #[tokio::test]
    async fn closure_error_propagates() {
        let reg = TransactionalRegister::<i64>::new();

        let res: Result<(), &str> = reg.update(|_tx| Err("boom")).await;
        assert_eq!(res, Err("boom"));

        // The lock was released despite the error.
        reg.update(|tx| tx.set("x", 1)).await;
        assert_eq!(reg.read(|tx| tx.get("x")).await, Some(1));
    }

    #[tokio::test]
    async fn get_all_is_a_snapshot() {
        let reg = TransactionalRegister::<i64>::new();
        reg.update(|tx| tx.set("a", 1)).await;

        let snapshot = reg.read(|tx| tx.get_all()).await;
        reg.update(|tx| tx.set("a", 2)).await;

        assert_eq!(snapshot.get("a"), Some(&1));
        assert_eq!(reg.read(|tx| tx.get("a")).await, Some(2));
    }

    #[tokio::test]
    async fn concurrent_accumulation_linearises() {
        let reg = Arc::new(TransactionalRegister::<i64>::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    reg.update(|tx| tx.set_accum("n", 1)).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(reg.read(|tx| tx.get("n")).await, Some(1600));
    }

    #[tokio::test]
    async fn set_all_merges_per_key() {
        let reg = TransactionalRegister::<i64>::new();
        reg.update(|tx| {
            tx.set("keep", 1);
            tx.set("overwrite", 1);
        })
        .await;

        let incoming = HashMap::from([("overwrite".to_string(), 9), ("new".to_string(), 3)]);
        reg.update(|tx| tx.set_all(incoming)).await;

        let all = reg.read(|tx| tx.get_all()).await;
        assert_eq!(all.get("keep"), Some(&1));
        assert_eq!(all.get("overwrite"), Some(&9));
        assert_eq!(all.get("new"), Some(&3));
    }

    #[tokio::test]
    async fn set_accum_all_sums_existing_keys() {
        let reg = TransactionalRegister::<i64>::new();
        reg.update(|tx| tx.set("c", 10)).await;

        let incoming = HashMap::from([("c".to_string(), 5), ("d".to_string(), 2)]);
        reg.update(|tx| tx.set_accum_all(incoming)).await;

        assert_eq!(reg.read(|tx| tx.get("c")).await, Some(15));
        assert_eq!(reg.read(|tx| tx.get("d")).await, Some(2));
    }
}
