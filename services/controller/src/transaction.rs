//! Transaction context for correlating log lines.
//!
//! Every action runs inside a transaction carrying a short id and the name
//! of whatever started it. The context lives in a tokio task-local, so it
//! follows the future it scopes; the background scheduler carries it across
//! to its worker explicitly.

use std::future::Future;

use uuid::Uuid;

/// Reported by [`txid`] and [`source`] outside any transaction.
pub const NO_TRANSACTION: &str = "0";

tokio::task_local! {
    static CURRENT: TxContext;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub txid: String,
    pub source: String,
}

/// A transaction about to be entered.
#[derive(Debug, Clone)]
pub struct Transaction {
    context: TxContext,
}

impl Transaction {
    /// A fresh transaction with a random id.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            context: TxContext {
                txid: new_txid(),
                source: source.into(),
            },
        }
    }

    pub fn with_txid(mut self, txid: impl Into<String>) -> Self {
        self.context.txid = txid.into();
        self
    }

    pub fn context(&self) -> &TxContext {
        &self.context
    }

    /// Run `fut` inside this transaction. Inside an existing transaction the
    /// outer context is kept.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        if current().is_some() {
            fut.await
        } else {
            CURRENT.scope(self.context, fut).await
        }
    }
}

fn new_txid() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// The context of the transaction the current task is in.
pub fn current() -> Option<TxContext> {
    CURRENT.try_with(Clone::clone).ok()
}

pub fn txid() -> String {
    CURRENT
        .try_with(|c| c.txid.clone())
        .unwrap_or_else(|_| NO_TRANSACTION.to_string())
}

pub fn source() -> String {
    CURRENT
        .try_with(|c| c.source.clone())
        .unwrap_or_else(|_| NO_TRANSACTION.to_string())
}

/// Re-enter a captured context, e.g. on another task.
pub(crate) async fn resume<F: Future>(context: Option<TxContext>, fut: F) -> F::Output {
    match context {
        Some(context) => CURRENT.scope(context, fut).await,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outside_transaction() {
        assert_eq!(txid(), "0");
        assert_eq!(source(), "0");
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_txid_shape() {
        let tx = Transaction::new("api");
        let id = &tx.context().txid;
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_nested_keeps_outer() {
        let seen = Transaction::new("outer")
            .with_txid("aaaa0001")
            .run(async {
                Transaction::new("inner")
                    .run(async { (txid(), source()) })
                    .await
            })
            .await;
        assert_eq!(seen, ("aaaa0001".to_string(), "outer".to_string()));
        assert_eq!(txid(), "0");
    }

    #[tokio::test]
    async fn test_resume_on_other_task() {
        let context = Transaction::new("cli")
            .with_txid("bbbb0002")
            .run(async { current() })
            .await;

        let handle = tokio::spawn(resume(context, async { txid() }));
        assert_eq!(handle.await.unwrap(), "bbbb0002");
    }
}
