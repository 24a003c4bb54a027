use std::sync::Arc;

use futures::future::select_all;
use tokio::sync::watch;

/// Hierarchical cancellation flag.
///
/// A child is cancelled when it, or any of its ancestors, is cancelled.
/// Cancelling a child never affects its parent.
#[derive(Clone, Debug)]
pub struct CancelToken {
    own: Arc<watch::Sender<bool>>,
    ancestors: Vec<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            own: Arc::new(tx),
            ancestors: Vec::new(),
        }
    }

    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.own.clone());
        let (tx, _) = watch::channel(false);
        Self {
            own: Arc::new(tx),
            ancestors,
        }
    }

    pub fn cancel(&self) {
        self.own.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.senders().any(|tx| *tx.borrow())
    }

    /// Resolves once this token or an ancestor is cancelled
    pub async fn cancelled(&self) {
        let waits = self.senders().map(|tx| {
            let mut rx = tx.subscribe();
            Box::pin(async move {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }

    fn senders(&self) -> impl Iterator<Item = &Arc<watch::Sender<bool>>> {
        std::iter::once(&self.own).chain(self.ancestors.iter())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
