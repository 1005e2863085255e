//! Transaction coordination.
//!
//! A transaction hands the closure a store view that talks to the backend
//! transaction and buffers every cache effect. The buffer reaches the
//! parent cache only after a successful commit.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use tessera_core::{TesseraError, TesseraResult, TransactionOptions};

use crate::backend::BackendTransaction;
use crate::cache::BufferedCache;
use crate::store::Store;

impl Store {
    /// Run `f` inside a backend transaction.
    ///
    /// Any error from `f` rolls the transaction back and is returned
    /// unchanged, as is a commit conflict. Calling this on a transactional
    /// view fails with [`TesseraError::NestedTransaction`].
    pub async fn run_in_transaction<T, F, Fut>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> TesseraResult<T>
    where
        F: FnOnce(Store) -> Fut,
        Fut: Future<Output = TesseraResult<T>>,
    {
        if self.in_transaction() {
            return Err(TesseraError::NestedTransaction);
        }

        let txn: Arc<dyn BackendTransaction> =
            Arc::from(self.backend.begin_transaction(options).await?);
        let buffered = Arc::new(BufferedCache::new());
        let view = Store {
            txn: Some(txn.clone()),
            cache: buffered.clone(),
            ..self.clone()
        };

        match f(view).await {
            Ok(value) => {
                txn.commit().await?;
                let buffer = buffered.take();
                debug!(
                    puts = buffer.pending_puts().count(),
                    deletes = buffer.pending_deletes().count(),
                    "transaction committed"
                );
                buffer.reconcile(&self.direct).await;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "transaction rollback failed");
                }
                debug!(error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }
}
