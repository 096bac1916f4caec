use crate::coordinator::SyncEvent;
use crate::error::ServiceError;
use statline_aggregate::{aggregate, DateRange, Granularity, Series};
use statline_core::{CategoryId, RangeError, Record};
use statline_storage::cache::{CacheStats, QuerySignature, ReadThroughCache};
use statline_storage::SharedStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read-side facade over one store: cached queries plus aggregation.
#[derive(Clone)]
pub struct ActivityService {
    store: SharedStore,
    cache: Arc<ReadThroughCache<Vec<Record>>>,
}

impl ActivityService {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self {
            store,
            cache: Arc::new(ReadThroughCache::new(ttl)),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn get_by_category(
        &self,
        category_id: CategoryId,
    ) -> Result<Arc<Vec<Record>>, ServiceError> {
        self.cache.get(QuerySignature::category(category_id), None, || {
            self.store
                .query_by_category(category_id)
                .map_err(ServiceError::from)
        })
    }

    pub fn get_by_category_range(
        &self,
        category_id: CategoryId,
        from: i64,
        to: i64,
    ) -> Result<Arc<Vec<Record>>, ServiceError> {
        if from > to {
            return Err(RangeError::Inverted { from, to }.into());
        }
        self.cache
            .get(QuerySignature::range(category_id, from, to), None, || {
                self.store
                    .query_by_category_and_range(category_id, from, to)
                    .map_err(ServiceError::from)
            })
    }

    /// Drops cached reads for one category, or everything when `None`.
    pub fn invalidate(&self, category_id: Option<CategoryId>) -> usize {
        match category_id {
            Some(category_id) => self.cache.invalidate_category(category_id),
            None => self.cache.invalidate_all(),
        }
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.cache.set_ttl(ttl);
    }

    pub fn ttl(&self) -> Duration {
        self.cache.ttl()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn aggregate<F>(
        &self,
        records: &[Record],
        granularity: Granularity,
        selector: F,
        range: &DateRange,
    ) -> Series
    where
        F: Fn(&Record) -> f64,
    {
        aggregate(records, granularity, selector, range)
    }

    /// Cached category read followed by aggregation.
    pub fn series<F>(
        &self,
        category_id: CategoryId,
        window: Option<(i64, i64)>,
        granularity: Granularity,
        selector: F,
        range: &DateRange,
    ) -> Result<Series, ServiceError>
    where
        F: Fn(&Record) -> f64,
    {
        let records = match window {
            Some((from, to)) => self.get_by_category_range(category_id, from, to)?,
            None => self.get_by_category(category_id)?,
        };
        Ok(self.aggregate(&records, granularity, selector, range))
    }

    /// Invalidates the whole cache every time a sync finalizes. The task ends
    /// when the event channel closes.
    pub fn watch_sync(&self, mut events: broadcast::Receiver<SyncEvent>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::Finished { outcome }) => {
                        let dropped = service.invalidate(None);
                        debug!(
                            event = "cache_invalidated",
                            store = service.store.name(),
                            correlation_id = %outcome.correlation_id,
                            status = %outcome.status,
                            dropped
                        );
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // A finish may have been among the missed events.
                        let dropped = service.invalidate(None);
                        warn!(
                            event = "cache_watch_lagged",
                            store = service.store.name(),
                            missed,
                            dropped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
