//! Resource Loader (C7): turns a [`ResourceCorrection`] into materialized
//! archive blobs, then runs `activate()`/`specialize()` side effects (spec
//! §4.3). Grounded on the teacher's `BackEndArchitecture` trait boundary in
//! `backbone-lib/src/traits.rs` (an injected collaborator the middle layer
//! calls through without knowing its implementation) — generalized here from
//! "send game messages" to "fetch and cache opaque archive blobs", with a
//! de-dup map borrowed from the same share-a-future idiom `futures-util`
//! gives the teacher's connection retry loop via `FutureExt`.

use futures_util::future::Shared;
use futures_util::FutureExt;
use protocol::{ArchiveId, ResourceCorrection, SlotId};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceLoadError {
    #[error("fetch failed for archive {archive:?}: {detail}")]
    FetchFailed { archive: ArchiveId, detail: String },
    #[error("fetch timed out for archive {archive:?}")]
    FetchTimedOut { archive: ArchiveId },
    #[error("activation failed: {0}")]
    ActivationFailed(String),
}

/// Cache-first provider of opaque archive bytes. Implementations own their
/// own cache storage and corruption handling (spec §4.3: "cache corruption
/// auto-purges the bad entry and refetches").
#[async_trait::async_trait]
pub trait ResourceBlobProvider: Send + Sync {
    async fn fetch(&self, archive: &ArchiveId, url_suffix: Option<&str>) -> Result<Vec<u8>, String>;
}

type SharedFetch = Shared<Pin<Box<dyn std::future::Future<Output = Result<Arc<Vec<u8>>, String>> + Send>>>;

/// Per-attempt resource loader. Reset (a fresh instance constructed) on every
/// (re)attempt per spec §3's lifecycle table; the in-flight map only needs to
/// dedupe downloads *within* one attempt.
pub struct ResourceLoader {
    attempts_max: u32,
    fetch_timeout: Duration,
    in_flight: Mutex<HashMap<(ArchiveId, Option<String>), SharedFetch>>,
}

impl ResourceLoader {
    pub fn new(attempts_max: u32, fetch_timeout: Duration) -> Self {
        Self {
            attempts_max,
            fetch_timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches every slot named in `correction`, sharing a single in-flight
    /// task for any two slots requesting the same (archive, url suffix)
    /// pair (spec §8 Property 6).
    pub async fn load_all(
        &self,
        correction: &ResourceCorrection,
        provider: Arc<dyn ResourceBlobProvider>,
    ) -> Result<HashMap<SlotId, Vec<u8>>, ResourceLoadError> {
        let mut results = HashMap::new();
        for (slot, correction) in &correction.slots {
            let blob = self
                .fetch_with_retry(&correction.archive, correction.url_suffix.as_deref(), provider.clone())
                .await?;
            results.insert(slot.clone(), (*blob).clone());
            if let Some(patch) = &correction.patch {
                self.fetch_with_retry(patch, correction.url_suffix.as_deref(), provider.clone())
                    .await?;
            }
        }
        Ok(results)
    }

    async fn fetch_with_retry(
        &self,
        archive: &ArchiveId,
        url_suffix: Option<&str>,
        provider: Arc<dyn ResourceBlobProvider>,
    ) -> Result<Arc<Vec<u8>>, ResourceLoadError> {
        let mut last_err = None;
        for _attempt in 0..self.attempts_max {
            match self.fetch_deduped(archive, url_suffix, provider.clone()).await {
                Ok(blob) => return Ok(blob),
                Err(err) => last_err = Some(err),
            }
            // Drop any cached failure so the next attempt starts a fresh task.
            self.in_flight
                .lock()
                .await
                .remove(&(archive.clone(), url_suffix.map(str::to_string)));
        }
        Err(ResourceLoadError::FetchFailed {
            archive: archive.clone(),
            detail: last_err.unwrap_or_default(),
        })
    }

    async fn fetch_deduped(
        &self,
        archive: &ArchiveId,
        url_suffix: Option<&str>,
        provider: Arc<dyn ResourceBlobProvider>,
    ) -> Result<Arc<Vec<u8>>, String> {
        let key = (archive.clone(), url_suffix.map(str::to_string));
        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(key)
                .or_insert_with(|| {
                    let archive = archive.clone();
                    let url_suffix = url_suffix.map(str::to_string);
                    let timeout = self.fetch_timeout;
                    let fut: Pin<Box<dyn std::future::Future<Output = Result<Arc<Vec<u8>>, String>> + Send>> =
                        Box::pin(async move {
                            match tokio::time::timeout(
                                timeout,
                                provider.fetch(&archive, url_suffix.as_deref()),
                            )
                            .await
                            {
                                Ok(Ok(bytes)) => Ok(Arc::new(bytes)),
                                Ok(Err(e)) => Err(e),
                                Err(_) => Err("fetch timed out".to_string()),
                            }
                        });
                    fut.shared()
                })
                .clone()
        };
        shared.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait::async_trait]
    impl ResourceBlobProvider for CountingProvider {
        async fn fetch(&self, archive: &ArchiveId, _url_suffix: Option<&str>) -> Result<Vec<u8>, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                return Err("simulated failure".to_string());
            }
            Ok(format!("blob-for-{}", archive.0).into_bytes())
        }
    }

    fn correction_with_one_slot(archive: &str, suffix: Option<&str>) -> ResourceCorrection {
        let mut slots = std::collections::BTreeMap::new();
        slots.insert(
            SlotId("Player".to_string()),
            protocol::SlotCorrection {
                archive: ArchiveId(archive.to_string()),
                patch: None,
                url_suffix: suffix.map(str::to_string),
            },
        );
        ResourceCorrection {
            slots,
            language: None,
            version: Some(1),
        }
    }

    #[tokio::test]
    async fn loads_resources_for_every_slot() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let loader = ResourceLoader::new(3, Duration::from_secs(5));
        let correction = correction_with_one_slot("A", None);
        let result = loader.load_all(&correction, provider).await.unwrap();
        assert_eq!(
            result.get(&SlotId("Player".to_string())).unwrap(),
            b"blob-for-A"
        );
    }

    #[tokio::test]
    async fn retries_up_to_attempts_max_then_succeeds() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail_first_n: 2,
        });
        let loader = ResourceLoader::new(3, Duration::from_secs(5));
        let correction = correction_with_one_slot("A", None);
        let result = loader.load_all(&correction, provider).await.unwrap();
        assert!(result.contains_key(&SlotId("Player".to_string())));
    }

    #[tokio::test]
    async fn exhausting_attempts_reports_fetch_failed() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail_first_n: 10,
        });
        let loader = ResourceLoader::new(2, Duration::from_secs(5));
        let correction = correction_with_one_slot("A", None);
        let result = loader.load_all(&correction, provider).await;
        assert!(matches!(result, Err(ResourceLoadError::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn two_slots_same_archive_and_suffix_share_one_fetch() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let loader = ResourceLoader::new(1, Duration::from_secs(5));
        let mut slots = std::collections::BTreeMap::new();
        slots.insert(
            SlotId("Player".to_string()),
            protocol::SlotCorrection {
                archive: ArchiveId("Shared".to_string()),
                patch: None,
                url_suffix: None,
            },
        );
        slots.insert(
            SlotId("World".to_string()),
            protocol::SlotCorrection {
                archive: ArchiveId("Shared".to_string()),
                patch: None,
                url_suffix: None,
            },
        );
        let correction = ResourceCorrection {
            slots,
            language: None,
            version: None,
        };
        loader.load_all(&correction, provider.clone()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
