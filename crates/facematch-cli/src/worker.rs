use facematch_core::{
    matcher, DimensionMismatch, Embedding, EuclideanMatcher, GalleryEntry, MatchError,
    MatchResult, MatchThreshold, Matcher, SampleCap,
};
use facematch_store::{EnrollmentRecord, EnrollmentStore, MigrationReport, StoreError, StoreStats};
use serde::Serialize;
use std::future::Future;
use std::num::NonZeroUsize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// Requests queued beyond this are refused by [`WorkerHandle::try_verify`].
const QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("enrollment {id}: {source}")]
    Match {
        id: i64,
        #[source]
        source: MatchError,
    },
    #[error("probe rejected: {0}")]
    Probe(#[from] DimensionMismatch),
    #[error("worker busy, request dropped")]
    Busy,
    #[error("worker thread exited")]
    ChannelClosed,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Duplicate handling for one enrollment.
#[derive(Debug, Clone, Copy)]
pub struct EnrollPolicy {
    pub duplicate_threshold: MatchThreshold,
    pub sample_cap: SampleCap,
    pub reject_duplicates: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrollOutcome {
    /// Stored. `similar` lists enrolled faces that were already close.
    Enrolled {
        record: EnrollmentRecord,
        similar: Vec<i64>,
    },
    /// Refused because similar faces exist.
    Duplicate { similar: Vec<i64> },
}

#[derive(Debug, Serialize)]
pub struct VerifyOutcome {
    pub id: i64,
    pub matched: bool,
    pub distance: f32,
}

#[derive(Debug, Serialize)]
pub struct SimilarOutcome {
    pub matches: Vec<i64>,
    pub evaluated: usize,
    pub pool: usize,
    /// Enrollments that could not be compared, with the reason.
    pub failures: Vec<(i64, String)>,
}

#[derive(Debug, Serialize)]
pub struct IdentifyOutcome {
    pub result: MatchResult<i64>,
    /// Enrollments left out of the gallery, with the reason.
    pub skipped: Vec<(i64, String)>,
}

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

/// Messages sent from callers to the worker thread.
enum Request {
    Enroll {
        identifier: String,
        probe: Embedding,
        policy: EnrollPolicy,
        reply: Reply<EnrollOutcome>,
    },
    Verify {
        id: i64,
        probe: Embedding,
        threshold: MatchThreshold,
        reply: Reply<VerifyOutcome>,
    },
    Similar {
        probe: Embedding,
        threshold: MatchThreshold,
        cap: SampleCap,
        reply: Reply<SimilarOutcome>,
    },
    Identify {
        probe: Embedding,
        threshold: MatchThreshold,
        reply: Reply<IdentifyOutcome>,
    },
    List {
        reply: Reply<Vec<EnrollmentRecord>>,
    },
    Stats {
        reply: Reply<StoreStats>,
    },
    Clear {
        reply: Reply<usize>,
    },
    Migrate {
        reply: Reply<MigrationReport>,
    },
}

/// Clone-safe handle to the worker thread.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Request>,
}

impl WorkerHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    /// Scan for similar faces, then store the probe unless policy refuses it.
    pub async fn enroll(
        &self,
        identifier: String,
        probe: Embedding,
        policy: EnrollPolicy,
    ) -> Result<EnrollOutcome, WorkerError> {
        self.call(|reply| Request::Enroll {
            identifier,
            probe,
            policy,
            reply,
        })
        .await
    }

    /// Compare a probe with one enrollment and record the attempt.
    pub async fn verify(
        &self,
        id: i64,
        probe: Embedding,
        threshold: MatchThreshold,
    ) -> Result<VerifyOutcome, WorkerError> {
        self.call(|reply| Request::Verify {
            id,
            probe,
            threshold,
            reply,
        })
        .await
    }

    /// Non-blocking [`verify`](Self::verify) for frame-rate producers.
    ///
    /// Fails with [`WorkerError::Busy`] instead of waiting when the queue is
    /// full, so the caller can drop the frame.
    pub fn try_verify(
        &self,
        id: i64,
        probe: Embedding,
        threshold: MatchThreshold,
    ) -> Result<impl Future<Output = Result<VerifyOutcome, WorkerError>>, WorkerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(Request::Verify {
                id,
                probe,
                threshold,
                reply,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => WorkerError::Busy,
                TrySendError::Closed(_) => WorkerError::ChannelClosed,
            })?;
        Ok(async move { reply_rx.await.map_err(|_| WorkerError::ChannelClosed)? })
    }

    pub async fn similar(
        &self,
        probe: Embedding,
        threshold: MatchThreshold,
        cap: SampleCap,
    ) -> Result<SimilarOutcome, WorkerError> {
        self.call(|reply| Request::Similar {
            probe,
            threshold,
            cap,
            reply,
        })
        .await
    }

    /// Nearest enrollment to the probe across the whole store.
    pub async fn identify(
        &self,
        probe: Embedding,
        threshold: MatchThreshold,
    ) -> Result<IdentifyOutcome, WorkerError> {
        self.call(|reply| Request::Identify {
            probe,
            threshold,
            reply,
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<EnrollmentRecord>, WorkerError> {
        self.call(|reply| Request::List { reply }).await
    }

    pub async fn stats(&self) -> Result<StoreStats, WorkerError> {
        self.call(|reply| Request::Stats { reply }).await
    }

    pub async fn clear(&self) -> Result<usize, WorkerError> {
        self.call(|reply| Request::Clear { reply }).await
    }

    pub async fn migrate(&self) -> Result<MigrationReport, WorkerError> {
        self.call(|reply| Request::Migrate { reply }).await
    }
}

/// Spawn the worker on a dedicated OS thread that owns the store.
///
/// Every probe is checked against `expected_dim` before it reaches the
/// store. The thread exits once all handles are dropped.
pub fn spawn_worker(
    store: EnrollmentStore,
    expected_dim: Option<NonZeroUsize>,
) -> Result<WorkerHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<Request>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facematch-worker".into())
        .spawn(move || {
            let mut worker = Worker {
                store,
                expected_dim,
            };
            tracing::info!("worker thread started");
            while let Some(req) = rx.blocking_recv() {
                worker.handle(req);
            }
            tracing::info!("worker thread exiting");
        })
        .map_err(WorkerError::Spawn)?;

    Ok(WorkerHandle { tx })
}

struct Worker {
    store: EnrollmentStore,
    expected_dim: Option<NonZeroUsize>,
}

impl Worker {
    fn handle(&mut self, req: Request) {
        // A dropped receiver means the caller gave up; nothing to do.
        match req {
            Request::Enroll {
                identifier,
                probe,
                policy,
                reply,
            } => {
                let _ = reply.send(self.enroll(&identifier, &probe, policy));
            }
            Request::Verify {
                id,
                probe,
                threshold,
                reply,
            } => {
                let _ = reply.send(self.verify(id, &probe, threshold));
            }
            Request::Similar {
                probe,
                threshold,
                cap,
                reply,
            } => {
                let _ = reply.send(self.similar(&probe, threshold, cap));
            }
            Request::Identify {
                probe,
                threshold,
                reply,
            } => {
                let _ = reply.send(self.identify(&probe, threshold));
            }
            Request::List { reply } => {
                let _ = reply.send(self.store.all().map_err(Into::into));
            }
            Request::Stats { reply } => {
                let _ = reply.send(self.store.stats().map_err(Into::into));
            }
            Request::Clear { reply } => {
                let _ = reply.send(self.store.clear().map_err(Into::into));
            }
            Request::Migrate { reply } => {
                let _ = reply.send(self.store.migrate_to_binary().map_err(Into::into));
            }
        }
    }

    fn check_probe(&self, probe: &Embedding) -> Result<(), WorkerError> {
        if let Some(dim) = self.expected_dim {
            probe.expect_dim(dim.get())?;
        }
        Ok(())
    }

    fn enroll(
        &mut self,
        identifier: &str,
        probe: &Embedding,
        policy: EnrollPolicy,
    ) -> Result<EnrollOutcome, WorkerError> {
        self.check_probe(probe)?;

        let scan = self.similar(probe, policy.duplicate_threshold, policy.sample_cap)?;
        if !scan.matches.is_empty() {
            tracing::info!(
                identifier,
                similar = ?scan.matches,
                evaluated = scan.evaluated,
                "enroll: similar faces found"
            );
            if policy.reject_duplicates {
                return Ok(EnrollOutcome::Duplicate {
                    similar: scan.matches,
                });
            }
        }

        let record = self.store.enroll(identifier, probe)?;
        Ok(EnrollOutcome::Enrolled {
            record,
            similar: scan.matches,
        })
    }

    /// A stored embedding that cannot be compared still counts as a failed
    /// attempt; the error goes back to the caller.
    fn verify(
        &mut self,
        id: i64,
        probe: &Embedding,
        threshold: MatchThreshold,
    ) -> Result<VerifyOutcome, WorkerError> {
        self.check_probe(probe)?;
        let record = self.store.get(id)?;

        match matcher::distance_to_stored(&record.embedding, probe.primary()) {
            Ok(distance) => {
                let matched = threshold.accepts(distance);
                self.store.record_verification(id, matched)?;
                tracing::info!(id, distance, threshold = threshold.get(), matched, "verify");
                Ok(VerifyOutcome {
                    id,
                    matched,
                    distance,
                })
            }
            Err(source) => {
                self.store.record_verification(id, false)?;
                tracing::warn!(id, error = %source, "verify: stored embedding unusable");
                Err(WorkerError::Match { id, source })
            }
        }
    }

    fn similar(
        &mut self,
        probe: &Embedding,
        threshold: MatchThreshold,
        cap: SampleCap,
    ) -> Result<SimilarOutcome, WorkerError> {
        self.check_probe(probe)?;
        let pool = self.store.candidates()?;
        let scan = matcher::scan_similar(&pool, probe.primary(), threshold, cap);

        for (id, e) in &scan.failures {
            tracing::warn!(id, error = %e, "similarity scan: skipped enrollment");
        }
        tracing::debug!(
            pool = pool.len(),
            evaluated = scan.evaluated,
            matches = scan.matches.len(),
            "similarity scan"
        );

        Ok(SimilarOutcome {
            matches: scan.matches,
            evaluated: scan.evaluated,
            pool: pool.len(),
            failures: scan
                .failures
                .into_iter()
                .map(|(id, e)| (id, e.to_string()))
                .collect(),
        })
    }

    fn identify(
        &mut self,
        probe: &Embedding,
        threshold: MatchThreshold,
    ) -> Result<IdentifyOutcome, WorkerError> {
        self.check_probe(probe)?;

        let mut gallery = Vec::new();
        let mut skipped = Vec::new();
        for record in self.store.all()? {
            match record.decode_embedding() {
                Ok(embedding) if embedding.dim() == probe.dim() => gallery.push(GalleryEntry {
                    identifier: record.id,
                    embedding,
                }),
                Ok(embedding) => {
                    let e = DimensionMismatch {
                        left: embedding.dim(),
                        right: probe.dim(),
                    };
                    tracing::warn!(id = record.id, error = %e, "identify: skipped enrollment");
                    skipped.push((record.id, e.to_string()));
                }
                Err(e) => {
                    tracing::warn!(id = record.id, error = %e, "identify: skipped enrollment");
                    skipped.push((record.id, e.to_string()));
                }
            }
        }

        let result = EuclideanMatcher.compare(probe.primary(), &gallery, threshold)?;
        Ok(IdentifyOutcome { result, skipped })
    }
}
