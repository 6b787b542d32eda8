//! Batching, pacing and retry around a [`VolumeResolver`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kwd_adapters::{ResolveContext, ResolveError, ResolvedBatch, VolumeResolver};
use kwd_core::{normalize_keyword, VolumeRow};
use kwd_storage::{BackoffPolicy, SimpleTokenBucket};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::stop::StopSignal;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-call timeout.
    pub timeout: Duration,
    /// `max_retries` extra attempts after the first call.
    pub backoff: BackoffPolicy,
    /// Optional override below the resolver's own limit.
    pub batch_size: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            batch_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostBatch {
    pub batch: usize,
    pub keywords: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveReport {
    pub rows: Vec<VolumeRow>,
    /// Normalized keywords whose batch came back; absent rows among these are zero-volume.
    pub resolved: HashSet<String>,
    pub lost: Vec<LostBatch>,
    pub notes: Vec<String>,
    pub calls: usize,
    pub stopped: bool,
}

/// Shared front door to the resolver. All categories go through the same gate.
pub struct VolumeGateway {
    resolver: Arc<dyn VolumeResolver>,
    gate: Arc<SimpleTokenBucket>,
    config: GatewayConfig,
}

impl VolumeGateway {
    pub fn new(
        resolver: Arc<dyn VolumeResolver>,
        gate: Arc<SimpleTokenBucket>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            resolver,
            gate,
            config,
        }
    }

    pub fn resolver(&self) -> &dyn VolumeResolver {
        self.resolver.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        let limit = self.resolver.max_batch_size().max(1);
        self.config.batch_size.map(|b| b.clamp(1, limit)).unwrap_or(limit)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<(T, usize), ResolveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResolveError>>,
    {
        let mut attempt = 0usize;
        loop {
            self.gate.take().await;
            let outcome = match tokio::time::timeout(self.config.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ResolveError::Timeout),
            };
            match outcome {
                Ok(value) => return Ok((value, attempt + 1)),
                Err(err) if err.is_transient() && attempt < self.config.backoff.max_retries => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying resolver call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolve `keywords` in resolver-sized batches.
    ///
    /// Fatal errors abort with `Err`. Batches that stay transient after retries, or
    /// fail with a protocol error, are recorded in `lost` and their keywords are left
    /// out of `resolved`. `stop` is checked between batches.
    pub async fn resolve(
        &self,
        keywords: &[String],
        ctx: &ResolveContext,
        stop: &StopSignal,
    ) -> Result<ResolveReport, ResolveError> {
        let mut report = ResolveReport::default();
        for (index, chunk) in keywords.chunks(self.batch_size()).enumerate() {
            if stop.is_stopped() {
                report.stopped = true;
                break;
            }
            let span = info_span!("resolve_batch", category_id = %ctx.category_id, batch = index, size = chunk.len());
            let result = self
                .with_retry("search_volume", || self.resolver.resolve_batch(chunk, ctx))
                .instrument(span)
                .await;
            match result {
                Ok((batch, calls)) => {
                    report.calls += calls;
                    self.absorb(&mut report, chunk, batch);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(category_id = %ctx.category_id, batch = index, keywords = chunk.len(), error = %err, "resolver batch lost");
                    report.lost.push(LostBatch {
                        batch: index,
                        keywords: chunk.len(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    fn absorb(&self, report: &mut ResolveReport, chunk: &[String], batch: ResolvedBatch) {
        if batch.rows.is_empty() {
            debug!(keywords = chunk.len(), "resolver returned no rows for batch");
        }
        match batch.incomplete {
            // Only keywords that came back are known; the rest stay pending.
            Some(note) => {
                warn!(note = %note, "resolver batch incomplete");
                report
                    .resolved
                    .extend(batch.rows.iter().map(|r| normalize_keyword(&r.keyword)));
                report.notes.push(note);
            }
            None => report
                .resolved
                .extend(chunk.iter().map(|k| normalize_keyword(k))),
        }
        report.rows.extend(batch.rows);
    }

    /// Discovery lookups share the gate and retry policy. Non-fatal failures yield nothing.
    pub async fn discover(
        &self,
        seeds: &[String],
        ctx: &ResolveContext,
    ) -> Result<Vec<VolumeRow>, ResolveError> {
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let span = info_span!("discover", category_id = %ctx.category_id, seeds = seeds.len());
        match self
            .with_retry("discovery", || self.resolver.discover(seeds, ctx))
            .instrument(span)
            .await
        {
            Ok((rows, _)) => Ok(rows),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(category_id = %ctx.category_id, error = %err, "discovery failed; continuing without it");
                Ok(Vec::new())
            }
        }
    }
}
