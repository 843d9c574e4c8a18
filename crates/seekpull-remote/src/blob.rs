//! A remote layer blob with concurrent random reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use reqwest::Url;
use seekpull_core::config::FetchConfig;
use seekpull_core::{ReadAt, Region, SeekpullError, SeekpullResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetcher::{HttpFetcher, Transport};
use crate::multipart::Part;
use crate::redact::redact_url;
use crate::region_set::RegionSet;

/// What a read needs to issue requests. Replaced wholesale, never mutated.
#[derive(Debug)]
struct FetchState {
    fetcher: Arc<HttpFetcher>,
    /// Set once the server rejected a multi-range request.
    single_range: bool,
}

/// A registry blob, readable at arbitrary offsets.
///
/// Every read is its own request; concurrent reads of the same bytes are not
/// coalesced. A 401/403 triggers one URL re-resolution and a single retry.
/// A 400 on a multi-range request switches the blob to single-range mode for
/// the rest of its life.
#[derive(Debug)]
pub struct Blob {
    size: u64,
    state: ArcSwap<FetchState>,
    check_interval: Duration,
    last_check: Mutex<Option<Instant>>,
    fetched: Mutex<RegionSet>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

fn is_auth_failure(err: &SeekpullError) -> bool {
    matches!(err.status(), Some(401 | 403))
}

impl Blob {
    pub fn new(fetcher: HttpFetcher, config: &FetchConfig) -> Self {
        Blob {
            size: fetcher.size(),
            state: ArcSwap::from_pointee(FetchState {
                fetcher: Arc::new(fetcher),
                single_range: config.force_single_range,
            }),
            check_interval: config.check_interval(),
            last_check: Mutex::new(None),
            fetched: Mutex::new(RegionSet::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Resolve `url` through `transport` and open the blob behind it.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        url: Url,
        config: FetchConfig,
    ) -> SeekpullResult<Self> {
        let fetcher =
            HttpFetcher::resolve(transport, url, config.clone(), &CancellationToken::new()).await?;
        info!(url = %redact_url(fetcher.url()), size = fetcher.size(), "opened blob");
        Ok(Self::new(fetcher, &config))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current storage URL, redacted.
    pub fn url(&self) -> String {
        redact_url(self.state.load().fetcher.url())
    }

    pub fn is_single_range(&self) -> bool {
        self.state.load().single_range
    }

    /// Bytes successfully delivered so far, each counted once.
    pub fn fetched_size(&self) -> u64 {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_size()
    }

    fn ensure_open(&self) -> SeekpullResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SeekpullError::Closed);
        }
        Ok(())
    }

    fn install(&self, fetcher: HttpFetcher) -> SeekpullResult<()> {
        if fetcher.size() != self.size {
            return Err(SeekpullError::protocol(format!(
                "blob size changed from {} to {}",
                self.size,
                fetcher.size()
            )));
        }
        let fetcher = Arc::new(fetcher);
        self.state.rcu(|cur| FetchState {
            fetcher: fetcher.clone(),
            single_range: cur.single_range,
        });
        Ok(())
    }

    /// Swap in a freshly resolved fetcher. The blob's size must not change.
    pub fn refresh(&self, fetcher: HttpFetcher) -> SeekpullResult<()> {
        self.ensure_open()?;
        self.install(fetcher)?;
        debug!(url = %self.url(), "refreshed blob fetcher");
        Ok(())
    }

    async fn reresolve(&self, failed: &HttpFetcher, cancel: &CancellationToken) -> SeekpullResult<()> {
        let fresh = failed.reresolve(cancel).await.map_err(|e| match e.status() {
            Some(status @ (401 | 403)) => SeekpullError::Auth {
                url: redact_url(failed.url()),
                status,
            },
            _ => e,
        })?;
        self.install(fresh)
    }

    /// Revalidate the blob URL, at most once per check interval.
    ///
    /// Only a successful probe resets the interval.
    pub async fn check(&self) -> SeekpullResult<()> {
        self.ensure_open()?;
        let due = self
            .last_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(true, |t| t.elapsed() >= self.check_interval);
        if !due {
            return Ok(());
        }

        let fetcher = self.state.load_full().fetcher.clone();
        match fetcher.probe(&self.shutdown).await {
            Ok(()) => {}
            Err(e) if is_auth_failure(&e) => {
                warn!(url = %redact_url(fetcher.url()), error = %e, "probe rejected, re-resolving");
                self.reresolve(&fetcher, &self.shutdown).await?;
                let current = self.state.load_full().fetcher.clone();
                current.probe(&self.shutdown).await.map_err(|e| match e.status() {
                    Some(status @ (401 | 403)) => SeekpullError::Auth {
                        url: redact_url(current.url()),
                        status,
                    },
                    _ => e,
                })?;
            }
            Err(e) => return Err(e),
        }

        *self
            .last_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        Ok(())
    }

    /// Stop accepting reads and cancel the ones in flight. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            debug!(url = %self.url(), "closed blob");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn fetch_parts(
        &self,
        merged: &RegionSet,
        cancel: &CancellationToken,
    ) -> SeekpullResult<Vec<Part>> {
        let mut reresolved = false;
        let mut fell_back = false;
        loop {
            let state = self.state.load_full();
            let regions: Vec<Region> = if state.single_range {
                merged.super_region().into_iter().collect()
            } else {
                merged.regions().to_vec()
            };

            let err = match state.fetcher.fetch(&regions, cancel).await {
                Ok(parts) => return Ok(parts),
                Err(e) => e,
            };

            match err.status() {
                Some(status @ (401 | 403)) => {
                    if reresolved {
                        return Err(SeekpullError::Auth {
                            url: redact_url(state.fetcher.url()),
                            status,
                        });
                    }
                    reresolved = true;
                    warn!(
                        url = %redact_url(state.fetcher.url()),
                        status,
                        "blob URL rejected, re-resolving"
                    );
                    self.reresolve(&state.fetcher, cancel).await?;
                }
                Some(400) if regions.len() > 1 && !fell_back => {
                    fell_back = true;
                    warn!(
                        url = %redact_url(state.fetcher.url()),
                        regions = regions.len(),
                        "multi-range request rejected, switching to single-range mode"
                    );
                    self.state.rcu(|cur| FetchState {
                        fetcher: cur.fetcher.clone(),
                        single_range: true,
                    });
                }
                _ => return Err(err),
            }
        }
    }

    /// Fill `dest` with `requested` regions laid out back to back, using one
    /// request for all of them.
    pub async fn fetch_regions(
        &self,
        requested: &[Region],
        dest: &mut [u8],
        cancel: &CancellationToken,
    ) -> SeekpullResult<()> {
        self.ensure_open()?;
        if requested.is_empty() {
            return Err(SeekpullError::protocol("no regions requested"));
        }
        if let Some(r) = requested.iter().find(|r| r.end >= self.size) {
            return Err(SeekpullError::config(format!(
                "region {r} beyond blob of {} bytes",
                self.size
            )));
        }

        let merged: RegionSet = requested.iter().copied().collect();
        let parts = self.fetch_parts(&merged, cancel).await?;

        let mut writer = RegionWriter::new(requested, dest)?;
        for part in &parts {
            writer.write(part)?;
        }
        writer.finish()?;

        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(merged.regions().iter().copied());
        Ok(())
    }

    /// [`ReadAt::read_at`] with an explicit cancellation token.
    pub async fn read_at_with(
        &self,
        buf: &mut [u8],
        offset: u64,
        cancel: &CancellationToken,
    ) -> SeekpullResult<usize> {
        self.ensure_open()?;
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(self.size - offset);
        let region = Region::new(offset, offset + len - 1);
        self.fetch_regions(&[region], &mut buf[..len as usize], cancel)
            .await?;
        Ok(len as usize)
    }
}

/// Span reads fan out through the default `read_regions`: one request per
/// region, issued concurrently.
impl ReadAt for Blob {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SeekpullResult<usize> {
        self.read_at_with(buf, offset, &self.shutdown).await
    }
}

/// Copies delivered parts into the caller's buffer by absolute offset.
struct RegionWriter<'a> {
    targets: Vec<(Region, usize, RegionSet)>,
    dest: &'a mut [u8],
}

impl<'a> RegionWriter<'a> {
    fn new(requested: &[Region], dest: &'a mut [u8]) -> SeekpullResult<Self> {
        let mut targets = Vec::with_capacity(requested.len());
        let mut at = 0usize;
        for r in requested {
            targets.push((*r, at, RegionSet::new()));
            at += r.size() as usize;
        }
        if at != dest.len() {
            return Err(SeekpullError::protocol(format!(
                "buffer of {} bytes for regions totalling {at}",
                dest.len()
            )));
        }
        Ok(RegionWriter { targets, dest })
    }

    fn write(&mut self, part: &Part) -> SeekpullResult<()> {
        if part.data.len() as u64 != part.region.size() {
            return Err(SeekpullError::ShortRead {
                expected: part.region.size(),
                actual: part.data.len() as u64,
            });
        }
        for (target, dest_offset, covered) in &mut self.targets {
            let Some(overlap) = part.region.intersect(target) else {
                continue;
            };
            let src = (overlap.begin - part.region.begin) as usize;
            let dst = *dest_offset + (overlap.begin - target.begin) as usize;
            let n = overlap.size() as usize;
            self.dest[dst..dst + n].copy_from_slice(&part.data[src..src + n]);
            covered.add(overlap);
        }
        Ok(())
    }

    fn finish(self) -> SeekpullResult<()> {
        for (target, _, covered) in &self.targets {
            if covered.total_size() != target.size() {
                return Err(SeekpullError::ShortRead {
                    expected: target.size(),
                    actual: covered.total_size(),
                });
            }
        }
        Ok(())
    }
}
