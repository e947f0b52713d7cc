//! The packer manager: serializes multi-producer blob puts into a bounded
//! set of concurrently built packfiles, uploads them, and records their
//! locations in the state.
//!
//! Shape: a bounded ingress channel feeds `P` workers, each owning at most
//! one open [`PackWriter`]; sealed writers flow to a single flusher which
//! pads, finalizes, envelopes, uploads and records deltas. Dedup happens
//! before enqueue through the [`InflightIndex`]; an entry is released only
//! once its packfile is durable. The packer retries nothing: the first
//! failure is delivered to `wait()` and the pipeline shuts down.

pub mod inflight;

pub use inflight::InflightIndex;

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::codec::{envelope, Pipeline};
use crate::error::{Error, Result};
use crate::hashing::Keys;
use crate::packfile::{BlobIndexEntry, PackWriter};
use crate::resource::{now_unix, Location, Mac, ResourceType};
use crate::state::{DeltaEntry, LocalState};

/// One blob travelling through the ingress channel, already encoded by
/// the codec pipeline.
pub struct PackerMsg {
    pub resource: ResourceType,
    pub version: u32,
    pub timestamp: i64,
    pub mac: Mac,
    pub data: Vec<u8>,
    pub flags: u32,
}

/// Everything the workers and flusher share.
pub(crate) struct PackerCtx {
    pub backend: Arc<dyn Backend>,
    pub pipeline: Arc<Pipeline>,
    pub keys: Keys,
    pub inflight: Arc<InflightIndex>,
    pub delta: LocalState,
    pub aggregated: LocalState,
    /// State id under which flushed packfiles are recorded.
    pub session: Mac,
    pub max_size: u64,
    /// Upper bound for padding blob sizes; the chunking minimum.
    pub pad_max: u64,
}

type SharedRx = Arc<Mutex<mpsc::Receiver<PackerMsg>>>;

pub struct PackerManager {
    tx: mpsc::Sender<PackerMsg>,
    cancel: watch::Sender<bool>,
    workers: Vec<JoinHandle<Result<()>>>,
    flusher: JoinHandle<Result<()>>,
}

impl PackerManager {
    /// Spawn `worker_count` packing workers and the flusher. The ingress
    /// channel is bounded at `2 * worker_count + 1`; senders block when
    /// it fills, which is the pipeline's backpressure.
    pub(crate) fn spawn(ctx: Arc<PackerCtx>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel(2 * worker_count + 1);
        let rx: SharedRx = Arc::new(Mutex::new(rx));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (sealed_tx, sealed_rx) = mpsc::channel(worker_count);

        let workers = (0..worker_count)
            .map(|_| {
                tokio::spawn(worker(
                    ctx.clone(),
                    rx.clone(),
                    sealed_tx.clone(),
                    cancel_rx.clone(),
                ))
            })
            .collect();
        drop(sealed_tx);

        let flusher = tokio::spawn(flusher(ctx, sealed_rx, cancel_rx));

        Self {
            tx,
            cancel: cancel_tx,
            workers,
            flusher,
        }
    }

    /// Enqueue one blob; returns as soon as the message is on the ingress
    /// channel. The caller must already hold the inflight reservation.
    pub(crate) async fn send(&self, msg: PackerMsg) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::Packer("ingress channel closed".into()))
    }

    /// Close the ingress channel, let workers seal their last writers,
    /// drain the flusher and surface the first failure.
    pub async fn wait(self) -> Result<()> {
        let PackerManager {
            tx,
            cancel: _cancel,
            workers,
            flusher,
        } = self;
        drop(tx);

        let mut first_error: Option<Error> = None;
        for handle in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::Packer(format!("worker died: {e}")));
                }
            }
        }
        match flusher.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(Error::Packer(format!("flusher died: {e}")));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel the pipeline: workers abort their current writers and
    /// partial packfiles are never uploaded.
    pub async fn abort(self) {
        let PackerManager {
            tx,
            cancel,
            workers,
            flusher,
        } = self;
        let _ = cancel.send(true);
        drop(tx);
        for handle in workers {
            let _ = handle.await;
        }
        let _ = flusher.await;
    }
}

/// A padding blob: random size in `[1, pad_max]`, random bytes, random
/// MAC. Padding is invisible to consumers and never referenced by state.
fn padding_blob(ctx: &PackerCtx) -> Result<(Mac, Vec<u8>)> {
    let size = rand::thread_rng().gen_range(1..=ctx.pad_max.max(1)) as usize;
    let mut bytes = vec![0u8; size];
    getrandom::getrandom(&mut bytes)?;
    let encoded = ctx.pipeline.encode(&bytes)?;
    Ok((Mac::random()?, encoded))
}

fn release_inflight(ctx: &PackerCtx, entries: &[BlobIndexEntry]) {
    for entry in entries {
        if entry.resource != ResourceType::Random {
            ctx.inflight.remove(entry.resource, entry.mac);
        }
    }
}

async fn worker(
    ctx: Arc<PackerCtx>,
    rx: SharedRx,
    sealed: mpsc::Sender<PackWriter>,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let mut current: Option<PackWriter> = None;

    let result = loop {
        let msg = {
            let mut rx = rx.lock().await;
            tokio::select! {
                msg = rx.recv() => msg,
                _ = cancel.changed() => break Err(Error::Cancelled),
            }
        };
        let Some(msg) = msg else { break Ok(()) };

        if current.is_none() {
            // a fresh writer always opens with one padding blob
            let mut writer = PackWriter::new();
            match padding_blob(&ctx) {
                Ok((mac, pad)) => {
                    writer.write_blob(
                        ResourceType::Random,
                        ResourceType::Random.version(),
                        mac,
                        &pad,
                        0,
                    );
                }
                Err(e) => break Err(e),
            }
            current = Some(writer);
        }

        let writer = current.as_mut().expect("writer in progress");
        writer.write_blob(msg.resource, msg.version, msg.mac, &msg.data, msg.flags);

        if writer.size() as u64 >= ctx.max_size {
            let sealed_writer = current.take().expect("writer in progress");
            if sealed.send(sealed_writer).await.is_err() {
                break Err(Error::Packer("flusher stopped".into()));
            }
        }
    };

    match result {
        Ok(()) => {
            // seal the last, possibly partial writer on clean shutdown
            if let Some(writer) = current.take() {
                if writer.blob_count() > 0 && sealed.send(writer).await.is_err() {
                    return Err(Error::Packer("flusher stopped".into()));
                }
            }
            Ok(())
        }
        Err(e) => {
            // this worker's blobs are not-written; give them back so the
            // caller may re-enqueue
            if let Some(writer) = current.take() {
                release_inflight(&ctx, writer.entries());
                writer.abort();
            }
            Err(e)
        }
    }
}

async fn flusher(
    ctx: Arc<PackerCtx>,
    mut sealed: mpsc::Receiver<PackWriter>,
    cancel: watch::Receiver<bool>,
) -> Result<()> {
    let mut first_error: Option<Error> = None;

    while let Some(writer) = sealed.recv().await {
        if *cancel.borrow() || first_error.is_some() {
            // drain without uploading: partial or post-failure work is
            // discarded and its blobs stay not-written
            release_inflight(&ctx, writer.entries());
            writer.abort();
            continue;
        }

        let pending: Vec<BlobIndexEntry> = writer.entries().to_vec();
        if let Err(e) = flush_one(&ctx, writer).await {
            release_inflight(&ctx, &pending);
            first_error = Some(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn flush_one(ctx: &PackerCtx, mut writer: PackWriter) -> Result<()> {
    // trailing padding, then seal
    let (pad_mac, pad) = padding_blob(ctx)?;
    writer.write_blob(
        ResourceType::Random,
        ResourceType::Random.version(),
        pad_mac,
        &pad,
        0,
    );

    let (bytes, entries) = writer.finalize(&ctx.pipeline, now_unix(), 0)?;
    let wrapped = envelope::wrap(
        &ctx.keys,
        ResourceType::Packfile,
        ResourceType::Packfile.version(),
        &bytes,
    );
    let mac = ctx.keys.compute_mac(&wrapped);

    ctx.backend.put_packfile(mac, &wrapped).await?;

    for entry in &entries {
        if entry.resource == ResourceType::Random {
            continue;
        }
        let delta = DeltaEntry {
            resource: entry.resource,
            version: entry.version,
            mac: entry.mac,
            location: Location {
                packfile: mac,
                offset: entry.offset,
                length: entry.length,
            },
        };
        ctx.delta.put_delta(&delta).await?;
        ctx.aggregated.put_delta(&delta).await?;
        ctx.inflight.remove(entry.resource, entry.mac);
    }

    ctx.delta.put_packfile(ctx.session, mac).await?;
    ctx.aggregated.put_packfile(ctx.session, mac).await?;

    tracing::debug!(
        packfile = %mac,
        blobs = entries.len(),
        size = wrapped.len(),
        "flushed packfile"
    );
    Ok(())
}
