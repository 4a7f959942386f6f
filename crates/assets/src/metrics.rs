//! Prometheus metrics for asset consistency operations.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Registry holding every metric of this crate.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static ASSET_OPERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "locker_asset_operations_total",
            "Asset lifecycle operations by operation and outcome",
        ),
        &["op", "outcome"],
    )
    .expect("metric creation failed")
});

pub static COMPENSATING_DELETES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "locker_compensating_deletes_total",
            "Deletes of freshly written blobs after a failed metadata write, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static STALE_BLOB_WARNINGS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "locker_stale_blob_warnings_total",
        "Unreferenced blobs that could not be deleted after a committed metadata write",
    )
    .expect("metric creation failed")
});

pub static KEY_GUARD_OUTCOMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "locker_key_guard_outcomes_total",
            "Keyed upserts by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static SWEEP_BLOBS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "locker_sweep_blobs_deleted_total",
        "Unreferenced blobs deleted by the sweeper",
    )
    .expect("metric creation failed")
});

pub static DETACHED_TASKS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "locker_detached_tasks_failed_total",
        "Detached operation tasks that panicked or were aborted",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with [`REGISTRY`]. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(ASSET_OPERATIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COMPENSATING_DELETES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STALE_BLOB_WARNINGS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(KEY_GUARD_OUTCOMES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_BLOBS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DETACHED_TASKS_FAILED.clone()))
            .expect("metric registration failed");
    });
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
