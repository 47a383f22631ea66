//! shoreline runtime metrics.
//!
//! Per-worker counters for connections, bytes, ring utilization, and
//! pool exhaustion. Workers are few and long-lived, so plain atomic
//! counters are enough; exposed via Prometheus when registered with an
//! admin/metrics endpoint.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "shoreline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "shoreline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "shoreline/connections/rejected",
    description = "Connections rejected at the connection limit"
)]
pub static CONNECTIONS_REJECTED: Counter = Counter::new();

#[metric(
    name = "shoreline/connections/tls_handshake_failures",
    description = "TLS sessions that failed before or during handshake"
)]
pub static TLS_HANDSHAKE_FAILURES: Counter = Counter::new();

#[metric(
    name = "shoreline/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "shoreline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "shoreline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Ring utilization ─────────────────────────────────────────────

#[metric(name = "shoreline/cqe/processed", description = "Total CQEs processed")]
pub static CQE_PROCESSED: Counter = Counter::new();

#[metric(
    name = "shoreline/sqe/submit_failures",
    description = "SQE submission failures"
)]
pub static SQE_SUBMIT_FAILURES: Counter = Counter::new();

// ── Pool exhaustion ──────────────────────────────────────────────

#[metric(
    name = "shoreline/pool/send_exhausted",
    description = "Send copy pool exhaustion events"
)]
pub static SEND_POOL_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "shoreline/pool/timer_exhausted",
    description = "Timer pool exhaustion events"
)]
pub static TIMER_POOL_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "shoreline/pool/buffer_ring_empty",
    description = "Recv buffer ring empty events"
)]
pub static BUFFER_RING_EMPTY: Counter = Counter::new();
