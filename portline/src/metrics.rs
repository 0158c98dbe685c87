//! portline runtime metrics.
//!
//! Process-wide counters for connect attempts, session lifecycle, bytes and
//! completion dispatch. Exposed through `metriken` like every other metric
//! registered in the process.

use metriken::{Counter, Gauge, metric};

// ── Connect ──────────────────────────────────────────────────────

#[metric(
    name = "portline/connect/attempts",
    description = "Connect attempts issued, one per address candidate tried"
)]
pub static CONNECT_ATTEMPTS: Counter = Counter::new();

#[metric(
    name = "portline/connect/failures",
    description = "Connect attempts that failed"
)]
pub static CONNECT_FAILURES: Counter = Counter::new();

// ── Session lifecycle ────────────────────────────────────────────

#[metric(
    name = "portline/sessions/established",
    description = "Clients promoted to the connected state"
)]
pub static SESSIONS_ESTABLISHED: Counter = Counter::new();

#[metric(
    name = "portline/sessions/peer_closed",
    description = "Sessions ended by a zero-length receive"
)]
pub static SESSIONS_PEER_CLOSED: Counter = Counter::new();

#[metric(
    name = "portline/clients/active",
    description = "Clients registered and alive"
)]
pub static CLIENTS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "portline/clients/removed",
    description = "Clients destroyed after a removal request"
)]
pub static CLIENTS_REMOVED: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "portline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "portline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Completions ──────────────────────────────────────────────────

#[metric(
    name = "portline/completions/dispatched",
    description = "Completion events handed to the dispatcher"
)]
pub static COMPLETIONS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "portline/completions/stale",
    description = "Completion events whose token no longer matched a posted context"
)]
pub static COMPLETIONS_STALE: Counter = Counter::new();

#[metric(
    name = "portline/completions/orphaned",
    description = "Completion events for clients no longer alive"
)]
pub static COMPLETIONS_ORPHANED: Counter = Counter::new();

// ── Context pool ─────────────────────────────────────────────────

#[metric(
    name = "portline/contexts/in_use",
    description = "Operation contexts currently held or posted"
)]
pub static CONTEXTS_IN_USE: Gauge = Gauge::new();

#[metric(
    name = "portline/contexts/exhausted",
    description = "Context acquisitions that found the pool empty"
)]
pub static CONTEXT_POOL_EXHAUSTED: Counter = Counter::new();
