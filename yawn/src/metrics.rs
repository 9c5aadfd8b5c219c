//! Process-wide runtime metrics.
//!
//! `CONNECTIONS_ACTIVE` doubles as the global connection counter: the
//! reactor raises it on accept, any thread may lower it on close, and the
//! accept path consults it for admission control.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "yawn/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "yawn/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "yawn/connections/refused",
    description = "Connections refused at the admission cap"
)]
pub static CONNECTIONS_REFUSED: Counter = Counter::new();

#[metric(
    name = "yawn/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "yawn/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "yawn/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "yawn/requests/served", description = "Total responses composed")]
pub static REQUESTS_SERVED: Counter = Counter::new();
