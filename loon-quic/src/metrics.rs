//! BT request stream metrics, registered with [`metriken`].

use metriken::{Counter, metric};

#[metric(name = "loon_quic/bt/requests_sent", description = "BT commands sent")]
pub static BT_REQUESTS_SENT: Counter = Counter::new();

#[metric(
    name = "loon_quic/bt/responses_matched",
    description = "BT responses matched to an in-flight request"
)]
pub static BT_RESPONSES_MATCHED: Counter = Counter::new();

#[metric(
    name = "loon_quic/bt/responses_unmatched",
    description = "BT responses dropped with no matching request"
)]
pub static BT_RESPONSES_UNMATCHED: Counter = Counter::new();

#[metric(name = "loon_quic/bt/timeouts", description = "BT requests failed by timeout")]
pub static BT_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "loon_quic/bt/protocol_errors",
    description = "BT streams closed for protocol violations"
)]
pub static BT_PROTOCOL_ERRORS: Counter = Counter::new();
