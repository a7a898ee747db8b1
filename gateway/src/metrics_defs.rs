use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS_ACTIVE: MetricDef = MetricDef {
    name: "gateway_requests_active",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently inside the pipeline",
};

pub const REQUESTS_SERVICE: MetricDef = MetricDef {
    name: "gateway_requests_service_total",
    metric_type: MetricType::Counter,
    description: "Completed requests per upstream service. Tagged with service.",
};

pub const ERRORS: MetricDef = MetricDef {
    name: "gateway_errors_total",
    metric_type: MetricType::Counter,
    description: "Requests finished with a 4xx or 5xx status. Tagged with type (client, server).",
};

pub const RESPONSE_TIME: MetricDef = MetricDef {
    name: "gateway_response_time_seconds",
    metric_type: MetricType::Histogram,
    description: "Time from pipeline entry until the response head is sent. Tagged with service.",
};

pub const RATE_LIMITED: MetricDef = MetricDef {
    name: "gateway_rate_limited_total",
    metric_type: MetricType::Counter,
    description: "Requests rejected by the rate limiter. Tagged with service.",
};

pub const BREAKER_TRANSITIONS: MetricDef = MetricDef {
    name: "gateway_circuit_breaker_transitions_total",
    metric_type: MetricType::Counter,
    description: "Circuit breaker state changes. Tagged with service, state.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS_ACTIVE,
    REQUESTS_SERVICE,
    ERRORS,
    RESPONSE_TIME,
    RATE_LIMITED,
    BREAKER_TRANSITIONS,
];
