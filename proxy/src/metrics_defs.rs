use shared::metrics_defs::{MetricDef, MetricType};

pub const SELECT_LOCAL: MetricDef = MetricDef {
    name: "spac.select.local",
    metric_type: MetricType::Counter,
    description: "Requests answered locally: self-administration pages and https redirects",
};

pub const SELECT_RULE_MATCHED: MetricDef = MetricDef {
    name: "spac.select.rule_matched",
    metric_type: MetricType::Counter,
    description: "Requests routed by an explicit rule",
};

pub const SELECT_FALLBACK: MetricDef = MetricDef {
    name: "spac.select.fallback",
    metric_type: MetricType::Counter,
    description: "Requests routed direct-first by the CRLF or reachable host fallback",
};

pub const SELECT_DEFAULT: MetricDef = MetricDef {
    name: "spac.select.default",
    metric_type: MetricType::Counter,
    description: "Requests routed to the default target",
};

pub const RESOLVE_MISS: MetricDef = MetricDef {
    name: "spac.resolve.miss",
    metric_type: MetricType::Counter,
    description: "Target names dropped because the handler is missing or disabled",
};

pub const PROBE_TIMEOUT: MetricDef = MetricDef {
    name: "spac.probe.timeout",
    metric_type: MetricType::Counter,
    description: "Reachability probes that did not finish in time",
};

pub const SELECT_DURATION: MetricDef = MetricDef {
    name: "spac.select.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent selecting upstream candidates, in seconds",
};

pub const DISPATCH_EXHAUSTED: MetricDef = MetricDef {
    name: "spac.dispatch.exhausted",
    metric_type: MetricType::Counter,
    description: "Requests failed because no candidate could carry them",
};

pub const PAC_COMPILED: MetricDef = MetricDef {
    name: "spac.pac.compiled",
    metric_type: MetricType::Counter,
    description: "PAC files written",
};

pub const PAC_FAILED: MetricDef = MetricDef {
    name: "spac.pac.failed",
    metric_type: MetricType::Counter,
    description: "PAC generation attempts that left the previous file in place",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SELECT_LOCAL,
    SELECT_RULE_MATCHED,
    SELECT_FALLBACK,
    SELECT_DEFAULT,
    RESOLVE_MISS,
    PROBE_TIMEOUT,
    SELECT_DURATION,
    DISPATCH_EXHAUSTED,
    PAC_COMPILED,
    PAC_FAILED,
];
