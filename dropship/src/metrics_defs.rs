use shared::metrics_defs::{MetricDef, MetricType};

pub const SECRET_FETCHES: MetricDef = MetricDef {
    name: "secrets.vault_fetch",
    metric_type: MetricType::Counter,
    description: "Vault round-trips, i.e. secret cache misses",
};

pub const FILES_UPLOADED: MetricDef = MetricDef {
    name: "upload.files_uploaded",
    metric_type: MetricType::Counter,
    description: "Files pushed to central storage",
};

pub const SAS_URLS_REUSED: MetricDef = MetricDef {
    name: "upload.sas_reused",
    metric_type: MetricType::Counter,
    description: "Download URLs minted for objects already present in storage",
};

pub const TOKENS_REGISTERED: MetricDef = MetricDef {
    name: "tokens.registered",
    metric_type: MetricType::Counter,
    description: "Access tokens issued for proxied retrieval",
};

pub const TOKEN_LOOKUP_REJECTED: MetricDef = MetricDef {
    name: "tokens.rejected",
    metric_type: MetricType::Counter,
    description: "Download-token lookups that were unknown or expired",
};

pub const TOPOLOGY_ROTATIONS: MetricDef = MetricDef {
    name: "proxy.topology_rotations",
    metric_type: MetricType::Counter,
    description: "Fresh proxy topologies built after the previous epoch lapsed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SECRET_FETCHES,
    FILES_UPLOADED,
    SAS_URLS_REUSED,
    TOKENS_REGISTERED,
    TOKEN_LOOKUP_REJECTED,
    TOPOLOGY_ROTATIONS,
];
