use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "device_api_requests_total",
            "Total facade operations started"
        ),
        &["operation"]
    )
    .unwrap();
    pub static ref FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "device_api_failures_total",
            "Total facade operations that failed, by error kind"
        ),
        &["operation", "kind"]
    )
    .unwrap();
    pub static ref BACKEND_LATENCY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "device_api_backend_latency_seconds",
            "Time spent waiting on the registry or messaging backend"
        )
        .buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0
        ]),
        &["operation"]
    )
    .unwrap();
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "device_api_messages_sent_total",
            "Total messages delivered over the device channel"
        ),
        &["kind"]
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BACKEND_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_SENT_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
