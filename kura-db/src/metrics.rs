use std::sync::OnceLock;

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static TX_CACHE_TOTAL: OnceLock<Option<IntCounterVec>> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn tx_cache_total() -> Option<&'static IntCounterVec> {
    TX_CACHE_TOTAL
        .get_or_init(|| {
            IntCounterVec::new(
                Opts::new("kura_tx_cache_total", "Cached transaction lookups by outcome."),
                &["schema", "outcome"],
            )
            .ok()
            .map(register_collector)
        })
        .as_ref()
}

pub fn observe_cache(schema: &str, outcome: &str) {
    if let Some(counter) = tx_cache_total() {
        counter.with_label_values(&[schema, outcome]).inc();
    }
}

pub fn cache_count(schema: &str, outcome: &str) -> u64 {
    tx_cache_total()
        .map(|c| c.with_label_values(&[schema, outcome]).get())
        .unwrap_or(0)
}

/// Text exposition of every registered collector.
pub fn render() -> String {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&registry().gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
