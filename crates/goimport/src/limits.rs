use std::sync::OnceLock;

pub const ENV_IMPORT_CONCURRENCY: &str = "LOUPE_IMPORT_CONCURRENCY";
const MAX_IMPORT_CONCURRENCY: usize = 64;

static IMPORT_CONCURRENCY: OnceLock<usize> = OnceLock::new();

fn default_import_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_IMPORT_CONCURRENCY)
}

fn parse_import_concurrency(raw: Option<&str>, default_value: usize) -> usize {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
        .clamp(1, MAX_IMPORT_CONCURRENCY)
}

/// Upper bound on dependency import workers per package, read once from
/// `LOUPE_IMPORT_CONCURRENCY` and defaulting to the number of CPUs.
pub fn import_concurrency() -> usize {
    *IMPORT_CONCURRENCY.get_or_init(|| {
        let raw = std::env::var(ENV_IMPORT_CONCURRENCY).ok();
        parse_import_concurrency(raw.as_deref(), default_import_concurrency())
    })
}

/// Resolves a configured worker count, where 0 means the process default.
pub fn effective_concurrency(configured: usize) -> usize {
    if configured == 0 {
        import_concurrency()
    } else {
        configured.clamp(1, MAX_IMPORT_CONCURRENCY)
    }
}
