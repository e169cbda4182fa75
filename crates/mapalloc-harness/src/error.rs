use mapalloc::AllocError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocating {size} bytes failed at op {op}: {source}")]
    Allocation {
        op: usize,
        size: usize,
        #[source]
        source: AllocError,
    },
    #[error("slot {addr:#x} lost its tag before release at op {op}")]
    Clobbered { op: usize, addr: usize },
    #[error("invalid seed {raw:?}")]
    InvalidSeed { raw: String },
    #[error("{outstanding} regions outstanding after the run (bound {bound})")]
    RegionBound { outstanding: usize, bound: usize },
    #[error("a releasing thread panicked")]
    WorkerPanicked,
}

/// Parse a decimal or `0x`-prefixed seed; underscores are ignored.
pub fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    };
    parsed.map_err(|_| HarnessError::InvalidSeed {
        raw: raw.to_string(),
    })
}
