use std::env;
use std::sync::OnceLock;

static LAZYRS_OPT: OnceLock<u8> = OnceLock::new();
static LAZYRS_DEVICE: OnceLock<String> = OnceLock::new();

const DEFAULT_OPT: u8 = 2;
const DEFAULT_DEVICE: &str = "cpu";

fn parse_level(value: &str) -> Option<u8> {
    value.trim().parse::<u8>().ok().map(|level| level.min(2))
}

/// Fusion level requested through `LAZYRS_OPT` (0, 1 or 2; larger values clamp to 2).
pub(crate) fn opt_level() -> u8 {
    *LAZYRS_OPT.get_or_init(|| match env::var("LAZYRS_OPT") {
        Ok(value) if !value.trim().is_empty() => parse_level(&value).unwrap_or_else(|| {
            log::warn!("ignoring unparsable LAZYRS_OPT={value:?}");
            DEFAULT_OPT
        }),
        _ => DEFAULT_OPT,
    })
}

/// Device used by constructors that take no explicit device (`LAZYRS_DEVICE`, default `cpu`).
pub fn default_device() -> &'static str {
    LAZYRS_DEVICE.get_or_init(|| match env::var("LAZYRS_DEVICE") {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => DEFAULT_DEVICE.to_string(),
    })
}
