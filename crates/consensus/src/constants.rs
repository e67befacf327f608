//! Consensus-wide constants shared across validation.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 1;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// Serialized header length; the block hash covers exactly these bytes.
pub const HEADER_SIZE: usize = 80;
/// Number of previous blocks whose timestamps feed the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Blocks may not be timestamped further than this ahead of local time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Retarget results are clamped to this factor in either direction.
pub const RETARGET_CLAMP_FACTOR: i64 = 4;
/// Upper bound on blocks held while waiting for their parent.
pub const DEFAULT_MAX_ORPHAN_BLOCKS: usize = 64;
/// Orphans older than this are dropped.
pub const DEFAULT_ORPHAN_TTL_SECS: u64 = 20 * 60;
