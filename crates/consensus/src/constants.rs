//! Protocol-wide constants shared by every network.

/// Serialized size of a header before the mix-hash upgrade.
pub const LEGACY_HEADER_SIZE: usize = 80;

/// Serialized size of a header after the mix-hash upgrade, and the
/// fixed record size used for on-disk header storage.
pub const EXTENDED_HEADER_SIZE: usize = 120;

/// Headers per legacy retarget window, and the spacing of both
/// checkpoint tables.
pub const RETARGET_WINDOW: u32 = 2016;

/// Trailing headers consulted by Dark Gravity Wave v3.
pub const DGW_PAST_BLOCKS: u32 = 180;

/// Nominal seconds between blocks.
pub const TARGET_SPACING_SECS: u64 = 60;

/// A tip older than this is considered stale.
pub const STALE_TIP_SECS: u64 = 8 * 60 * 60;

/// Longest accepted merkle branch; 2^30 transactions is far beyond any
/// valid block.
pub const MAX_MERKLE_BRANCH_LEN: usize = 30;

/// Maximum asset name length accepted for subscriptions.
pub const MAX_ASSET_NAME_LEN: usize = 32;
