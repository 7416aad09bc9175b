//! UUID v7 utilities for time-ordered identifiers.
//!
//! Job IDs are UUIDv7, so IDs generated later sort after earlier ones.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use docconv_core::uuid_utils::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
