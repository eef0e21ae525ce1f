//! Batch helpers over groups of message readers.

use crate::errors::Result;
use crate::shared_message::SharedMessage;

/// Issue a non-blocking read on every reader, preserving input order.
///
/// `None` entries mark readers with no unseen version.
pub fn read_all(readers: &[SharedMessage]) -> Result<Vec<Option<Vec<u8>>>> {
    readers.iter().map(|reader| reader.read(false)).collect()
}

/// Like [`read_all`], applying `map` to each payload that arrived.
pub fn read_all_map<T, F>(readers: &[SharedMessage], map: F) -> Result<Vec<Option<T>>>
where
    F: Fn(&[u8]) -> T,
{
    readers
        .iter()
        .map(|reader| Ok(reader.read(false)?.map(|bytes| map(&bytes))))
        .collect()
}
