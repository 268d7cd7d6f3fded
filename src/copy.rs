use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Copies `value` through a bincode encode/decode round trip.
///
/// The result shares no allocation with the input, including whatever sits
/// behind `Arc`/`Rc` (serde's `rc` feature rebuilds them). Types that need
/// `deserialize_any`, like untagged enums, cannot pass through bincode and
/// fail here instead of being copied partially.
pub(crate) fn deep_copy<T>(value: &T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = bincode::serialize(value)?;
    Ok(bincode::deserialize(&bytes)?)
}
