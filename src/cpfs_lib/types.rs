//! On-disk scalar types. Every multi-byte field is little-endian.

use zerocopy::byteorder::{LittleEndian, U16, U32, U64};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;
