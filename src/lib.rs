mod cpfs_lib;

pub use cpfs_lib::*;
