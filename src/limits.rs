//! Hard bounds on caller-supplied input.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ACTOR_LEN: usize = 256;
pub const MAX_LINK_LEN: usize = 2048;
pub const MAX_SESSION_CAPACITY: u32 = 10_000;
pub const MAX_BATCH_SIZE: usize = 1000;
