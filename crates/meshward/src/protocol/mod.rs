//! Wire protocol handlers (C8, C9, C11) that sit on top of the ambient
//! transport's per-stream byte pipes.

pub mod notify;
pub mod pairing;
pub mod unseal;
