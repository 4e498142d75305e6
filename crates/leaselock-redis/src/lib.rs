//! Redis backend for the leaselock `StoreClient`.
//!
//! Set-if-absent maps onto `SET NX PX`. The conditional delete and extend
//! are Lua scripts, so the token comparison and the write happen in one
//! atomic step on the server.

mod scripts;
mod store;

pub use store::RedisStore;
