//! Remote Synchronization
//!
//! リモート権限サービスとの同期基盤（書き込みスルー・キャッシュ・リトライ）

pub mod cache;
pub mod locks;
pub mod remote;
pub mod retry;

pub use cache::{CacheStore, MemoryCacheStore, Mutation, PendingMutation};
pub use locks::UserLocks;
pub use remote::{Acknowledgement, InMemoryRemoteAuthority, RemoteAuthority};
pub use retry::RetryPolicy;

#[cfg(test)]
pub use cache::MockCacheStore;
#[cfg(test)]
pub use remote::MockRemoteAuthority;
