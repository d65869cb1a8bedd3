// depot-net/src/lib.rs
pub mod api;
pub mod retry;
pub mod transfer;

pub use api::{FetchInfo, RegisterResult, RemoteClient, RemoteRepository};
pub use transfer::{
    attach_tags_when_ready, fetch_instance, register_instance, upload_to_cas, InstanceFetcher,
    RemoteFetcher, StorageClient,
};
