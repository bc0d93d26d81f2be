//! Host content-addressed archives for many users and replicate them into a swarm
//!
//! The [`Host`] loads archives on demand through the [`registry`], which makes sure every
//! archive is opened at most once no matter how many callers ask for it concurrently. The
//! [`swarm`] actor joins a discovery topic per loaded archive and owns every replication
//! stream, tracking how many peers replicate each archive. Two periodic [`jobs`] rank the
//! archives by popularity and compute the disk usage of every user, so that the archives
//! of users over their quota stop downloading.
//!
//! The storage engine, the swarm transport and the user database are seams: see
//! [`storage::Storage`], [`swarm::Discovery`] and [`user::UserStore`]. A filesystem
//! storage, a TCP transport and in-memory and file based user stores are included.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod archive;
pub mod host;
pub mod jobs;
pub mod key;
pub mod manifest;
pub mod net;
pub mod path;
pub mod registry;
pub mod storage;
pub mod swarm;
pub mod user;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

pub use self::{
    archive::ArchiveHandle,
    host::{Host, Options},
    key::{ArchiveKey, DiscoveryKey},
    manifest::Manifest,
    registry::LoadError,
    swarm::SwarmOpts,
};
