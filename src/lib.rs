//! On-demand thumbnails for the photos and videos of an album that lives on
//! a remote device.
//!
//! [`catalog::CatalogModel`] enumerates an album through a
//! [`remote::DeviceConnection`] and hands out thumbnails lazily. Decodes run
//! on a bounded worker pool ([`thumbnails::ThumbnailPipeline`]); videos are
//! demuxed straight off the device through [`remote::RemoteStream`] and pass
//! a separate concurrency gate.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod media;
pub mod remote;
pub mod thumbnails;

#[cfg(test)]
mod testing;

pub use catalog::{CatalogEvent, CatalogModel, Decoration, FilterType, SortOrder, ThumbnailState};
pub use config::ThumbnailConfig;
pub use remote::{DeviceConnection, LocalFs, RemoteFs};
