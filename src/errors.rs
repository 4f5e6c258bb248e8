//! Error plumbing shared by the remote, thumbnail and catalog layers.

pub mod api_error;
pub mod domain;
