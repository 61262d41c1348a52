#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
mod id;
mod issuer;
mod lookup;
mod store;
mod time;

pub use crate::error::*;
pub use crate::id::*;
pub use crate::issuer::*;
pub use crate::lookup::*;
pub use crate::store::*;
pub use crate::time::*;
