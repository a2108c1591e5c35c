//! A from-scratch training engine for fully-connected feed-forward neural
//! networks in single precision.
//!
//! A caller assembles a topology with [`network::Network::create`], picks an
//! initializer, sets a loss, then drives epochs through one of the
//! [`optim`] variants while [`callbacks`] observe each epoch's results.
//! [`network::npy`] (reachable through [`network::Network::save`]/
//! [`network::Network::load`]) persists parameters to a zip archive of NPY
//! arrays.

pub mod activations;
pub mod aligned;
pub mod callbacks;
pub mod errors;
pub mod kernels;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod optim;

pub use errors::{GPError, GPResult};
pub use network::{Layer, Network};
