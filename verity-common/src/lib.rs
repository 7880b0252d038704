#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Shared leaf types for the verity deliverability verifier.

pub mod address;
pub mod domain;
pub mod fingerprint;
pub mod logging;

pub use address::{AddressError, EmailAddress};
pub use domain::Domain;
pub use fingerprint::{Fingerprint, Fingerprinter};

pub use tracing;
