//! Engine integration tests
//!
//! # Test Organization
//!
//! Tests are organized by the story they tell:
//!
//! - `lifecycle`: install, steady state, drift repair, reconfiguration and
//!   deletion of a single provider
//!
//! - `upgrade`: version transitions and the `latest` sentinel
//!
//! - `failures`: how unknown versions, repository outages, invalid manifests
//!   and write conflicts surface on the provider
//!
//! - `isolation`: four kinds and many identities sharing one engine

mod failures;
mod helpers;
mod isolation;
mod lifecycle;
mod upgrade;
