//! This crate is part of [Sophia],
//! an [RDF] and [Linked Data] toolkit in Rust.
//!
//! It maintains the materialized closure of a transactional quad store
//! with respect to a set of rules.
//!
//! * A [`Ruleset`](ruleset::Ruleset) groups [rules](ruleset::Rule)
//!   (a conjunctive body, head templates, an optional condition, transform and triggers)
//!   and a closure plan, a tree of [`ClosureTask`](ruleset::ClosureTask)s.
//! * An [`Inferencer`](inferencer::Inferencer) computes the closure;
//!   [`NaiveInferencer`](naive::NaiveInferencer) interprets the closure plan of a ruleset,
//!   fanning rule evaluation out on a [rayon] thread pool.
//! * An [`InferenceRepository`](repository::InferenceRepository) decorates a
//!   [`Store`](sophia_store::Store); its [transactions](transaction::InferenceTransaction)
//!   track the [`ClosureStatus`](status::ClosureStatus) of the store as statements are written,
//!   and persist it between transactions.
//!
//! Inferred statements live in contexts whose IRI starts with a configurable prefix;
//! inference sessions can never write elsewhere.
//!
//! [Sophia]: https://docs.rs/sophia/latest/sophia/
//! [RDF]: https://www.w3.org/TR/rdf-primer/
//! [Linked Data]: http://linkeddata.org/
#![deny(missing_docs)]

pub mod buffer;
pub mod cache;
pub mod config;
pub mod context;
pub mod controller;
pub mod inferencer;
pub mod naive;
pub mod repository;
pub mod ruleset;
pub mod status;
pub mod transaction;

mod _digest;
mod error;
pub use error::InferenceError;

#[cfg(test)]
mod test;

#[cfg(test)]
fn test_setup() {
    TEST_SETUP.call_once(|| {
        env_logger::init();
    });
}

#[cfg(test)]
static TEST_SETUP: std::sync::Once = std::sync::Once::new();
