//! Shared vocabulary for Ballast.
//!
//! Everything above this crate speaks in [`types::StrategyId`],
//! [`types::ReturnSeries`] and [`types::WeightVector`], reports failures
//! through [`error`], and loads its settings with [`config::ConfigLoader`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod error;
pub mod types;
