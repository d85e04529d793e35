//! Template-driven scanning engine.
//!
//! Templates declare protocol requests (`http`, `dns`, `network`) together
//! with matchers and extractors. They are compiled into a [`tmplexec`] engine
//! and executed concurrently against many targets by [`core::Engine`], under
//! a shared rate limiter and host error cache. Out-of-band interactions are
//! correlated back to the requests that triggered them by [`interactsh`].

pub mod cache;
pub mod catalog;
pub mod config;
pub mod core;
pub mod dsl;
pub mod errors;
pub mod generators;
pub mod interactsh;
pub mod models;
pub mod operators;
pub mod output;
pub mod protocols;
pub mod reporting;
pub mod templates;
pub mod tmplexec;
