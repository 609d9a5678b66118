//! `flagstream` is a feature-flag evaluation client. A calling program
//! supplies a user record and a flag key; the client returns a variation
//! value together with an explanation of why that value was chosen.
//!
//! # Overview
//!
//! Rule data (flags and segments) is delivered by a remote control service
//! and cached locally in a versioned [`store::DataStore`], so evaluation is
//! a purely local computation that never blocks on the network. Updates
//! arrive over a server-sent-events stream ([`streaming`]) or, when
//! streaming is disabled, by periodic polling ([`polling`]).
//!
//! The usual entry point is [`Config`]:
//!
//! ```no_run
//! use flagstream::{Config, User};
//!
//! let client = Config::from_sdk_key("sdk-key").to_client().unwrap();
//! client.wait_for_initialization().unwrap();
//!
//! let user = User::with_key("user-key");
//! let flag_on = client.bool_variation("my-flag", &user, false);
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod bucketing;
pub mod eval;
pub mod events;
pub mod operators;
pub mod polling;
pub mod requestor;
pub mod store;
pub mod streaming;

mod client;
mod config;
mod detail;
mod error;
mod flags_state;
mod models;
mod signal;
mod user;

pub use client::Client;
pub use config::Config;
pub use detail::{Detail, ErrorKind, Reason};
pub use error::{Error, Result};
pub use flags_state::{FlagMetadata, FlagsState, FlagsStateOptions};
pub use models::{
    Clause, FeatureFlag, FlagRule, Operator, Prerequisite, Rollout, Segment, SegmentRule, Target,
    VariationOrRollout, WeightedVariation,
};
pub use user::User;
