// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Cloud side: the SolisCloud client and the compensation set-point.

pub mod client;
pub mod compensation;

pub use client::{SolisClient, SolisDetail};
pub use compensation::{CloudFields, CloudPoller, Compensation};
