// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Site-local energy compensation controller.
//!
//! The controller sits between a three-phase electricity meter (Modbus RTU
//! master on one serial port) and a photovoltaic inverter that reads its
//! "grid meter" over a second serial port. A cloud poller converts the
//! neighbouring inverter's reported power flow into a smoothed, clamped
//! compensation set-point; the power-control transform adds that
//! compensation to the raw meter image before it is republished to the
//! inverter.
//!
//! Data flow: `meter → reader → snapshot → feeder → transform ← compensation ← cloud`.

pub mod alerts;
pub mod cloud;
pub mod codec;
pub mod config;
pub mod control;
pub mod daemon;
pub mod feeder;
pub mod meter;
pub mod serial;
pub mod snapshot;
pub mod status;
