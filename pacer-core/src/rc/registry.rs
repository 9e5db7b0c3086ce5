// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry for rate-control models to support lookup and instantiation dynamically at runtime.

use std::collections::HashMap;

use log::debug;

use crate::codecs::{CodecInfo, VideoCodecId};
use crate::errors::{unsupported_error, Result};
use crate::rc::{RateControl, RcCfg};

/// Description of a codec supported by a rate-control model.
#[derive(Copy, Clone)]
pub struct SupportedCodec {
    pub id: VideoCodecId,
    pub info: CodecInfo,
}

/// To support registration in a rate-control registry, a `RateControl` implementation must
/// implement the `RegisterableRateControl` trait.
pub trait RegisterableRateControl: RateControl {
    fn try_registry_new(cfg: &RcCfg) -> Result<Box<dyn RateControl>>
    where
        Self: Sized;

    /// Get a list of codecs supported by this rate-control model.
    fn supported_codecs() -> &'static [SupportedCodec];
}

/// `RateControl` factory function. Creates a boxed `RateControl`.
pub type RateControlFactoryFn = fn(&RcCfg) -> Result<Box<dyn RateControl>>;

/// Registration details of a rate-control model for a particular codec.
pub struct RegisteredRateControl {
    /// Codec details.
    pub codec: SupportedCodec,
    /// Factory function to instantiate the rate-control model.
    pub factory: RateControlFactoryFn,
}

/// A `RateControlRegistry` allows the registration of rate-control models, and provides a method
/// to instantiate a `RateControl` for a codec given an `RcCfg`.
#[derive(Default)]
pub struct RateControlRegistry {
    models: HashMap<VideoCodecId, RegisteredRateControl>,
}

impl RateControlRegistry {
    /// Instantiate a new `RateControlRegistry`.
    pub fn new() -> Self {
        RateControlRegistry { models: Default::default() }
    }

    /// Get the registration information of the rate-control model for the specified codec.
    pub fn get_model(&self, id: VideoCodecId) -> Option<&RegisteredRateControl> {
        self.models.get(&id)
    }

    /// Registers all codecs supported by the rate-control model.
    ///
    /// If a supported codec was previously registered by another model, it will be replaced
    /// within the registry.
    pub fn register_model<C: RegisterableRateControl>(&mut self) {
        for codec in C::supported_codecs() {
            debug!("registered {} rate control for codec {}", codec.info.short_name, codec.id);
            self.models.insert(
                codec.id,
                RegisteredRateControl { codec: *codec, factory: C::try_registry_new },
            );
        }
    }

    /// Instantiate a rate controller for the specified codec with the given configuration.
    pub fn make_model(&self, id: VideoCodecId, cfg: &RcCfg) -> Result<Box<dyn RateControl>> {
        match self.models.get(&id) {
            Some(registered) => (registered.factory)(cfg),
            None => unsupported_error("rc: no rate-control model for codec"),
        }
    }
}

/// Convenience macro for declaring a `SupportedCodec`.
#[macro_export]
macro_rules! support_codec {
    ($id:expr, $short_name:expr, $long_name:expr) => {
        pacer_core::rc::registry::SupportedCodec {
            id: $id,
            info: pacer_core::codecs::CodecInfo {
                short_name: $short_name,
                long_name: $long_name,
            },
        }
    };
}
