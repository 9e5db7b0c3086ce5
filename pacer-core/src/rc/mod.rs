// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `rc` module and its sub-modules provide traits and supporting infrastructure to implement
//! frame-level rate controllers.
//!
//! # Nomenclature
//!
//! * A rate controller decides, per frame, a target bit budget and a starting QP, and after the
//!   frame was encoded, whether it must be re-encoded at a corrected QP.
//! * The encoding pipeline drives a controller through four callbacks per frame: `start` (budget
//!   allocation), `hal_start` (QP decision), `hal_end`, and `end` (feedback and the re-encode
//!   decision).

use bitflags::bitflags;

use crate::errors::Result;

pub mod registry;

/// The rate-control operating mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RcMode {
    /// Every frame is encoded at a fixed, configured QP. The controller performs no bit
    /// accounting.
    FixQp,
    /// Constant bitrate. The controller regulates around `bps_target`.
    #[default]
    Cbr,
    /// Variable bitrate. The controller regulates around `bps_max`.
    Vbr,
}

/// The GOP reference structure produced by the encoder.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum GopMode {
    /// A single INTRA frame followed by forward-predicted P frames.
    #[default]
    NormalP,
    /// As `NormalP`, but every `vgop` frames a virtual-intra frame references the previous INTRA
    /// frame directly.
    SmartP,
}

/// The reference mode of a single inter frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RefMode {
    /// The frame is predicted from the previous frame.
    #[default]
    ToPrevFrame,
    /// The frame is predicted only from the previous INTRA frame (a virtual-intra frame).
    ToPrevIntra,
}

/// The rate-control class of a frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameKind {
    /// A self-contained frame.
    #[default]
    Intra,
    /// A forward-predicted frame.
    InterP,
    /// A virtual-intra frame, predicted only from the previous INTRA frame.
    InterVi,
}

impl FrameKind {
    /// Classify a frame from its encoder-supplied status. A `ToPrevIntra` reference always marks
    /// a virtual-intra frame.
    pub fn classify(is_intra: bool, ref_mode: RefMode) -> FrameKind {
        if ref_mode == RefMode::ToPrevIntra {
            FrameKind::InterVi
        }
        else if is_intra {
            FrameKind::Intra
        }
        else {
            FrameKind::InterP
        }
    }
}

/// The input and denormalized output frame rates of a stream.
///
/// The effective output frame rate is `fps_out_num / fps_out_denorm` frames per second.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FpsCfg {
    /// Input frame rate in frames per second.
    pub fps_in_num: i32,
    /// Output frame rate numerator.
    pub fps_out_num: i32,
    /// Output frame rate denormalizer.
    pub fps_out_denorm: i32,
}

impl Default for FpsCfg {
    fn default() -> Self {
        FpsCfg { fps_in_num: 30, fps_out_num: 30, fps_out_denorm: 1 }
    }
}

/// Static, per-stream rate-controller configuration.
///
/// A configuration is copied by the controller at creation time and is immutable thereafter.
/// Out-of-range values are corrected at creation time, not rejected.
#[derive(Clone, Debug)]
pub struct RcCfg {
    /// Rate-control operating mode.
    pub mode: RcMode,
    /// GOP reference structure.
    pub gop_mode: GopMode,
    /// GOP length in frames. 0 denotes an infinite GOP and is treated as 300 for bit accounting.
    pub igop: i32,
    /// Virtual GOP length in frames. Must be greater than 1 in `SmartP` mode.
    pub vgop: i32,
    /// Target bitrate in bits per second.
    pub bps_target: i32,
    /// Maximum bitrate in bits per second.
    pub bps_max: i32,
    /// Stream frame rates.
    pub fps: FpsCfg,
    /// Length of the bitrate statistics window in seconds. 0 is treated as 3.
    pub stat_times: i32,
    /// Maximum share of a GOP's bit budget allocable to its INTRA frame, in percent.
    pub max_i_bit_prop: i32,
    /// Frame width in pixels.
    pub width: i32,
    /// Frame height in pixels.
    pub height: i32,
    /// Minimum QP for inter frames.
    pub min_quality: i32,
    /// Maximum QP for inter frames.
    pub max_quality: i32,
    /// Minimum QP for INTRA frames.
    pub min_i_quality: i32,
    /// Maximum QP for INTRA frames.
    pub max_i_quality: i32,
    /// QP reduction applied to INTRA frames relative to the regulated QP.
    pub i_quality_delta: i32,
    /// QP reduction applied to virtual-intra frames relative to the regulated QP.
    pub vi_quality_delta: i32,
    /// Maximum number of re-encodes of a single frame.
    pub max_reencode_times: u32,
    /// Initial (and, in `FixQp` mode, fixed) QP. Non-positive values are treated as 26.
    pub init_quality: i32,
}

impl Default for RcCfg {
    fn default() -> Self {
        RcCfg {
            mode: RcMode::default(),
            gop_mode: GopMode::default(),
            igop: 60,
            vgop: 0,
            bps_target: 0,
            bps_max: 0,
            fps: FpsCfg::default(),
            stat_times: 3,
            max_i_bit_prop: 30,
            width: 0,
            height: 0,
            min_quality: 10,
            max_quality: 51,
            min_i_quality: 10,
            max_i_quality: 51,
            i_quality_delta: 2,
            vi_quality_delta: 2,
            max_reencode_times: 1,
            init_quality: 26,
        }
    }
}

bitflags! {
    /// Per-frame force flags supplied by the encoding pipeline.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ForceFlags: u32 {
        /// Encode the frame at exactly `ForceCfg::qp`, bypassing the QP decision.
        const QP = 1 << 0;
    }
}

/// Per-frame forced overrides.
#[derive(Copy, Clone, Debug, Default)]
pub struct ForceCfg {
    /// The set of active overrides.
    pub flags: ForceFlags,
    /// The forced QP. Only meaningful when `ForceFlags::QP` is set.
    pub qp: i32,
}

/// Per-frame encoder status, filled in by the encoding pipeline before `start`.
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameStatus {
    /// Sequential index of the frame within the stream.
    pub seq_idx: i64,
    /// The frame is self-contained.
    pub is_intra: bool,
    /// The reference mode of the frame.
    pub ref_mode: RefMode,
    /// Set by the controller in `end` when the frame must be re-encoded. The pipeline must clear
    /// it before re-running `hal_start`/`end` for the same frame.
    pub reencode: bool,
}

/// Per-frame rate-control values exchanged between the controller and the encoder.
///
/// The bit and quality triples are outputs of `start` and `hal_start` respectively; `bit_real`
/// and `madi` are inputs to `end`, filled in by the encoder once the frame is done.
#[derive(Copy, Clone, Debug, Default)]
pub struct RcTaskInfo {
    /// Lower bit budget bound.
    pub bit_min: i32,
    /// Target bit budget for the frame.
    pub bit_target: i32,
    /// Upper bit budget bound.
    pub bit_max: i32,
    /// Minimum QP for the frame.
    pub quality_min: i32,
    /// Starting QP for the frame.
    pub quality_target: i32,
    /// Maximum QP for the frame.
    pub quality_max: i32,
    /// Actual size of the encoded frame in bits.
    pub bit_real: i32,
    /// Mean absolute difference indicator of the encoded frame, a complexity metric.
    pub madi: i32,
}

/// A per-frame rate-control task, threaded through all four lifecycle callbacks.
#[derive(Copy, Clone, Debug, Default)]
pub struct RcTask {
    /// Frame status.
    pub frm: FrameStatus,
    /// Rate-control values.
    pub info: RcTaskInfo,
    /// Forced overrides.
    pub force: ForceCfg,
}

/// A frame-level rate controller for a block-based video encoder.
///
/// A controller is stateful and serves a single stream. The pipeline must call the lifecycle
/// callbacks in order for every frame: `start`, `hal_start`, `hal_end`, `end`. When `end` sets
/// [`FrameStatus::reencode`], the pipeline clears the flag, re-encodes the same frame, and
/// repeats from `hal_start`.
pub trait RateControl {
    /// Begin a frame: classify it and allocate its bit budget.
    fn start(&mut self, task: &mut RcTask) -> Result<()>;

    /// Decide the starting QP for the frame, writing it to `task.info.quality_target`.
    fn hal_start(&mut self, task: &mut RcTask) -> Result<()>;

    /// Called after the hardware finished the frame, before `end`.
    fn hal_end(&mut self, task: &mut RcTask) -> Result<()> {
        let _ = task;
        Ok(())
    }

    /// Finish a frame: decide whether to re-encode it, otherwise commit its statistics.
    fn end(&mut self, task: &mut RcTask) -> Result<()>;
}
