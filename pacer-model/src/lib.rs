// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Project Pacer's default frame-level rate-control model for block-based hardware video
//! encoders.
//!
//! The model decides, for each frame, a target bit budget and a starting QP, and, once the frame
//! was actually encoded, whether it must be re-encoded at a corrected QP. It regulates CBR and
//! VBR streams through sliding-window bit accounting, a leaky-bucket water level, frame-type
//! cost scales, and logarithmic bitrate-ratio feedback laws.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]
// The following lints are allowed in all Pacer crates. Please see the workspace manifest for
// their justification.
#![allow(clippy::comparison_chain)]
#![allow(clippy::excessive_precision)]
#![allow(clippy::identity_op)]
#![allow(clippy::manual_range_contains)]

use log::{debug, info, warn};

use pacer_core::codecs::well_known::{CODEC_ID_H264, CODEC_ID_HEVC, CODEC_ID_MJPEG};
use pacer_core::errors::Result;
use pacer_core::rc::registry::{
    RateControlRegistry, RegisterableRateControl, SupportedCodec,
};
use pacer_core::rc::{ForceFlags, FrameKind, RateControl, RcCfg, RcMode, RcTask};
use pacer_core::support_codec;
use pacer_core::units::ScaledQp;

mod bits;
mod quality;
mod ratio;
mod reencode;
mod window;

pub use reencode::FrameSizeCheck;

use crate::bits::BitsModel;

/// GOP length assumed for bit allocation when the stream has no periodic INTRA frames.
const INFINITE_GOP_LEN: i32 = 300;

/// The default rate-control model.
///
/// A `RateController` serves a single stream and is driven through the [`RateControl`] lifecycle
/// once per frame. All state is owned by the controller and released on drop.
pub struct RateController {
    pub(crate) cfg: RcCfg,
    pub(crate) bits: Option<BitsModel>,

    pub(crate) frame_kind: FrameKind,
    pub(crate) last_frame_kind: FrameKind,
    pub(crate) first_frame: bool,

    pub(crate) pre_target_bits: i32,
    pub(crate) pre_real_bits: i32,
    pub(crate) ins_bps: i32,
    pub(crate) last_inst_bps: i32,

    pub(crate) next_ratio: i32,
    pub(crate) next_i_ratio: i32,
    pub(crate) pre_i_qp: i32,
    pub(crate) cur_scale_qp: ScaledQp,
    pub(crate) start_qp: i32,

    pub(crate) reenc_cnt: u32,

    pub(crate) super_i_bits_thr: Option<i32>,
    pub(crate) super_p_bits_thr: Option<i32>,
}

impl RateController {
    /// Create a controller for one stream. The configuration is copied; out-of-range values are
    /// corrected here and remain fixed for the lifetime of the controller.
    pub fn try_new(cfg: &RcCfg) -> Result<RateController> {
        let mut cfg = cfg.clone();
        sanitize(&mut cfg);

        // FixQp performs no bit accounting at all.
        let bits = match cfg.mode {
            RcMode::FixQp => None,
            _ => Some(BitsModel::new(&cfg)?),
        };

        Ok(RateController {
            cfg,
            bits,
            frame_kind: FrameKind::Intra,
            last_frame_kind: FrameKind::InterP,
            first_frame: true,
            pre_target_bits: 0,
            pre_real_bits: 0,
            ins_bps: 0,
            last_inst_bps: 0,
            next_ratio: 0,
            next_i_ratio: 0,
            pre_i_qp: 0,
            cur_scale_qp: ScaledQp::from_qp(0),
            start_qp: 0,
            reenc_cnt: 0,
            super_i_bits_thr: None,
            super_p_bits_thr: None,
        })
    }

    /// `start` for `FixQp` streams: publish the configured QP bounds, defaulting unset ones from
    /// the fixed QP.
    fn start_fix_qp(&mut self, task: &mut RcTask) -> Result<()> {
        let cfg = &mut self.cfg;

        if cfg.init_quality <= 0 {
            warn!("invalid fixed qp {}, using the default qp 26", cfg.init_quality);
            cfg.init_quality = 26;
        }

        if cfg.max_quality <= 0 {
            cfg.max_quality = cfg.init_quality;
        }
        if cfg.min_quality <= 0 {
            cfg.min_quality = cfg.init_quality;
        }
        if cfg.max_i_quality <= 0 {
            cfg.max_i_quality = cfg.max_quality;
        }
        if cfg.min_i_quality <= 0 {
            cfg.min_i_quality = cfg.min_quality;
        }

        let info = &mut task.info;
        if task.frm.is_intra {
            info.quality_max = cfg.max_i_quality;
            info.quality_min = cfg.min_i_quality;
            info.quality_target = cfg.min_i_quality;
        }
        else {
            info.quality_max = cfg.max_quality;
            info.quality_min = cfg.min_quality;
            info.quality_target = cfg.min_quality;
        }

        Ok(())
    }
}

impl RateControl for RateController {
    fn start(&mut self, task: &mut RcTask) -> Result<()> {
        if self.cfg.mode == RcMode::FixQp {
            return self.start_fix_qp(task);
        }

        self.frame_kind = FrameKind::classify(task.frm.is_intra, task.frm.ref_mode);

        let kind = self.frame_kind;
        if let Some(bits) = self.bits.as_mut() {
            let (bit_target, ins_bps) = bits.alloc(&self.cfg, kind);
            task.info.bit_target = bit_target;
            self.ins_bps = ins_bps;
        }

        self.next_ratio = 0;
        if self.last_frame_kind == FrameKind::Intra {
            self.calc_next_i_ratio();
        }

        if !self.first_frame {
            match self.cfg.mode {
                RcMode::Cbr => self.calc_cbr_ratio(),
                _ => self.calc_vbr_ratio(),
            }
        }

        // On the very first frame the QP decision starts from the bit budget, not from a carried
        // target.
        if self.first_frame {
            task.info.quality_target = -1;
        }
        if task.frm.is_intra {
            task.info.quality_max = self.cfg.max_i_quality;
            task.info.quality_min = self.cfg.min_i_quality;
        }
        else {
            task.info.quality_max = self.cfg.max_quality;
            task.info.quality_min = self.cfg.min_quality;
        }

        debug!(
            "frame {} intra {} bitrate [{} : {} : {}]",
            task.frm.seq_idx,
            task.frm.is_intra,
            task.info.bit_min,
            task.info.bit_target,
            task.info.bit_max
        );

        self.reenc_cnt = 0;

        Ok(())
    }

    fn hal_start(&mut self, task: &mut RcTask) -> Result<()> {
        if task.force.flags.contains(ForceFlags::QP) {
            let qp = task.force.qp;
            task.info.quality_target = qp;
            task.info.quality_max = qp;
            task.info.quality_min = qp;
            return Ok(());
        }

        if self.cfg.mode == RcMode::FixQp {
            return Ok(());
        }

        self.decide_quality(task);

        Ok(())
    }

    fn end(&mut self, task: &mut RcTask) -> Result<()> {
        if self.cfg.mode != RcMode::FixQp && !task.force.flags.contains(ForceFlags::QP) {
            if self.check_re_enc(&task.info) {
                match self.cfg.mode {
                    RcMode::Cbr => self.reenc_calc_cbr_ratio(&task.info),
                    _ => self.reenc_calc_vbr_ratio(&task.info),
                }

                if self.next_ratio != 0 {
                    self.reenc_cnt += 1;
                    task.frm.reencode = true;
                    debug!(
                        "frame {} re-encode pass {} with ratio {}",
                        task.frm.seq_idx, self.reenc_cnt, self.next_ratio
                    );
                }
            }
        }

        if !task.frm.reencode {
            let kind = self.frame_kind;
            if let Some(bits) = self.bits.as_mut() {
                bits.update(kind, task.info.bit_real, task.info.madi);
            }
            self.last_inst_bps = self.ins_bps;
            self.first_frame = false;
            self.last_frame_kind = self.frame_kind;
        }

        self.pre_target_bits = task.info.bit_target;
        self.pre_real_bits = task.info.bit_real;

        Ok(())
    }
}

impl RegisterableRateControl for RateController {
    fn try_registry_new(cfg: &RcCfg) -> Result<Box<dyn RateControl>> {
        Ok(Box::new(RateController::try_new(cfg)?))
    }

    fn supported_codecs() -> &'static [SupportedCodec] {
        &[
            support_codec!(CODEC_ID_H264, "avc", "Advanced Video Coding"),
            support_codec!(CODEC_ID_HEVC, "hevc", "High Efficiency Video Coding"),
        ]
    }
}

/// A rate-control bypass: every lifecycle callback does nothing.
///
/// Motion JPEG frames are rate controlled by the hardware JPEG path itself, so the codec binds
/// this no-op model.
pub struct NullRateControl;

impl RateControl for NullRateControl {
    fn start(&mut self, _task: &mut RcTask) -> Result<()> {
        Ok(())
    }

    fn hal_start(&mut self, _task: &mut RcTask) -> Result<()> {
        Ok(())
    }

    fn end(&mut self, _task: &mut RcTask) -> Result<()> {
        Ok(())
    }
}

impl RegisterableRateControl for NullRateControl {
    fn try_registry_new(_cfg: &RcCfg) -> Result<Box<dyn RateControl>> {
        Ok(Box::new(NullRateControl))
    }

    fn supported_codecs() -> &'static [SupportedCodec] {
        &[support_codec!(CODEC_ID_MJPEG, "mjpeg", "Motion JPEG")]
    }
}

/// Register all rate-control models provided by this crate.
pub fn register_models(registry: &mut RateControlRegistry) {
    registry.register_model::<RateController>();
    registry.register_model::<NullRateControl>();
}

/// Correct out-of-range configuration values in place.
fn sanitize(cfg: &mut RcCfg) {
    if cfg.stat_times <= 0 {
        cfg.stat_times = 3;
    }

    if cfg.max_i_bit_prop <= 0 {
        cfg.max_i_bit_prop = 10;
    }
    else if cfg.max_i_bit_prop > 100 {
        cfg.max_i_bit_prop = 100;
    }

    if cfg.igop <= 0 {
        info!("infinite gop, using {} frames for bit allocation", INFINITE_GOP_LEN);
        cfg.igop = INFINITE_GOP_LEN;
    }
}
