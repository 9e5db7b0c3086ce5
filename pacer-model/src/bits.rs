// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit accounting: per-frame-type bit histories, frame-type scales, and the leaky-bucket water
//! level, plus the per-frame bit budget allocation derived from them.

use log::debug;

use pacer_core::errors::{invalid_config_error, Result};
use pacer_core::rc::{FrameKind, GopMode, RcCfg, RcMode};

use crate::window::SlidingWindow;

const I_WINDOW_LEN: usize = 2;
const P_WINDOW_LEN: usize = 5;
const MADI_WINDOW_LEN: usize = 8;

/// Frame-type scales are fixed-point bit-cost weights where a P frame is pinned at 16. An INTRA
/// frame that costs ten times the bits of a P frame has a scale of 160.
const P_FRAME_SCALE: i64 = 16;

/// The bit accountant of a rate-controlled stream.
///
/// Tracks how many bits recent frames of each type consumed, derives per-type cost scales from
/// those histories, and maintains a leaky-bucket water level measuring short-term bitrate
/// deviation. The allocator converts the GOP bit budget and the scales into a per-frame target.
pub(crate) struct BitsModel {
    pub(crate) target_bps: i32,
    pub(crate) bit_per_frame: i32,
    pub(crate) gop_total_bits: i64,

    pub(crate) i_bit: SlidingWindow,
    pub(crate) vi_bit: SlidingWindow,
    pub(crate) p_bit: SlidingWindow,
    pub(crate) madi: SlidingWindow,
    pub(crate) stat_bits: SlidingWindow,
    pub(crate) stat_rate: SlidingWindow,

    pub(crate) i_sumbits: i64,
    pub(crate) vi_sumbits: i64,
    pub(crate) p_sumbits: i64,
    pub(crate) i_scale: i64,
    pub(crate) vi_scale: i64,
    pub(crate) p_scale: i64,

    pub(crate) watl_thrd: i64,
    pub(crate) stat_watl: i64,
    pub(crate) watl_base: i64,
}

impl BitsModel {
    /// Create the accountant for a sanitized configuration. Never called in `FixQp` mode.
    pub(crate) fn new(cfg: &RcCfg) -> Result<BitsModel> {
        let fps = cfg.fps;

        if fps.fps_in_num <= 0 || fps.fps_out_num <= 0 || fps.fps_out_denorm <= 0 {
            return invalid_config_error("rc: frame rates must be positive");
        }

        let target_bps = match cfg.mode {
            RcMode::Cbr => cfg.bps_target,
            _ => cfg.bps_max,
        };

        if target_bps <= 0 {
            return invalid_config_error("rc: target bitrate must be positive");
        }

        if cfg.gop_mode == GopMode::SmartP && cfg.vgop <= 1 {
            return invalid_config_error("rc: smart-p requires a virtual gop of at least 2 frames");
        }

        let gop_len = i64::from(cfg.igop);
        let gop_bits = gop_len * i64::from(target_bps) * i64::from(fps.fps_out_denorm);
        let gop_total_bits = gop_bits / i64::from(fps.fps_out_num);

        let stat_len = (fps.fps_in_num * cfg.stat_times) as usize;
        let bit_per_frame = target_bps / fps.fps_in_num;
        let watl_thrd = 3 * i64::from(target_bps);

        let mut model = BitsModel {
            target_bps,
            bit_per_frame,
            gop_total_bits,
            i_bit: SlidingWindow::new(I_WINDOW_LEN)?,
            vi_bit: SlidingWindow::new(I_WINDOW_LEN)?,
            p_bit: SlidingWindow::new(P_WINDOW_LEN)?,
            madi: SlidingWindow::new(MADI_WINDOW_LEN)?,
            stat_rate: SlidingWindow::new(fps.fps_in_num as usize)?,
            stat_bits: SlidingWindow::new(stat_len)?,
            i_sumbits: 0,
            vi_sumbits: 0,
            p_sumbits: 0,
            i_scale: 0,
            vi_scale: 0,
            p_scale: 0,
            watl_thrd,
            stat_watl: watl_thrd >> 3,
            watl_base: watl_thrd >> 3,
        };

        model.stat_bits.reset(i64::from(bit_per_frame));
        model.seed_frame_scales(cfg);

        debug!(
            "gop {} total bits {} per frame {} statistics time {}s",
            cfg.igop, model.gop_total_bits, model.bit_per_frame, cfg.stat_times
        );

        Ok(model)
    }

    /// Seed the per-type windows and sums from the GOP structure, assuming nominal frame-type
    /// cost ratios until real frames arrive.
    fn seed_frame_scales(&mut self, cfg: &RcCfg) {
        let gop_len = i64::from(cfg.igop);

        match cfg.gop_mode {
            GopMode::NormalP => {
                self.i_scale = 160;
                self.p_scale = P_FRAME_SCALE;

                let p_bit = if gop_len <= 1 {
                    self.gop_total_bits * 16
                }
                else {
                    self.gop_total_bits * 16 / (self.i_scale + self.p_scale * (gop_len - 1))
                };

                self.p_bit.reset(p_bit);
                self.p_sumbits = 5 * p_bit;

                let i_bit = p_bit * self.i_scale / 16;
                self.i_bit.reset(i_bit);
                self.i_sumbits = 2 * i_bit;
            }
            GopMode::SmartP => {
                self.i_scale = 320;
                self.p_scale = P_FRAME_SCALE;
                self.vi_scale = 32;

                let mut vi_num = gop_len / i64::from(cfg.vgop);
                if vi_num > 0 {
                    vi_num -= 1;
                }

                let p_bit = self.gop_total_bits * 16
                    / (self.i_scale + self.vi_scale * vi_num + self.p_scale * (gop_len - vi_num));

                self.p_bit.reset(p_bit);
                self.p_sumbits = 5 * p_bit;

                let i_bit = p_bit * self.i_scale / 16;
                self.i_bit.reset(i_bit);
                self.i_sumbits = 2 * i_bit;

                let vi_bit = p_bit * self.vi_scale / 16;
                self.vi_bit.reset(vi_bit);
                self.vi_sumbits = 2 * vi_bit;
            }
        }

        debug!(
            "seeded sums: p {} i {} vi {}",
            self.p_sumbits, self.i_sumbits, self.vi_sumbits
        );
    }

    /// Commit a finished frame into the histories and drain the leaky bucket by one frame.
    pub(crate) fn update(&mut self, kind: FrameKind, real_bit: i32, madi: i32) {
        let real_bit = i64::from(real_bit);

        self.stat_rate.update(i64::from(real_bit != 0));
        self.stat_bits.update(real_bit);

        // The bucket is read after the per-frame drain, hence additions cap at one drain below
        // the threshold.
        let water_level = if real_bit + self.stat_watl > self.watl_thrd {
            self.watl_thrd - i64::from(self.bit_per_frame)
        }
        else {
            real_bit + self.stat_watl - i64::from(self.bit_per_frame)
        };
        self.stat_watl = water_level.max(0);

        match kind {
            FrameKind::Intra => {
                self.i_bit.update(real_bit);
                self.i_sumbits = self.i_bit.sum();
                self.i_scale = 80 * self.i_sumbits / (2 * self.p_sumbits);
            }
            FrameKind::InterP => {
                self.p_bit.update(real_bit);
                self.madi.update(i64::from(madi));
                self.p_sumbits = self.p_bit.sum();
                self.p_scale = P_FRAME_SCALE;
            }
            FrameKind::InterVi => {
                self.vi_bit.update(real_bit);
                self.vi_sumbits = self.vi_bit.sum();
                self.vi_scale = 80 * self.vi_sumbits / (2 * self.p_sumbits);
            }
        }
    }

    /// Allocate the bit budget for the upcoming frame. Returns the target along with the
    /// instantaneous bitrate estimate over the statistics window.
    pub(crate) fn alloc(&mut self, cfg: &RcCfg, kind: FrameKind) -> (i32, i32) {
        let max_i_prop = i64::from(cfg.max_i_bit_prop) * 16;
        let gop_len = i64::from(cfg.igop);
        let mut total_bits = self.gop_total_bits;
        let ins_bps = self.stat_bits.sum() / i64::from(cfg.stat_times);

        self.i_scale = 80 * self.i_sumbits / (2 * self.p_sumbits);
        let mut i_scale = self.i_scale;

        let alloc_bits = if cfg.gop_mode == GopMode::SmartP {
            let mut vi_num = gop_len / i64::from(cfg.vgop);
            if vi_num > 0 {
                vi_num -= 1;
            }

            match kind {
                FrameKind::Intra => {
                    i_scale = i_scale.clamp(16, 16000);
                    total_bits *= i_scale;
                }
                FrameKind::InterP => {
                    i_scale = i_scale.clamp(16, max_i_prop);
                    total_bits *= 16;
                }
                FrameKind::InterVi => {
                    i_scale = i_scale.clamp(16, max_i_prop);
                    total_bits *= self.vi_scale;
                }
            }

            total_bits / (i_scale + 16 * (gop_len - vi_num) + vi_num * self.vi_scale)
        }
        else {
            match kind {
                FrameKind::Intra => {
                    i_scale = if cfg.mode == RcMode::Cbr {
                        i_scale.clamp(16, 800)
                    }
                    else {
                        i_scale.clamp(16, 16000)
                    };
                    total_bits *= i_scale;
                }
                FrameKind::InterP => {
                    i_scale = i_scale.clamp(16, max_i_prop);
                    total_bits *= 16;
                }
                FrameKind::InterVi => (),
            }

            if gop_len > 1 {
                total_bits / (i_scale + 16 * (gop_len - 1))
            }
            else {
                total_bits / i_scale
            }
        };

        debug!("frame {:?} i scale {} allocated {} bits", kind, i_scale, alloc_bits);

        (alloc_bits as i32, ins_bps as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::rc::FpsCfg;

    fn cbr_cfg() -> RcCfg {
        RcCfg {
            mode: RcMode::Cbr,
            gop_mode: GopMode::NormalP,
            igop: 60,
            bps_target: 1_000_000,
            bps_max: 1_200_000,
            fps: FpsCfg { fps_in_num: 30, fps_out_num: 30, fps_out_denorm: 1 },
            stat_times: 3,
            max_i_bit_prop: 30,
            width: 1920,
            height: 1080,
            ..Default::default()
        }
    }

    #[test]
    fn verify_normal_p_seeding() {
        let model = BitsModel::new(&cbr_cfg()).unwrap();

        // 60 frames at 1 Mbps over 30 fps.
        assert_eq!(model.gop_total_bits, 2_000_000);
        assert_eq!(model.bit_per_frame, 33_333);
        assert_eq!(model.watl_thrd, 3_000_000);
        assert_eq!(model.stat_watl, 375_000);

        // p_bit = 2e6 * 16 / (160 + 16 * 59)
        assert_eq!(model.p_bit.val(0), 28_985);
        assert_eq!(model.p_sumbits, 5 * 28_985);
        assert_eq!(model.i_bit.val(0), 28_985 * 10);
        assert_eq!(model.i_sumbits, 2 * 289_850);
        assert_eq!(model.stat_bits.sum(), 90 * 33_333);
    }

    #[test]
    fn verify_smart_p_seeding() {
        let cfg = RcCfg { gop_mode: GopMode::SmartP, vgop: 15, ..cbr_cfg() };
        let model = BitsModel::new(&cfg).unwrap();

        // vi_num = 60 / 15 - 1 = 3, p_bit = 2e6 * 16 / (320 + 3 * 32 + 16 * 57).
        assert_eq!(model.p_bit.val(0), 24_096);
        assert_eq!(model.i_bit.val(0), 24_096 * 20);
        assert_eq!(model.vi_bit.val(0), 24_096 * 2);
    }

    #[test]
    fn verify_smart_p_requires_vgop() {
        let cfg = RcCfg { gop_mode: GopMode::SmartP, vgop: 1, ..cbr_cfg() };
        assert!(BitsModel::new(&cfg).is_err());
    }

    #[test]
    fn verify_water_level_stays_bounded() {
        let mut model = BitsModel::new(&cbr_cfg()).unwrap();

        // A burst of oversized frames saturates one drain below the threshold.
        for _ in 0..10 {
            model.update(FrameKind::InterP, 4_000_000, 0);
            assert!(model.stat_watl >= 0 && model.stat_watl <= model.watl_thrd);
        }
        assert_eq!(model.stat_watl, model.watl_thrd - i64::from(model.bit_per_frame));

        // Idle frames drain the bucket to empty, never below zero.
        for _ in 0..200 {
            model.update(FrameKind::InterP, 0, 0);
            assert!(model.stat_watl >= 0);
        }
        assert_eq!(model.stat_watl, 0);
    }

    #[test]
    fn verify_alloc_budgets() {
        let cfg = cbr_cfg();
        let mut model = BitsModel::new(&cfg).unwrap();

        // INTRA under CBR: i_scale = 160, budget = 2e6 * 160 / (160 + 16 * 59).
        let (i_target, ins_bps) = model.alloc(&cfg, FrameKind::Intra);
        assert_eq!(i_target, 289_855);
        assert_eq!(ins_bps, 999_990);

        // INTER_P: budget = 2e6 * 16 / (160 + 16 * 59).
        let (p_target, _) = model.alloc(&cfg, FrameKind::InterP);
        assert_eq!(p_target, 28_985);

        // The INTRA budget never exceeds one GOP.
        assert!(i64::from(i_target) < model.gop_total_bits);
    }

    #[test]
    fn verify_update_tracks_scales() {
        let cfg = cbr_cfg();
        let mut model = BitsModel::new(&cfg).unwrap();

        // Feed P frames at exactly the seeded cost: p_sumbits holds and i_scale is unchanged.
        for _ in 0..5 {
            model.update(FrameKind::InterP, 28_985, 16);
        }
        assert_eq!(model.p_sumbits, 5 * 28_985);

        // An INTRA frame at twenty P costs raises i_scale above its seed of 160.
        model.update(FrameKind::Intra, 20 * 28_985, 0);
        assert!(model.i_scale > 160);
        assert_eq!(model.madi.newest(), 16);
    }
}
