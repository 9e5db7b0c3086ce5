// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The feedback laws. Each law folds the bitrate deviations observed so far into `next_ratio`, a
//! QP correction in the scaled (QP×64) representation that the QP decider applies to the next
//! frame.

use log::debug;

use pacer_core::rc::{FrameKind, RcTaskInfo};
use pacer_core::units::ScaledQp;

use crate::RateController;

/// A cheap natural-logarithm approximation for bitrate ratios: entry `i` holds
/// `round(ln(i / 32) * 352)`. An instantaneous-over-target bitrate ratio maps to an index via
/// `(bps << 5) / target_bps`, clamped into the table.
#[rustfmt::skip]
pub(crate) const TAB_LNX: [i32; 64] = [
    -1216, -972, -830, -729, -651, -587, -533, -486,
     -445, -408, -374, -344, -316, -290, -265, -243,
     -221, -201, -182, -164, -147, -131, -115, -100,
      -86,  -72,  -59,  -46,  -34,  -22,  -11,    0,
       10,   21,   31,   41,   50,   60,   69,   78,
       86,   95,   87,  103,  111,  119,  127,  134,
      142,  149,  156,  163,  170,  177,  183,  190,
      196,  202,  208,  214,  220,  226,  232,  237,
];

/// Per-QP caps on the accumulated INTRA correction, indexed by the previous INTRA QP. The higher
/// the QP already is, the less an oversized INTRA frame may push it further.
#[rustfmt::skip]
pub(crate) const MAX_I_DELTA_QP: [i32; 51] = [
    640, 640, 640, 640, 640, 640, 640, 640, 640, 640, 640, 640, 640, 640,
    576, 576, 512, 512, 448, 448, 384, 384, 320, 320, 320, 256, 256, 256,
    192, 192, 192, 192, 192, 128, 128, 128, 128, 128, 128,  64,  64,  64,
     64,  64,  64,   0,   0,   0,   0,   0,   0,
];

#[inline]
fn lnx(idx: i64) -> i64 {
    i64::from(TAB_LNX[idx.clamp(0, 63) as usize])
}

impl RateController {
    /// Accumulate the INTRA overshoot correction after a finished INTRA frame. The correction is
    /// applied on top of the regulated QP when the next INTRA frame is estimated.
    pub(crate) fn calc_next_i_ratio(&mut self) {
        let Some(bits) = self.bits.as_ref() else { return };

        let max_i_prop = i64::from(self.cfg.max_i_bit_prop) * 16;
        let gop_len = i64::from(self.cfg.igop);

        let bits_alloc = if gop_len > 1 {
            bits.gop_total_bits * max_i_prop / (max_i_prop + 16 * (gop_len - 1))
        }
        else {
            bits.gop_total_bits
        };

        if i64::from(self.pre_real_bits) > bits_alloc || self.next_i_ratio != 0 {
            let mut ratio = ((i64::from(self.pre_real_bits) - bits_alloc) << 8) / bits_alloc;

            ratio = ratio.clamp(-256, 256) + i64::from(self.next_i_ratio);
            if ratio >= 0 {
                let cap = i64::from(MAX_I_DELTA_QP[self.pre_i_qp.clamp(0, 50) as usize]);
                ratio = ratio.min(cap);
            }
            else {
                ratio = 0;
            }

            self.next_i_ratio = ratio as i32;
            debug!("next i ratio {}", self.next_i_ratio);
        }
    }

    /// The first-pass CBR law: combine the previous frame's budget miss, the instantaneous
    /// bitrate trend, the absolute bitrate deviation, and the bucket water level.
    pub(crate) fn calc_cbr_ratio(&mut self) {
        let Some(bits) = self.bits.as_ref() else { return };

        let target_bps = i64::from(bits.target_bps);
        let ins_bps = i64::from(self.ins_bps);
        let pre_ins_bps = i64::from(self.last_inst_bps);
        let pre_target_bits = i64::from(self.pre_target_bits);
        let pre_real_bits = i64::from(self.pre_real_bits);
        let fluc_l = 3;

        debug_assert!(target_bps > 0);
        debug_assert!(pre_target_bits != 0);

        let mut bit_diff_ratio = if pre_target_bits > pre_real_bits {
            52 * (pre_real_bits - pre_target_bits) / pre_target_bits
        }
        else {
            64 * (pre_real_bits - pre_target_bits) / pre_target_bits
        };

        let mut ins_ratio = lnx((ins_bps << 5) / target_bps) - lnx((pre_ins_bps << 5) / target_bps);
        let mut flag = false;

        // A rising instantaneous bitrate already within a sixteenth of the target is punished
        // hard; a falling one just above the target is rewarded. Outside those bands the trend
        // term is dropped, except for a severe undershoot, which passes through saturated.
        if ins_bps > pre_ins_bps && target_bps - pre_ins_bps < (target_bps >> 4) {
            ins_ratio *= 6;
        }
        else if ins_bps < pre_ins_bps && pre_ins_bps - target_bps < (target_bps >> 4) {
            ins_ratio *= 4;
        }
        else if bit_diff_ratio < -128 {
            ins_ratio = -128;
            flag = true;
        }
        else {
            ins_ratio = 0;
        }

        bit_diff_ratio = bit_diff_ratio.clamp(-128, 256);
        if !flag {
            ins_ratio = ins_ratio.clamp(-128, 256) + bit_diff_ratio;
        }

        let bps_ratio = ((ins_bps - target_bps) * fluc_l / (target_bps >> 4)).clamp(-32, 32);
        let wl_ratio =
            (4 * (bits.stat_watl - bits.watl_base) * fluc_l / bits.watl_base).clamp(-16, 32);

        self.next_ratio = (ins_ratio + bps_ratio + wl_ratio) as i32;

        debug!(
            "cbr ratios: diff {} ins {} bps {} wl {} -> next {}",
            bit_diff_ratio,
            ins_ratio - if flag { 0 } else { bit_diff_ratio },
            bps_ratio,
            wl_ratio,
            self.next_ratio
        );
    }

    /// The re-encode CBR law, run on a just-finished oversized frame. The statistics window has
    /// not been committed yet, so the instantaneous bitrate substitutes the actual frame size for
    /// the oldest window sample.
    pub(crate) fn reenc_calc_cbr_ratio(&mut self, info: &RcTaskInfo) {
        let Some(bits) = self.bits.as_ref() else { return };

        let stat_time = i64::from(self.cfg.stat_times);
        let pre_ins_bps = bits.stat_bits.sum() / stat_time;
        let ins_bps =
            (pre_ins_bps * stat_time - bits.stat_bits.val(0) + i64::from(info.bit_real)) / stat_time;
        let real_bit = i64::from(info.bit_real);
        let target_bit = i64::from(info.bit_target);
        let target_bps = i64::from(bits.target_bps);

        let water_level = if real_bit + bits.stat_watl > bits.watl_thrd {
            bits.watl_thrd - i64::from(bits.bit_per_frame)
        }
        else {
            real_bit + bits.stat_watl - i64::from(bits.bit_per_frame)
        };
        let water_level = water_level.max(0);

        let mut bit_diff_ratio = if target_bit > real_bit {
            32 * (real_bit - target_bit) / target_bit
        }
        else {
            48 * (real_bit - target_bit) / real_bit
        };

        let mut ins_ratio = lnx(ins_bps / (target_bps >> 5)) - lnx(pre_ins_bps / (target_bps >> 5));
        let bps_ratio = (96 * (ins_bps - target_bps) / target_bps).clamp(-32, 32);
        let wl_ratio = (32 * (water_level - bits.watl_base) / bits.watl_base).clamp(-32, 32);

        if pre_ins_bps < ins_bps && target_bps != pre_ins_bps {
            ins_ratio = (6 * ins_ratio).clamp(-192, 256);
        }
        else if self.frame_kind == FrameKind::Intra {
            ins_ratio = (3 * ins_ratio).clamp(-192, 256);
        }
        else {
            ins_ratio = 0;
        }

        bit_diff_ratio = bit_diff_ratio.clamp(-128, 256);

        self.next_ratio = (bit_diff_ratio + ins_ratio + bps_ratio + wl_ratio) as i32;

        // For an INTRA frame the encoder's complexity indicator allows a direct fit of the QP
        // that would have hit the budget; jump there when it exceeds the regulated QP.
        if self.frame_kind == FrameKind::Intra && info.madi > 0 {
            let mb_w = (self.cfg.width + 15) / 16;
            let mb_h = (self.cfg.height + 15) / 16;
            let tar_bpp = target_bit / i64::from(mb_w * mb_h);

            if tar_bpp > 0 {
                let lnb_t = (tar_bpp as f64).ln();
                let (a, b, c) = (-0.1435, 0.0438, 6.7204);
                let qp_c = ((lnb_t - f64::from(info.madi) * b - c) / a + 14.0) as i32;

                if qp_c > self.cur_scale_qp.qp() {
                    self.next_ratio = ScaledQp::from_qp(qp_c).raw() - self.cur_scale_qp.raw();
                }
            }
        }

        debug!(
            "cbr re-encode: target {} real {} next ratio {}",
            target_bit, real_bit, self.next_ratio
        );
    }

    /// The first-pass VBR law. VBR regulates around the maximum bitrate, accepts undershoot, and
    /// reacts mostly to the instantaneous bitrate exceeding it.
    pub(crate) fn calc_vbr_ratio(&mut self) {
        let Some(bits) = self.bits.as_ref() else { return };

        let bps_change = i64::from(bits.target_bps);
        let max_bps_target = i64::from(self.cfg.bps_max);
        let ins_bps = i64::from(self.ins_bps);
        let pre_ins_bps = i64::from(self.last_inst_bps);
        let pre_target_bits = i64::from(self.pre_target_bits);
        let pre_real_bits = i64::from(self.pre_real_bits);

        debug_assert!(max_bps_target > 0);
        debug_assert!(pre_target_bits != 0);

        let mut bit_diff_ratio = if pre_target_bits > pre_real_bits {
            32 * (pre_real_bits - pre_target_bits) / pre_target_bits
        }
        else {
            64 * (pre_real_bits - pre_target_bits) / pre_target_bits
        };

        let mut ins_ratio =
            lnx(ins_bps / (max_bps_target >> 5)) - lnx(pre_ins_bps / (max_bps_target >> 5));

        if ins_bps <= bps_change || (ins_bps > bps_change && ins_bps <= pre_ins_bps) {
            let falling = ins_bps < pre_ins_bps && bps_change > pre_ins_bps;
            if falling {
                ins_ratio *= 3;
            }
            else {
                bit_diff_ratio = bit_diff_ratio.clamp(-128, 256);
            }
        }
        else {
            ins_ratio *= 6;
        }
        ins_ratio = ins_ratio.clamp(-128, 256);

        let bps_ratio = (3 * (ins_bps - bps_change) / (max_bps_target >> 4)).clamp(-16, 32);

        // A very costly INTRA frame dominates the GOP budget; damp the per-frame terms so the
        // regulated QP does not swing with it.
        if bits.i_scale > 640 {
            bit_diff_ratio = bit_diff_ratio.clamp(-16, 32);
            ins_ratio = ins_ratio.clamp(-16, 32);
        }

        self.next_ratio = (bit_diff_ratio + ins_ratio + bps_ratio) as i32;

        debug!(
            "vbr ratios: diff {} ins {} bps {} -> next {}",
            bit_diff_ratio, ins_ratio, bps_ratio, self.next_ratio
        );
    }

    /// The re-encode VBR law. Only a rising instantaneous bitrate already above the regulated
    /// rate contributes a trend term.
    pub(crate) fn reenc_calc_vbr_ratio(&mut self, info: &RcTaskInfo) {
        let Some(bits) = self.bits.as_ref() else { return };

        let stat_time = i64::from(self.cfg.stat_times);
        let pre_ins_bps = bits.stat_bits.sum() / stat_time;
        let ins_bps =
            (pre_ins_bps * stat_time - bits.stat_bits.val(0) + i64::from(info.bit_real)) / stat_time;
        let bps_change = i64::from(bits.target_bps);
        let max_bps_target = i64::from(self.cfg.bps_max);
        let real_bit = i64::from(info.bit_real);
        let target_bit = i64::from(info.bit_target);

        let bit_diff_ratio = if target_bit <= real_bit {
            32 * (real_bit - target_bit) / target_bit
        }
        else {
            32 * (real_bit - target_bit) / real_bit
        };

        let ins_ratio = if pre_ins_bps < ins_bps && bps_change < ins_bps {
            let raw =
                lnx(ins_bps / (max_bps_target >> 5)) - lnx(pre_ins_bps / (max_bps_target >> 5));
            (6 * raw).clamp(-192, 256)
        }
        else {
            0
        };

        let bps_ratio = (96 * (ins_bps - bps_change) / bps_change).clamp(-32, 32);

        self.next_ratio =
            (bit_diff_ratio.clamp(-128, 256) + ins_ratio + bps_ratio) as i32;

        debug!("vbr re-encode next ratio {}", self.next_ratio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::rc::{FpsCfg, GopMode, RcCfg, RcMode};

    use crate::RateController;

    fn controller(mode: RcMode) -> RateController {
        let cfg = RcCfg {
            mode,
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
        };
        RateController::try_new(&cfg).unwrap()
    }

    #[test]
    fn verify_cbr_ratio_steady_state_is_zero() {
        let mut rc = controller(RcMode::Cbr);

        rc.pre_target_bits = 33_333;
        rc.pre_real_bits = 33_333;
        rc.ins_bps = 1_000_000;
        rc.last_inst_bps = 1_000_000;

        rc.calc_cbr_ratio();
        assert_eq!(rc.next_ratio, 0);
    }

    #[test]
    fn verify_cbr_ratio_raises_qp_on_overshoot() {
        let mut rc = controller(RcMode::Cbr);

        // The last frame doubled its budget and the instantaneous bitrate is rising through the
        // target.
        rc.pre_target_bits = 33_333;
        rc.pre_real_bits = 66_666;
        rc.ins_bps = 1_150_000;
        rc.last_inst_bps = 990_000;

        rc.calc_cbr_ratio();
        assert!(rc.next_ratio > 0);
    }

    #[test]
    fn verify_cbr_ratio_lowers_qp_on_undershoot() {
        let mut rc = controller(RcMode::Cbr);

        // Far below budget with a falling instantaneous bitrate well under the target.
        rc.pre_target_bits = 33_333;
        rc.pre_real_bits = 3_000;
        rc.ins_bps = 500_000;
        rc.last_inst_bps = 600_000;

        rc.calc_cbr_ratio();
        assert!(rc.next_ratio < 0);
    }

    #[test]
    fn verify_vbr_ratio_damps_when_i_scale_high() {
        let mut rc = controller(RcMode::Vbr);

        rc.pre_target_bits = 100_000;
        rc.pre_real_bits = 10_000;
        rc.ins_bps = 1_000_000;
        rc.last_inst_bps = 1_100_000;
        rc.bits.as_mut().unwrap().i_scale = 700;

        rc.calc_vbr_ratio();

        // diff and trend terms are each damped into [-16, 32]:
        // diff = 32 * -90000 / 100000 = -28 -> -16, trend = 3 * (lnx(26) - lnx(29)) = -111 -> -16,
        // bps = 3 * -200000 / 75000 = -8.
        assert_eq!(rc.next_ratio, -40);
    }

    #[test]
    fn verify_next_i_ratio_capped_by_qp_table() {
        let mut rc = controller(RcMode::Cbr);

        rc.pre_i_qp = 30;
        rc.pre_real_bits = 3_000_000;

        rc.calc_next_i_ratio();
        assert_eq!(rc.next_i_ratio, MAX_I_DELTA_QP[30]);
    }

    #[test]
    fn verify_next_i_ratio_never_negative() {
        let mut rc = controller(RcMode::Cbr);

        // A previous correction exists but the last INTRA frame fit its budget comfortably: the
        // correction decays to zero instead of going negative.
        rc.pre_i_qp = 30;
        rc.next_i_ratio = 64;
        rc.pre_real_bits = 1_000;

        rc.calc_next_i_ratio();
        assert_eq!(rc.next_i_ratio, 0);
    }
}
