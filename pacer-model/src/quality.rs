// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The QP decision: maps the regulated scaled QP, the pending corrections, and the per-type QP
//! deltas onto the starting QP of the upcoming frame.

use log::{debug, warn};

use pacer_core::rc::{RcTask, RefMode};
use pacer_core::units::ScaledQp;

use crate::RateController;

/// Macroblock-count buckets for the first-INTRA QP estimate.
#[rustfmt::skip]
const MB_NUM: [i32; 9] = [
    0,      200,    700,    1200,
    2000,   4000,   8000,   16000,
    20000,
];

/// Per-bucket nominal bits per macroblock at quantizer scale 1.
#[rustfmt::skip]
const TAB_BIT: [i32; 9] = [
    3780,  3570,  3150,  2940,
    2730,  3780,  2100,  1680,
    2100,
];

/// Quantizer scale to QP.
#[rustfmt::skip]
const QSCALE2QP: [i32; 96] = [
    15,  15,  15,  15,  15,  16, 18, 20, 21, 22, 23,
    24,  25,  25,  26,  27,  28, 28, 29, 29, 30, 30,
    30,  31,  31,  32,  32,  33, 33, 33, 34, 34, 34,
    34,  35,  35,  35,  36,  36, 36, 36, 36, 37, 37,
    37,  37,  38,  38,  38,  38, 38, 39, 39, 39, 39,
    39,  39,  40,  40,  40,  40, 41, 41, 41, 41, 41,
    41,  41,  42,  42,  42,  42, 42, 42, 42, 42, 43,
    43,  43,  43,  43,  43,  43, 43, 44, 44, 44, 44,
    44,  44,  44,  44,  45,  45, 45, 45,
];

/// Caps on the INTRA QP reduction, indexed by the mean complexity of recent P frames. Busy
/// content gets a smaller reduction.
const MAX_IP_QP_DELTA: [i32; 8] = [7, 7, 7, 7, 6, 4, 3, 2];

/// Estimate the starting QP of the very first INTRA frame from its bit budget and the frame size
/// in macroblocks.
fn first_intra_start_qp(target_bits: i32, total_mbs: i32) -> i32 {
    let mut cnt = 0;

    for i in 0..8 {
        if MB_NUM[i] > total_mbs {
            break;
        }
        cnt += 1;
    }

    let qscale = (i64::from(total_mbs) * i64::from(TAB_BIT[cnt]) - 350) / i64::from(target_bits);
    QSCALE2QP[qscale.clamp(4, 95) as usize]
}

impl RateController {
    /// Decide `quality_target` for the frame. Forced-QP and `FixQp` requests are handled by the
    /// caller; this is the regulated path.
    pub(crate) fn decide_quality(&mut self, task: &mut RcTask) {
        let frm = task.frm;
        let info = &mut task.info;
        let i_quality_delta = self.cfg.i_quality_delta;
        let vi_quality_delta = self.cfg.vi_quality_delta;

        if self.first_frame && frm.is_intra {
            if info.quality_target < 0 {
                if info.bit_target != 0 {
                    let mb_w = (self.cfg.width + 15) / 16;
                    let mb_h = (self.cfg.height + 15) / 16;

                    self.start_qp = first_intra_start_qp(info.bit_target, mb_w * mb_h);
                    self.cur_scale_qp = ScaledQp::from_qp(self.start_qp);
                    debug!(
                        "first intra: {} mbs, {} target bits, start qp {}",
                        mb_w * mb_h,
                        info.bit_target,
                        self.start_qp
                    );
                }
                else {
                    warn!("no bit budget for the first intra frame, starting at qp 26");
                    info.quality_target = 26;
                    self.start_qp = 26;
                    self.cur_scale_qp = ScaledQp::from_qp(26);
                }
            }
            else {
                self.start_qp = info.quality_target;
                self.cur_scale_qp = ScaledQp::from_qp(self.start_qp);
            }

            if self.reenc_cnt > 0 {
                self.cur_scale_qp += self.next_ratio;
                self.start_qp = self.cur_scale_qp.qp();
            }
            else {
                self.start_qp -= i_quality_delta;
            }

            self.cur_scale_qp = self.cur_scale_qp.clamp_to(info.quality_min, info.quality_max);
            self.pre_i_qp = self.cur_scale_qp.qp();
        }
        else {
            let qp_scale = (self.cur_scale_qp + self.next_ratio)
                .clamp_to(info.quality_min, info.quality_max);

            if frm.is_intra {
                let start_qp = (self.pre_i_qp + (qp_scale + self.next_i_ratio).qp()) >> 1;
                let start_qp = start_qp.clamp(info.quality_min, info.quality_max);

                self.pre_i_qp = start_qp;
                self.start_qp = start_qp;
                self.cur_scale_qp = qp_scale;

                // The INTRA reduction follows the observed P-frame complexity, except on a
                // re-encode pass where lowering the QP again would defeat the correction.
                let mut delta_qp = 0;
                if i_quality_delta != 0 && self.reenc_cnt == 0 {
                    let madi_mean = self.bits.as_ref().map_or(0, |b| b.madi.mean());
                    let index = (madi_mean / 4).clamp(0, 7) as usize;
                    delta_qp = MAX_IP_QP_DELTA[index].min(i_quality_delta);
                }
                if i_quality_delta != 0 {
                    self.start_qp -= delta_qp;
                }
            }
            else {
                self.cur_scale_qp = qp_scale;
                self.start_qp = qp_scale.qp();

                if frm.ref_mode == RefMode::ToPrevIntra && vi_quality_delta != 0 {
                    self.start_qp -= vi_quality_delta;
                }
            }
        }

        self.start_qp = self.start_qp.clamp(info.quality_min, info.quality_max);
        info.quality_target = self.start_qp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_first_intra_qp_for_1080p() {
        // 1920x1080: 120x68 macroblocks. The count lands in the last open bucket, so the
        // quantizer scale is (8160 * 1680 - 350) / 500000 = 27, which maps to qp 33.
        assert_eq!(first_intra_start_qp(500_000, 120 * 68), 33);
    }

    #[test]
    fn verify_first_intra_qp_is_clamped() {
        // A tiny budget drives the quantizer scale past the table; the estimate saturates.
        assert_eq!(first_intra_start_qp(1, 120 * 68), QSCALE2QP[95]);
        // A huge budget saturates at the lower bound.
        assert_eq!(first_intra_start_qp(i32::MAX, 120 * 68), QSCALE2QP[4]);
    }

    #[test]
    fn verify_first_intra_qp_bucket_walk() {
        // 64 macroblocks stays in the first bucket (QCIF-class sizes): the quantizer scale is
        // (64 * 3570 - 350) / 10000 = 22.
        assert_eq!(first_intra_start_qp(10_000, 64), QSCALE2QP[22]);
    }
}
